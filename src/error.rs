use std::alloc::Layout;
use std::error;
use std::fmt;

use thiserror::Error;

/// Errors raised by a reclamation scheme's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReclaimError {
    /// Every hazard slot is published by some other in-flight operation.
    #[error("all {slots} hazard pointer slots are in use")]
    SlotsExhausted { slots: usize },
    /// Too many retired nodes are waiting for the threads inside to leave.
    #[error("{pending} retired nodes are waiting for reclamation (limit {limit})")]
    PendingLimit { pending: usize, limit: usize },
}

/// The global allocator could not provide memory for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed to allocate a {size} byte stack node (align {align})")]
pub struct AllocError {
    pub size: usize,
    pub align: usize,
}

impl AllocError {
    pub(crate) fn new(layout: Layout) -> Self {
        AllocError {
            size: layout.size(),
            align: layout.align(),
        }
    }

    pub(crate) fn layout(&self) -> Layout {
        // Built from a valid layout in `new`.
        Layout::from_size_align(self.size, self.align).unwrap_or(Layout::new::<u8>())
    }
}

/// Error returned by [`Stack::try_push`](crate::Stack::try_push), handing the
/// rejected value back to the caller.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PushError<T> {
    pub value: T,
    pub source: AllocError,
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushError")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "push failed: {}", self.source)
    }
}

impl<T> error::Error for PushError<T> {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.source)
    }
}
