//! The seam between [`Stack`](crate::Stack) and its memory reclamation scheme.
//!
//! A pop unlinks a node with a single CAS, but other threads may have loaded
//! the same node just before and still be about to read its `next` link. The
//! node can therefore not be freed on the spot: it is *retired* instead, and
//! the scheme frees it once no such reader can remain. Freeing it early lets
//! the allocator hand the same address to a later push, and a stale
//! `CAS(top, old, old.next)` would then succeed against a different node (the
//! ABA problem).

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;

use crate::error::ReclaimError;

/// Type-erased destructor for a retired record
pub(crate) type FreeFn = unsafe fn(NonNull<u8>, *const ());

/// An unlinked node handed over for deferred freeing.
///
/// The record only knows the node's address and how to free it, so a scheme
/// can hold records of any node type in one list.
pub struct Retired {
    ptr: NonNull<u8>,
    context: *const (),
    free: FreeFn,
}

// The record owns the unlinked node; the context outlives every record.
unsafe impl Send for Retired {}

impl Retired {
    /// # Safety
    ///
    /// `free(ptr, context)` must be sound to call exactly once, from any
    /// thread, at any point before `context` is torn down.
    pub(crate) unsafe fn new(ptr: NonNull<u8>, context: *const (), free: FreeFn) -> Self {
        Retired { ptr, context, free }
    }

    /// Address of the retired node, as published in hazard slots.
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Frees the node.
    ///
    /// # Safety
    ///
    /// No thread may still hold a reference to the node.
    pub unsafe fn reclaim(self) {
        unsafe { (self.free)(self.ptr, self.context) }
    }
}

/// A live critical section handed out by [`Reclaim::pin`].
pub trait Protect {
    /// Loads `src` and keeps the returned node from being freed for as long
    /// as this guard lives, or until the next call to `protect`.
    fn protect<T>(&mut self, src: &AtomicPtr<T>) -> *mut T;
}

/// A memory reclamation scheme.
///
/// # Safety
///
/// Implementors must never free a retired record while a guard that could
/// have protected it (pinned before it was unlinked) is still alive.
pub unsafe trait Reclaim: Send + Sync {
    type Guard<'r>: Protect
    where
        Self: 'r;

    /// Enters a critical section, or reports that the scheme has no capacity
    /// left for another one right now.
    fn try_pin(&self) -> Result<Self::Guard<'_>, ReclaimError>;

    /// Enters a critical section, waiting for capacity if necessary.
    fn pin(&self) -> Self::Guard<'_> {
        let backoff = Backoff::new();
        loop {
            match self.try_pin() {
                Ok(guard) => return guard,
                Err(_) => backoff.snooze(),
            }
        }
    }

    /// Takes ownership of an unlinked node and frees it once no guard can
    /// still reference it. Blocks while the calling thread holds more
    /// unreclaimed records than the scheme allows.
    ///
    /// # Safety
    ///
    /// The record's node must already be unreachable from the shared
    /// structure, retired only once, and `guard` must belong to `self`. The
    /// caller must not dereference anything it protected through `guard`
    /// after this call.
    unsafe fn retire<'r>(&'r self, guard: &mut Self::Guard<'r>, retired: Retired);

    /// Frees whatever the calling thread can safely free right now.
    fn collect(&self);

    fn stats(&self) -> ReclaimStats;
}

/// Counters describing a scheme's reclamation progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReclaimStats {
    pub retired: usize,
    pub reclaimed: usize,
}

impl ReclaimStats {
    /// Records retired but not yet freed.
    pub fn pending(&self) -> usize {
        self.retired.saturating_sub(self.reclaimed)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    retired: AtomicUsize,
    reclaimed: AtomicUsize,
}

impl Counters {
    pub(crate) fn retired(&self) {
        self.retired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reclaimed(&self, count: usize) {
        self.reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ReclaimStats {
        ReclaimStats {
            retired: self.retired.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }
}
