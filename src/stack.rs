use std::alloc::handle_alloc_error;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::config::StackConfig;
use crate::epoch_manager::EpochManager;
use crate::error::{PushError, ReclaimError};
use crate::node::{Node, NodeState};
use crate::node_allocator::NodeAllocator;
use crate::reclaim::{Protect, Reclaim, ReclaimStats};

/// Treiber's lock-free stack.
///
/// Usable with any number of producers and consumers. `push` and `pop` only
/// ever CAS the top pointer; popped nodes are handed to the reclamation
/// scheme `R` and freed once no concurrent `pop` can still be reading them.
pub struct Stack<T, R: Reclaim = EpochManager> {
    top: CachePadded<AtomicPtr<Node<T>>>,
    // Declared before `allocator`: dropping the scheme frees its leftover
    // records through the allocator.
    reclaim: R,
    allocator: Arc<NodeAllocator<T>>,
    config: StackConfig,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send, R: Reclaim> Send for Stack<T, R> {}
unsafe impl<T: Send, R: Reclaim> Sync for Stack<T, R> {}

impl<T> Stack<T> {
    /// Creates a new, empty stack using epoch-based reclamation.
    pub fn new() -> Self {
        Stack::new_with_reclamation(EpochManager::new())
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Stack::new()
    }
}

impl<T, R: Reclaim> Stack<T, R> {
    /// Creates a new, empty stack that retires popped nodes through `reclaim`.
    pub fn new_with_reclamation(reclaim: R) -> Self {
        Stack::with_config(reclaim, StackConfig::default())
    }

    /// Creates a new, empty stack with explicit tuning.
    pub fn with_config(reclaim: R, config: StackConfig) -> Self {
        Stack {
            top: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            reclaim,
            allocator: Arc::new(NodeAllocator::new(config.pool_capacity)),
            config,
            _marker: PhantomData,
        }
    }

    /// Pushes a value on top of the stack.
    ///
    /// Aborts through [`handle_alloc_error`] if no memory is left for the
    /// node; use [`try_push`](Self::try_push) to get the value back instead.
    pub fn push(&self, value: T) {
        if let Err(err) = self.try_push(value) {
            handle_alloc_error(err.source.layout());
        }
    }

    /// Pushes a value on top of the stack, handing it back if its node could
    /// not be allocated.
    pub fn try_push(&self, value: T) -> Result<(), PushError<T>> {
        let node = self
            .allocator
            .allocate(value)
            .map_err(|(value, source)| PushError { value, source })?;

        // Still exclusively ours until the CAS below publishes it
        let node_ref = unsafe { node.as_ref() };
        node_ref.transition(NodeState::Allocated, NodeState::Linked);

        let backoff = Backoff::new();
        let mut current = self.top.load(Ordering::Relaxed);
        loop {
            node_ref.next.store(current, Ordering::Relaxed);

            match self.top.compare_exchange_weak(
                current,
                node.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => {
                    current = actual;
                    self.contend(&backoff);
                }
            }
        }
    }

    /// Attempts to pop the top element from the stack.
    ///
    /// Returns `None` if the stack is empty.
    pub fn pop(&self) -> Option<T> {
        self.pop_pinned(self.reclaim.pin())
    }

    /// Like [`pop`](Self::pop), but reports exhausted reclamation capacity
    /// instead of waiting for it.
    pub fn try_pop(&self) -> Result<Option<T>, ReclaimError> {
        Ok(self.pop_pinned(self.reclaim.try_pin()?))
    }

    fn pop_pinned<'s>(&'s self, mut guard: R::Guard<'s>) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            let current = NonNull::new(guard.protect(&*self.top))?;

            // Protected by `guard`: not freed, so its address is not reused.
            let next = unsafe { current.as_ref() }.next.load(Ordering::Relaxed);

            if self
                .top
                .compare_exchange_weak(
                    current.as_ptr(),
                    next,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                // The CAS made `current` unreachable; we own it now.
                let node = unsafe { current.as_ref() };
                node.transition(NodeState::Linked, NodeState::Unlinked);
                let value = unsafe { ManuallyDrop::into_inner(ptr::read(&node.value)) };

                unsafe {
                    let retired = self.allocator.retired(current);
                    self.reclaim.retire(&mut guard, retired);
                }
                return Some(value);
            }

            self.contend(&backoff);
        }
    }

    /// Returns `true` if the stack is empty.
    ///
    /// Advisory only: another thread may push or pop right after the check.
    pub fn is_empty(&self) -> bool {
        self.top.load(Ordering::Acquire).is_null()
    }

    /// The reclamation scheme this stack retires nodes through.
    pub fn reclamation(&self) -> &R {
        &self.reclaim
    }

    /// Retired and reclaimed node counts of the reclamation scheme.
    pub fn reclaim_stats(&self) -> ReclaimStats {
        self.reclaim.stats()
    }

    /// The tuning this stack was built with.
    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    fn contend(&self, backoff: &Backoff) {
        if self.config.backoff {
            backoff.spin();
        } else {
            std::hint::spin_loop();
        }
    }
}

impl<T, R: Reclaim> Drop for Stack<T, R> {
    fn drop(&mut self) {
        let mut current = std::mem::replace(self.top.get_mut(), ptr::null_mut());

        // it's necessary to manually drop all elements iteratively
        while let Some(node) = NonNull::new(current) {
            unsafe {
                let linked = &mut *node.as_ptr();
                current = *linked.next.get_mut();
                linked.transition(NodeState::Linked, NodeState::Unlinked);
                ManuallyDrop::drop(&mut linked.value);
                self.allocator.deallocate(node);
            }
        }
    }
}

impl<T, R: Reclaim> Extend<T> for Stack<T, R> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.push(value);
        }
    }
}

impl<T> FromIterator<T> for Stack<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut stack = Stack::new();
        stack.extend(iter);
        stack
    }
}

impl<T, R: Reclaim + fmt::Debug> fmt::Debug for Stack<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("is_empty", &self.is_empty())
            .field("reclaim", &self.reclaim)
            .field("config", &self.config)
            .finish()
    }
}
