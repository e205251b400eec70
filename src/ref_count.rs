use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering, fence};

use crossbeam_utils::CachePadded;
use thread_local::ThreadLocal;

use crate::config::ReclaimConfig;
use crate::error::ReclaimError;
use crate::reclaim::{Counters, Protect, Reclaim, ReclaimStats, Retired};

// Pending list entry
struct PendingEntry {
    retired: Retired,
    next: *mut PendingEntry,
}

/// Reclamation by counting the threads inside a critical section.
///
/// A single shared reference count tracks how many guards are alive. A node
/// retired while its retiring thread is the only one inside is freed on the
/// spot; otherwise it is chained onto a shared pending list. Whichever thread
/// leaves while alone takes the whole list and frees it.
///
/// Under constant overlap the count never drops to one, so once the list
/// holds `max_pending` nodes new critical sections are held at the door until
/// the ones inside drain out. Threads already inside may nest further guards.
pub struct RefCount {
    active: CachePadded<AtomicUsize>,
    pending: CachePadded<AtomicPtr<PendingEntry>>,
    // Guards alive per thread, so nested pins skip the admission check
    nesting: ThreadLocal<Cell<usize>>,
    config: ReclaimConfig,
    counters: Counters,
}

impl Default for RefCount {
    fn default() -> Self {
        RefCount::new()
    }
}

impl RefCount {
    pub fn new() -> Self {
        RefCount::with_config(ReclaimConfig::default())
    }

    /// Only `max_pending` applies; nothing is collected by threshold.
    pub fn with_config(config: ReclaimConfig) -> Self {
        RefCount {
            active: CachePadded::new(AtomicUsize::new(0)),
            pending: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            nesting: ThreadLocal::new(),
            config,
            counters: Counters::default(),
        }
    }

    /// Guards currently alive.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn limit(&self) -> usize {
        self.config.max_pending.max(1)
    }

    fn enter(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
        // Order the count before any load of the shared structure
        fence(Ordering::SeqCst);
    }

    // Leave the critical section, taking the pending list along if alone
    fn leave(&self) {
        if self.active.load(Ordering::SeqCst) != 1 {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let claimed = self.pending.swap(ptr::null_mut(), Ordering::SeqCst);
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Nobody entered since the swap, so nobody can see these nodes
            unsafe { self.free_chain(claimed) };
        } else if !claimed.is_null() {
            unsafe { self.chain(claimed) };
        }
    }

    // Push a chain of entries back onto the pending list
    unsafe fn chain(&self, first: *mut PendingEntry) {
        let mut last = first;
        unsafe {
            while !(*last).next.is_null() {
                last = (*last).next;
            }
        }

        let mut head = self.pending.load(Ordering::Relaxed);
        loop {
            unsafe { (*last).next = head };
            match self
                .pending
                .compare_exchange_weak(head, first, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    unsafe fn free_chain(&self, mut current: *mut PendingEntry) {
        let mut reclaimed = 0;
        while !current.is_null() {
            let entry = unsafe { Box::from_raw(current) };
            current = entry.next;
            unsafe { entry.retired.reclaim() };
            reclaimed += 1;
        }
        self.counters.reclaimed(reclaimed);
    }
}

/// Counts the current thread as inside a critical section.
pub struct RefCountGuard<'r> {
    owner: &'r RefCount,
    nesting: &'r Cell<usize>,
    // The nesting count belongs to the pinning thread
    _not_send: PhantomData<*const ()>,
}

impl Protect for RefCountGuard<'_> {
    fn protect<T>(&mut self, src: &AtomicPtr<T>) -> *mut T {
        src.load(Ordering::Acquire)
    }
}

impl Drop for RefCountGuard<'_> {
    fn drop(&mut self) {
        self.nesting.set(self.nesting.get() - 1);
        self.owner.leave();
    }
}

unsafe impl Reclaim for RefCount {
    type Guard<'r>
        = RefCountGuard<'r>
    where
        Self: 'r;

    fn try_pin(&self) -> Result<RefCountGuard<'_>, ReclaimError> {
        let nesting = self.nesting.get_or(|| Cell::new(0));

        if nesting.get() == 0 {
            let limit = self.limit();
            if self.counters.snapshot().pending() >= limit {
                // Everyone may have left without anyone leaving alone
                self.collect();
                let pending = self.counters.snapshot().pending();
                if pending >= limit {
                    return Err(ReclaimError::PendingLimit { pending, limit });
                }
            }
        }

        nesting.set(nesting.get() + 1);
        self.enter();
        Ok(RefCountGuard {
            owner: self,
            nesting,
            _not_send: PhantomData,
        })
    }

    unsafe fn retire<'r>(&'r self, _guard: &mut RefCountGuard<'r>, retired: Retired) {
        self.counters.retired();

        // Pairs with the fence in `enter`: a reader counted after this check
        // loads the top pointer after our unlinking CAS.
        fence(Ordering::SeqCst);

        // Only our own guard is alive: every reader that could have loaded
        // this node before it was unlinked would still be counted.
        if self.active.load(Ordering::SeqCst) == 1 {
            unsafe { retired.reclaim() };
            self.counters.reclaimed(1);
            return;
        }

        let entry = Box::into_raw(Box::new(PendingEntry {
            retired,
            next: ptr::null_mut(),
        }));
        unsafe { self.chain(entry) };
    }

    fn collect(&self) {
        self.enter();
        self.leave();
    }

    fn stats(&self) -> ReclaimStats {
        self.counters.snapshot()
    }
}

impl Drop for RefCount {
    fn drop(&mut self) {
        let pending = std::mem::replace(self.pending.get_mut(), ptr::null_mut());
        unsafe { self.free_chain(pending) };
    }
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCount")
            .field("active", &self.active())
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
