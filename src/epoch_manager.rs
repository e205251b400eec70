use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering, fence};

use crossbeam_utils::{Backoff, CachePadded};
use thread_local::ThreadLocal;

use crate::config::ReclaimConfig;
use crate::error::ReclaimError;
use crate::reclaim::{Counters, Protect, Reclaim, ReclaimStats, Retired};

// Low bit of a participant's state word
const PINNED: usize = 1;

// Thread-local epoch tracker
struct LocalEpoch {
    // (epoch << 1) | PINNED while pinned, 0 otherwise
    state: AtomicUsize,
    // Guards alive on the owning thread; only the owner touches it
    guards: AtomicUsize,
}

// Garbage collection entry
struct GarbageEntry {
    retired: Retired,
    epoch_deleted: usize,
}

// Thread-local garbage collection list, oldest entries first
#[derive(Default)]
struct GarbageList {
    entries: Vec<GarbageEntry>,
}

/// Epoch-based reclamation manager.
///
/// Threads pin themselves to the current global epoch while they may hold
/// references into the stack. The global epoch only moves forward once every
/// pinned thread has observed it, so anything retired in epoch `e` is out of
/// reach of every thread by the time the epoch reaches `e + 2`.
pub struct EpochManager {
    global: CachePadded<AtomicUsize>,
    locals: ThreadLocal<LocalEpoch>,
    garbage: ThreadLocal<UnsafeCell<GarbageList>>,
    config: ReclaimConfig,
    counters: Counters,
}

impl Default for EpochManager {
    fn default() -> Self {
        EpochManager::new()
    }
}

impl EpochManager {
    pub fn new() -> Self {
        EpochManager::with_config(ReclaimConfig::default())
    }

    pub fn with_config(config: ReclaimConfig) -> Self {
        EpochManager {
            global: CachePadded::new(AtomicUsize::new(0)),
            locals: ThreadLocal::new(),
            garbage: ThreadLocal::new(),
            config,
            counters: Counters::default(),
        }
    }

    /// Current global epoch.
    pub fn epoch(&self) -> usize {
        self.global.load(Ordering::Acquire)
    }

    // Register the calling thread on first use
    fn local(&self) -> &LocalEpoch {
        self.locals.get_or(|| LocalEpoch {
            state: AtomicUsize::new(0),
            guards: AtomicUsize::new(0),
        })
    }

    #[allow(clippy::mut_from_ref)]
    fn garbage_list(&self) -> &mut GarbageList {
        let list = self.garbage.get_or(|| UnsafeCell::new(GarbageList::default()));
        // Only the owning thread reaches its own list.
        unsafe { &mut *list.get() }
    }

    // Enter a critical section
    fn enter(&self, local: &LocalEpoch) {
        let guards = local.guards.load(Ordering::Relaxed);
        if guards == 0 {
            self.publish(local);
        }
        local.guards.store(guards + 1, Ordering::Relaxed);
    }

    // Exit a critical section
    fn exit(&self, local: &LocalEpoch) {
        let guards = local.guards.load(Ordering::Relaxed);
        debug_assert!(guards > 0, "exit without a matching enter");
        local.guards.store(guards - 1, Ordering::Relaxed);
        if guards == 1 {
            local.state.store(0, Ordering::Release);
        }
    }

    fn publish(&self, local: &LocalEpoch) {
        let epoch = self.global.load(Ordering::Relaxed);
        local.state.store((epoch << 1) | PINNED, Ordering::Relaxed);
        // Order the pin before any load of the shared structure.
        fence(Ordering::SeqCst);
    }

    /// Tries to advance the global epoch. Fails while some pinned thread
    /// still lives in an older epoch.
    pub fn try_advance(&self) -> bool {
        let current_epoch = self.global.load(Ordering::Relaxed);
        fence(Ordering::SeqCst);

        for local in self.locals.iter() {
            let state = local.state.load(Ordering::Relaxed);
            if state & PINNED != 0 && state >> 1 != current_epoch {
                return false;
            }
        }
        fence(Ordering::Acquire);

        self.global
            .compare_exchange(
                current_epoch,
                current_epoch + 1,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    // Collect garbage that's safe to reclaim
    fn collect_list(&self, list: &mut GarbageList) {
        let current_epoch = self.global.load(Ordering::Acquire);

        // Entries are appended in epoch order, so the reclaimable ones form a prefix.
        let safe = list
            .entries
            .partition_point(|entry| entry.epoch_deleted + 2 <= current_epoch);

        for entry in list.entries.drain(..safe) {
            unsafe { entry.retired.reclaim() };
        }
        self.counters.reclaimed(safe);
    }
}

/// Keeps the current thread pinned to an epoch.
pub struct EpochGuard<'r> {
    manager: &'r EpochManager,
    local: &'r LocalEpoch,
    // Pins are bookkept per thread
    _not_send: PhantomData<*const ()>,
}

impl EpochGuard<'_> {
    /// Moves the pin to the current global epoch so that the epoch can keep
    /// advancing. Nothing protected earlier may be dereferenced afterwards.
    /// Has no effect while other guards are alive on this thread.
    pub fn repin(&mut self) {
        if self.local.guards.load(Ordering::Relaxed) == 1 {
            self.manager.publish(self.local);
        }
    }
}

impl Protect for EpochGuard<'_> {
    fn protect<T>(&mut self, src: &AtomicPtr<T>) -> *mut T {
        src.load(Ordering::Acquire)
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.manager.exit(self.local);
    }
}

unsafe impl Reclaim for EpochManager {
    type Guard<'r>
        = EpochGuard<'r>
    where
        Self: 'r;

    fn try_pin(&self) -> Result<EpochGuard<'_>, ReclaimError> {
        let local = self.local();
        self.enter(local);
        Ok(EpochGuard {
            manager: self,
            local,
            _not_send: PhantomData,
        })
    }

    unsafe fn retire<'r>(&'r self, guard: &mut EpochGuard<'r>, retired: Retired) {
        self.counters.retired();

        fence(Ordering::SeqCst);
        let epoch_deleted = self.global.load(Ordering::Relaxed);

        let list = self.garbage_list();
        list.entries.push(GarbageEntry {
            retired,
            epoch_deleted,
        });

        // Try to collect garbage if we've accumulated enough
        if list.entries.len() >= self.config.collect_threshold {
            self.try_advance();
            self.collect_list(list);
        }

        // Hold further retirement until memory is back under the bound. A
        // nested guard cannot repin, so the outermost guard deals with it.
        let limit = self.config.pending_limit();
        if list.entries.len() > limit && guard.local.guards.load(Ordering::Relaxed) == 1 {
            let backoff = Backoff::new();
            loop {
                guard.repin();
                self.try_advance();
                self.collect_list(list);
                if list.entries.len() <= limit {
                    break;
                }
                backoff.snooze();
            }
        }
    }

    fn collect(&self) {
        self.try_advance();
        self.collect_list(self.garbage_list());
    }

    fn stats(&self) -> ReclaimStats {
        self.counters.snapshot()
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        // No guard can outlive the manager, so everything left is unreachable.
        let mut reclaimed = 0;
        for list in self.garbage.iter_mut() {
            for entry in list.get_mut().entries.drain(..) {
                unsafe { entry.retired.reclaim() };
                reclaimed += 1;
            }
        }
        self.counters.reclaimed(reclaimed);
    }
}

impl fmt::Debug for EpochManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochManager")
            .field("epoch", &self.epoch())
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
