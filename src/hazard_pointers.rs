use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering, fence};

use crossbeam_utils::{Backoff, CachePadded};
use thread_local::ThreadLocal;

use crate::config::ReclaimConfig;
use crate::error::ReclaimError;
use crate::reclaim::{Counters, Protect, Reclaim, ReclaimStats, Retired};

/// Number of hazard slots when none is given.
pub const DEFAULT_SLOTS: usize = 64;

// One published hazard pointer
#[derive(Default)]
struct HazardSlot {
    claimed: AtomicBool,
    hazard: AtomicPtr<u8>,
}

/// Hazard-pointer reclamation over a fixed table of `SLOTS` slots.
///
/// Every guard claims a slot for its lifetime and publishes the node it is
/// about to dereference there. A retired node is freed by a scan once its
/// address no longer shows up in any slot. At most `SLOTS` operations can be
/// inside a critical section at once; beyond that [`Reclaim::pin`] waits and
/// [`Reclaim::try_pin`] fails with [`ReclaimError::SlotsExhausted`].
pub struct HazardPointers<const SLOTS: usize = DEFAULT_SLOTS> {
    slots: Box<[CachePadded<HazardSlot>]>,
    retired: ThreadLocal<UnsafeCell<Vec<Retired>>>,
    config: ReclaimConfig,
    counters: Counters,
}

impl Default for HazardPointers {
    fn default() -> Self {
        HazardPointers::new()
    }
}

impl HazardPointers {
    pub fn new() -> Self {
        HazardPointers::with_config(ReclaimConfig::default())
    }
}

impl<const SLOTS: usize> HazardPointers<SLOTS> {
    pub fn with_config(config: ReclaimConfig) -> Self {
        HazardPointers {
            slots: (0..SLOTS).map(|_| CachePadded::default()).collect(),
            retired: ThreadLocal::new(),
            config,
            counters: Counters::default(),
        }
    }

    pub const fn capacity(&self) -> usize {
        SLOTS
    }

    /// Slots currently claimed by live guards.
    pub fn claimed(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.claimed.load(Ordering::Relaxed))
            .count()
    }

    #[allow(clippy::mut_from_ref)]
    fn retired_list(&self) -> &mut Vec<Retired> {
        let list = self.retired.get_or(|| UnsafeCell::new(Vec::new()));
        // Only the owning thread reaches its own list.
        unsafe { &mut *list.get() }
    }

    // Free every record whose address is not published in any slot
    fn scan(&self, list: &mut Vec<Retired>) {
        // Pairs with the fence in `protect`: either we see the hazard, or the
        // protecting thread sees the node already unlinked and retries.
        fence(Ordering::SeqCst);

        let mut hazards: Vec<usize> = self
            .slots
            .iter()
            .map(|slot| slot.hazard.load(Ordering::Acquire) as usize)
            .filter(|&address| address != 0)
            .collect();
        hazards.sort_unstable();

        let mut reclaimed = 0;
        let mut i = 0;
        while i < list.len() {
            if hazards.binary_search(&list[i].address()).is_ok() {
                i += 1;
            } else {
                let retired = list.swap_remove(i);
                unsafe { retired.reclaim() };
                reclaimed += 1;
            }
        }
        self.counters.reclaimed(reclaimed);
    }
}

/// A claimed hazard slot.
pub struct HazardGuard<'r> {
    slot: &'r HazardSlot,
}

impl HazardGuard<'_> {
    /// Withdraws the published hazard. Nothing protected earlier may be
    /// dereferenced afterwards.
    pub fn reset(&mut self) {
        self.slot.hazard.store(ptr::null_mut(), Ordering::Release);
    }
}

impl Protect for HazardGuard<'_> {
    fn protect<T>(&mut self, src: &AtomicPtr<T>) -> *mut T {
        let mut current = src.load(Ordering::Relaxed);
        loop {
            self.slot.hazard.store(current.cast(), Ordering::Relaxed);
            fence(Ordering::SeqCst);

            // Still reachable after publishing, so no scan can have missed it
            let again = src.load(Ordering::Acquire);
            if again == current {
                return current;
            }
            current = again;
        }
    }
}

impl Drop for HazardGuard<'_> {
    fn drop(&mut self) {
        self.slot.hazard.store(ptr::null_mut(), Ordering::Release);
        self.slot.claimed.store(false, Ordering::Release);
    }
}

unsafe impl<const SLOTS: usize> Reclaim for HazardPointers<SLOTS> {
    type Guard<'r>
        = HazardGuard<'r>
    where
        Self: 'r;

    fn try_pin(&self) -> Result<HazardGuard<'_>, ReclaimError> {
        self.slots
            .iter()
            .find(|slot| {
                !slot.claimed.load(Ordering::Relaxed)
                    && slot
                        .claimed
                        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
            })
            .map(|slot| HazardGuard { slot })
            .ok_or(ReclaimError::SlotsExhausted { slots: SLOTS })
    }

    unsafe fn retire<'r>(&'r self, guard: &mut HazardGuard<'r>, retired: Retired) {
        self.counters.retired();
        // The caller is done with whatever it protected
        guard.reset();

        let list = self.retired_list();
        list.push(retired);

        if list.len() >= self.config.collect_threshold {
            self.scan(list);
        }

        // Hold further retirement until memory is back under the bound
        let limit = self.config.pending_limit();
        if list.len() > limit {
            let backoff = Backoff::new();
            loop {
                self.scan(list);
                if list.len() <= limit {
                    break;
                }
                backoff.snooze();
            }
        }
    }

    fn collect(&self) {
        self.scan(self.retired_list());
    }

    fn stats(&self) -> ReclaimStats {
        self.counters.snapshot()
    }
}

impl<const SLOTS: usize> Drop for HazardPointers<SLOTS> {
    fn drop(&mut self) {
        // Guards borrow the table, so none is alive here.
        let mut reclaimed = 0;
        for list in self.retired.iter_mut() {
            for retired in list.get_mut().drain(..) {
                unsafe { retired.reclaim() };
                reclaimed += 1;
            }
        }
        self.counters.reclaimed(reclaimed);
    }
}

impl<const SLOTS: usize> fmt::Debug for HazardPointers<SLOTS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HazardPointers")
            .field("slots", &SLOTS)
            .field("claimed", &self.claimed())
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim::tests::counted_record;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn eager() -> ReclaimConfig {
        ReclaimConfig::default().with_collect_threshold(1)
    }

    #[test]
    fn slots_are_claimed_and_released() {
        let hazards = HazardPointers::<2>::with_config(eager());
        assert_eq!(hazards.capacity(), 2);

        let first = hazards.try_pin().unwrap();
        let second = hazards.try_pin().unwrap();
        assert_eq!(hazards.claimed(), 2);
        assert_eq!(
            hazards.try_pin().err(),
            Some(ReclaimError::SlotsExhausted { slots: 2 })
        );

        drop(first);
        assert_eq!(hazards.claimed(), 1);
        let third = hazards.try_pin().unwrap();
        drop((second, third));
        assert_eq!(hazards.claimed(), 0);
    }

    #[test]
    fn pin_waits_for_a_free_slot() {
        let hazards = Arc::new(HazardPointers::<1>::with_config(eager()));
        let held = Arc::new(Barrier::new(2));

        let holder = {
            let hazards = Arc::clone(&hazards);
            let held = Arc::clone(&held);
            thread::spawn(move || {
                let guard = hazards.pin();
                held.wait();
                thread::sleep(Duration::from_millis(20));
                drop(guard);
            })
        };

        held.wait();
        let guard = hazards.pin();
        assert_eq!(hazards.claimed(), 1);
        drop(guard);
        holder.join().unwrap();
    }

    #[test]
    fn protected_record_survives_scan() {
        let hazards = HazardPointers::new();
        let freed = Arc::new(AtomicUsize::new(0));

        let record = counted_record(&freed);
        let address = record.address();
        let shared = AtomicPtr::new(address as *mut u8);

        let mut reader = hazards.pin();
        assert_eq!(reader.protect(&shared) as usize, address);

        // Unlink, then retire from a second guard
        shared.store(ptr::null_mut(), Ordering::Release);
        let mut writer = hazards.pin();
        unsafe { hazards.retire(&mut writer, record) };
        hazards.collect();
        assert_eq!(freed.load(Ordering::SeqCst), 0);

        drop(reader);
        hazards.collect();
        assert_eq!(freed.load(Ordering::SeqCst), 1);
        assert_eq!(hazards.stats().pending(), 0);
    }

    #[test]
    fn unprotected_records_are_freed_at_threshold() {
        let hazards = HazardPointers::<4>::with_config(
            ReclaimConfig::default().with_collect_threshold(8),
        );
        let freed = Arc::new(AtomicUsize::new(0));

        let mut guard = hazards.pin();
        for _ in 0..7 {
            unsafe { hazards.retire(&mut guard, counted_record(&freed)) };
        }
        assert_eq!(freed.load(Ordering::SeqCst), 0);

        unsafe { hazards.retire(&mut guard, counted_record(&freed)) };
        assert_eq!(freed.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn retirement_blocks_while_hazard_published() {
        let config = ReclaimConfig::default()
            .with_collect_threshold(1)
            .with_max_pending(1);
        let hazards = Arc::new(HazardPointers::<4>::with_config(config));
        let freed = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let first = counted_record(&freed);
        let second = counted_record(&freed);
        let shared = [
            AtomicPtr::new(first.address() as *mut u8),
            AtomicPtr::new(second.address() as *mut u8),
        ];

        // Two readers keep both records alive
        let mut reader_a = hazards.pin();
        let mut reader_b = hazards.pin();
        reader_a.protect(&shared[0]);
        reader_b.protect(&shared[1]);

        let retirer = {
            let hazards = Arc::clone(&hazards);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut guard = hazards.pin();
                unsafe { hazards.retire(&mut guard, first) };
                done.fetch_add(1, Ordering::SeqCst);
                unsafe { hazards.retire(&mut guard, second) };
                done.fetch_add(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(freed.load(Ordering::SeqCst), 0);

        drop(reader_a);
        retirer.join().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(freed.load(Ordering::SeqCst), 1);

        drop(reader_b);
        drop(Arc::into_inner(hazards));
        assert_eq!(freed.load(Ordering::SeqCst), 2);
    }
}
