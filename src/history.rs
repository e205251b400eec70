//! Recorded operation histories and a linearizability checker for them.

use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

use parking_lot::Mutex;

/// A completed stack operation and what it observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Push(u64),
    Pop(Option<u64>),
}

#[derive(Debug, Clone, Copy)]
struct Event {
    operation: Operation,
    invoked: Instant,
    returned: Instant,
}

/// Operations recorded from any number of threads, each with the interval
/// between its invocation and its response.
#[derive(Default)]
pub(crate) struct History {
    events: Mutex<Vec<Event>>,
}

impl History {
    pub(crate) fn new() -> Self {
        History::default()
    }

    /// Runs one operation and records it with its time interval.
    pub(crate) fn record(&self, run: impl FnOnce() -> Operation) {
        let invoked = Instant::now();
        let operation = run();
        let returned = Instant::now();

        self.events.lock().push(Event {
            operation,
            invoked,
            returned,
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Searches for a sequential LIFO order of all operations that respects
    /// real time: an operation that returned before another was invoked must
    /// come first.
    pub(crate) fn is_linearizable(&self) -> bool {
        let events = self.events.lock().clone();
        assert!(events.len() <= 64, "history too long to check");

        let mut checker = Checker {
            events: &events,
            failed: HashSet::new(),
        };
        checker.search(0, &mut Vec::new())
    }
}

impl fmt::Debug for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operations: Vec<_> = self
            .events
            .lock()
            .iter()
            .map(|event| event.operation)
            .collect();
        f.debug_list().entries(operations).finish()
    }
}

// Depth-first search over linearization prefixes
struct Checker<'h> {
    events: &'h [Event],
    // (linearized set, stack contents) pairs known to lead nowhere
    failed: HashSet<(u64, Vec<u64>)>,
}

impl Checker<'_> {
    fn search(&mut self, done: u64, stack: &mut Vec<u64>) -> bool {
        if done.count_ones() as usize == self.events.len() {
            return true;
        }
        if self.failed.contains(&(done, stack.clone())) {
            return false;
        }

        for i in 0..self.events.len() {
            if done & (1 << i) != 0 || !self.is_minimal(done, i) {
                continue;
            }

            match self.events[i].operation {
                Operation::Push(value) => {
                    stack.push(value);
                    if self.search(done | (1 << i), stack) {
                        return true;
                    }
                    stack.pop();
                }
                Operation::Pop(observed) => {
                    if stack.last().copied() != observed {
                        continue;
                    }
                    let taken = stack.pop();
                    if self.search(done | (1 << i), stack) {
                        return true;
                    }
                    if let Some(value) = taken {
                        stack.push(value);
                    }
                }
            }
        }

        self.failed.insert((done, stack.clone()));
        false
    }

    // No pending operation finished before `i` started
    fn is_minimal(&self, done: u64, i: usize) -> bool {
        let invoked = self.events[i].invoked;
        self.events
            .iter()
            .enumerate()
            .all(|(j, event)| j == i || done & (1 << j) != 0 || event.returned >= invoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_lifo_history_is_accepted() {
        let history = History::new();
        history.record(|| Operation::Push(1));
        history.record(|| Operation::Push(2));
        history.record(|| Operation::Pop(Some(2)));
        history.record(|| Operation::Pop(Some(1)));
        history.record(|| Operation::Pop(None));

        assert_eq!(history.len(), 5);
        assert!(history.is_linearizable());
    }

    #[test]
    fn fifo_order_is_rejected() {
        let history = History::new();
        history.record(|| Operation::Push(1));
        history.record(|| Operation::Push(2));
        history.record(|| Operation::Pop(Some(1)));

        assert!(!history.is_linearizable());
    }

    #[test]
    fn lost_and_invented_values_are_rejected() {
        let lost = History::new();
        lost.record(|| Operation::Push(7));
        lost.record(|| Operation::Pop(None));
        assert!(!lost.is_linearizable());

        let invented = History::new();
        invented.record(|| Operation::Pop(Some(3)));
        assert!(!invented.is_linearizable());
    }

    #[test]
    fn overlapping_operations_may_reorder() {
        let history = History::new();
        // The pop runs entirely inside the push, so it may take effect after it
        history.record(|| {
            history.record(|| Operation::Pop(Some(4)));
            Operation::Push(4)
        });

        assert!(history.is_linearizable());
    }
}
