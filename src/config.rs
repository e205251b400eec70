/// Tuning knobs for [`Stack`](crate::Stack) itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    /// Back off exponentially between failed CAS attempts instead of
    /// retrying immediately.
    pub backoff: bool,
    /// Freed node blocks each thread keeps around for reuse before handing
    /// them back to the global allocator.
    pub pool_capacity: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            backoff: true,
            pool_capacity: 64,
        }
    }
}

impl StackConfig {
    pub fn with_backoff(mut self, backoff: bool) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_pool_capacity(mut self, pool_capacity: usize) -> Self {
        self.pool_capacity = pool_capacity;
        self
    }
}

/// Tuning knobs shared by the reclamation schemes that keep per-thread
/// lists of retired nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimConfig {
    /// Retired nodes a thread accumulates before it tries to reclaim them.
    pub collect_threshold: usize,
    /// Retired nodes a thread may hold before further retirement blocks until
    /// some of them can be freed.
    pub max_pending: usize,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        ReclaimConfig {
            collect_threshold: 64,
            max_pending: 1 << 16,
        }
    }
}

impl ReclaimConfig {
    pub fn with_collect_threshold(mut self, collect_threshold: usize) -> Self {
        self.collect_threshold = collect_threshold.max(1);
        self
    }

    /// Never goes below the collect threshold.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub(crate) fn pending_limit(&self) -> usize {
        self.max_pending.max(self.collect_threshold)
    }
}
