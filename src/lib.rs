//! A lock-free Treiber stack with pluggable memory reclamation.
//!
//! [`Stack`] is a multi-producer/multi-consumer LIFO built on a single
//! compare-and-swap'd top pointer. Popped nodes are handed to a [`Reclaim`]
//! scheme which frees them only once no other thread can still be reading
//! them. Three schemes ship with the crate:
//!
//! - [`EpochManager`] (the default): epoch-based reclamation.
//! - [`HazardPointers`]: a fixed table of published hazard pointers.
//! - [`RefCount`]: a count of the threads inside a critical section.
//!
//! ```
//! use lfstack::{HazardPointers, Stack};
//!
//! let stack = Stack::new();
//! stack.push(1);
//! stack.push(2);
//! assert_eq!(stack.pop(), Some(2));
//!
//! let hazard: Stack<&str, HazardPointers> = Stack::new_with_reclamation(HazardPointers::new());
//! hazard.push("a");
//! assert_eq!(hazard.pop(), Some("a"));
//! assert!(hazard.is_empty());
//! ```

use once_cell::sync::Lazy;

pub mod config;
pub mod epoch_manager;
pub mod error;
pub mod hazard_pointers;
pub mod node;
pub mod node_allocator;
pub mod reclaim;
pub mod ref_count;
pub mod stack;

#[cfg(test)]
mod history;

pub use config::{ReclaimConfig, StackConfig};
pub use epoch_manager::EpochManager;
pub use error::{AllocError, PushError, ReclaimError};
pub use hazard_pointers::HazardPointers;
pub use reclaim::{Protect, Reclaim, ReclaimStats, Retired};
pub use ref_count::RefCount;
pub use stack::Stack;

/// Alignment for cache lines (typically 64 bytes on modern CPUs)
pub(crate) static CACHE_LINE_SIZE: Lazy<usize> = Lazy::new(|| {
    // Try data cache first (most relevant for our use case)
    cache_size::cache_line_size(1, cache_size::CacheType::Data)
        // Fall back to unified cache if data cache info isn't available
        .or_else(|| cache_size::cache_line_size(1, cache_size::CacheType::Unified))
        // Try L2 cache if L1 isn't available
        .or_else(|| cache_size::cache_line_size(2, cache_size::CacheType::Data))
        .or_else(|| cache_size::cache_line_size(2, cache_size::CacheType::Unified))
        // Layouts need a power of two
        .filter(|size| size.is_power_of_two())
        // Default to 64 bytes if all detection fails
        .unwrap_or(64)
});
