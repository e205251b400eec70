use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

/// Lifecycle of a node. Every node walks these states in order and never
/// skips one.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Fresh from the allocator, owned by the pushing thread.
    Allocated = 0,
    /// Reachable from the stack's top pointer.
    Linked = 1,
    /// Removed by a successful pop, waiting for reclamation.
    Unlinked = 2,
    /// Memory handed back to the allocator.
    Reclaimed = 3,
}

impl NodeState {
    fn from_u8(raw: u8) -> NodeState {
        match raw {
            0 => NodeState::Allocated,
            1 => NodeState::Linked,
            2 => NodeState::Unlinked,
            _ => NodeState::Reclaimed,
        }
    }
}

// Node structure, laid out by `NodeAllocator` on its own cache line
#[repr(C)]
pub struct Node<T> {
    // Link to the node below; only written while the node is exclusively owned
    pub(crate) next: AtomicPtr<Node<T>>,
    // Moved out exactly once, by the pop that unlinks the node
    pub(crate) value: ManuallyDrop<T>,
    pub(crate) state: AtomicU8,
}

impl<T> Node<T> {
    pub(crate) fn new(value: T) -> Self {
        Node {
            next: AtomicPtr::default(),
            value: ManuallyDrop::new(value),
            state: AtomicU8::new(NodeState::Allocated as u8),
        }
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves the node from `from` to `to`, asserting in debug builds that
    /// no lifecycle step was skipped.
    pub(crate) fn transition(&self, from: NodeState, to: NodeState) {
        let previous = self.state.swap(to as u8, Ordering::AcqRel);
        debug_assert_eq!(
            NodeState::from_u8(previous),
            from,
            "node moved to {to:?} from an unexpected state"
        );
    }
}
