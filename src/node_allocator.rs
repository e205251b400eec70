use std::{
    alloc::{Layout, alloc, dealloc},
    cell::UnsafeCell,
    marker::PhantomData,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use thread_local::ThreadLocal;

use crate::{
    CACHE_LINE_SIZE,
    error::AllocError,
    node::{Node, NodeState},
    reclaim::Retired,
};

// A freed node block waiting in a thread's pool
struct FreeBlock(NonNull<u8>);

// Blocks are plain memory; nothing in them is shared once freed.
unsafe impl Send for FreeBlock {}

/// Memory manager for [`Node`] allocation.
///
/// Nodes are rounded up to whole cache lines. Freed blocks go to a bounded
/// pool owned by the freeing thread, and the next allocation on that thread
/// reuses them, so a freed address comes back quickly. That reuse is what
/// turns a premature free into an ABA hazard; the reclamation scheme is what
/// keeps a block out of the pool while anyone can still read it.
pub struct NodeAllocator<T> {
    layout: Layout,
    pool_capacity: usize,
    pools: ThreadLocal<UnsafeCell<Vec<FreeBlock>>>,
    allocated: AtomicUsize,
    recycled: AtomicUsize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> NodeAllocator<T> {
    pub fn new(pool_capacity: usize) -> Self {
        let natural = Layout::new::<Node<T>>();

        // Round up to cache line size
        let layout = natural
            .align_to(*CACHE_LINE_SIZE)
            .unwrap_or(natural)
            .pad_to_align();

        NodeAllocator {
            layout,
            pool_capacity,
            pools: ThreadLocal::new(),
            allocated: AtomicUsize::new(0),
            recycled: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Fresh blocks taken from the global allocator so far.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Allocations served from a thread's pool so far.
    pub fn recycled(&self) -> usize {
        self.recycled.load(Ordering::Relaxed)
    }

    #[allow(clippy::mut_from_ref)]
    fn pool(&self) -> &mut Vec<FreeBlock> {
        let pool = self.pools.get_or(|| UnsafeCell::new(Vec::new()));
        // Each pool is only ever touched by the thread that owns it.
        unsafe { &mut *pool.get() }
    }

    /// Allocates a node holding `value`, in the [`NodeState::Allocated`]
    /// state with a null `next`. Hands `value` back if memory is exhausted.
    pub(crate) fn allocate(&self, value: T) -> Result<NonNull<Node<T>>, (T, AllocError)> {
        let block = match self.pool().pop() {
            Some(FreeBlock(block)) => {
                self.recycled.fetch_add(1, Ordering::Relaxed);
                block
            }
            None => {
                // Allocate memory
                let raw = unsafe { alloc(self.layout) };
                match NonNull::new(raw) {
                    Some(block) => {
                        self.allocated.fetch_add(1, Ordering::Relaxed);
                        block
                    }
                    None => return Err((value, AllocError::new(self.layout))),
                }
            }
        };

        let node = block.cast::<Node<T>>();
        // Initialize the node
        unsafe { node.as_ptr().write(Node::new(value)) };
        Ok(node)
    }

    /// Marks the node reclaimed and returns its memory to this thread's pool,
    /// or to the global allocator once the pool is full.
    ///
    /// # Safety
    ///
    /// `node` must come from this allocator, its value must already have been
    /// moved out or dropped, and no thread may dereference it again.
    pub(crate) unsafe fn deallocate(&self, node: NonNull<Node<T>>) {
        unsafe { node.as_ref() }.transition(NodeState::Unlinked, NodeState::Reclaimed);

        let pool = self.pool();
        if pool.len() < self.pool_capacity {
            pool.push(FreeBlock(node.cast()));
        } else {
            // Deallocate
            unsafe { dealloc(node.as_ptr().cast(), self.layout) }
        }
    }

    /// Packages an unlinked node for a reclamation scheme. Freeing the record
    /// calls back into [`deallocate`](Self::deallocate).
    ///
    /// # Safety
    ///
    /// Same as `deallocate`, and `self` must outlive the returned record.
    pub(crate) unsafe fn retired(&self, node: NonNull<Node<T>>) -> Retired {
        unsafe {
            Retired::new(
                node.cast(),
                (self as *const Self).cast(),
                free_node::<T>,
            )
        }
    }
}

unsafe fn free_node<T>(block: NonNull<u8>, allocator: *const ()) {
    unsafe {
        let allocator = &*allocator.cast::<NodeAllocator<T>>();
        allocator.deallocate(block.cast());
    }
}

impl<T> Drop for NodeAllocator<T> {
    fn drop(&mut self) {
        for pool in self.pools.iter_mut() {
            for FreeBlock(block) in pool.get_mut().drain(..) {
                unsafe { dealloc(block.as_ptr(), self.layout) }
            }
        }
    }
}
