use crate::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use crate::sync::Backoff;
use crate::{Error, Result};
use std::alloc::Layout;
use std::mem::ManuallyDrop;
use std::ptr;

/// A linked payload cell.
///
/// While reachable from a stack head the node is owned by that stack. A successful unlinking CAS
/// hands it to exactly one reclamation authority, which moves the payload out with
/// [`Node::take`] and eventually frees the cell with [`Node::free`]. Freeing never drops the
/// payload.
pub(crate) struct Node<T> {
    value: ManuallyDrop<T>,
    pub(crate) next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn new(value: T) -> Self {
        Node {
            value: ManuallyDrop::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn alloc(value: T) -> *mut Self {
        Box::into_raw(Box::new(Self::new(value)))
    }

    /// Allocate a node, reporting allocator failure instead of aborting.
    pub(crate) fn try_alloc(value: T) -> Result<*mut Self> {
        let layout = Layout::new::<Self>();
        // Safety: `Node` always contains a pointer, so the layout is never zero-sized.
        let node = unsafe { std::alloc::alloc(layout) }.cast::<Self>();
        if node.is_null() {
            return Err(Error::OutOfMemory {
                size: layout.size(),
            });
        }
        // Safety: freshly allocated with the layout of `Self`, so valid for writes. Memory from
        // the global allocator with `Layout::new::<Self>()` is also valid for `Box::from_raw`.
        unsafe { node.write(Self::new(value)) };
        Ok(node)
    }

    /// Move the payload out of `node`.
    ///
    /// # Safety
    ///
    /// `node` must be valid, and the caller must be the single owner of the payload: it must
    /// have unlinked `node`, and `take` must not be called again for the same node. Other
    /// threads may still hold shared references to the node, but only to read `next`.
    pub(crate) unsafe fn take(node: *mut Self) -> T {
        // Safety: the payload is never written after construction, so a bitwise read does not
        // race. Exclusivity of the payload is guaranteed by the caller.
        ManuallyDrop::into_inner(unsafe { ptr::addr_of!((*node).value).read() })
    }

    /// Release the memory of `node` without dropping its payload.
    ///
    /// # Safety
    ///
    /// `node` must have come from [`Node::alloc`] or [`Node::try_alloc`], must be unreachable
    /// for every other thread, and must not be freed twice.
    pub(crate) unsafe fn free(node: *mut Self) {
        drop(unsafe { Box::from_raw(node) });
    }

    /// Drop the payload and release the node.
    ///
    /// # Safety
    ///
    /// Same as [`Node::free`], and the payload must not have been taken.
    pub(crate) unsafe fn destroy(node: *mut Self) {
        drop(unsafe { Self::take(node) });
        unsafe { Self::free(node) };
    }
}

/// Link a fully initialized, unshared `node` in as the new head.
///
/// This is the push half shared by every stack whose head is a plain pointer. It performs no
/// allocation and never interacts with reclamation.
pub(crate) fn link_head<T>(head: &AtomicPtr<Node<T>>, node: *mut Node<T>) {
    let backoff = Backoff::new();
    let mut current = head.load(Ordering::Relaxed);
    loop {
        // Safety: `node` is not reachable by other threads until the CAS below succeeds.
        unsafe { &*node }.next.store(current, Ordering::Relaxed);
        match head.compare_exchange_weak(current, node, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => break,
            Err(now) => {
                current = now;
                backoff.spin();
            }
        }
    }
}

/// Per-stack accounting of node lifetimes.
pub(crate) struct NodeCounts {
    allocated: AtomicUsize,
    freed: AtomicUsize,
    retired: AtomicUsize,
}

impl NodeCounts {
    pub(crate) fn new() -> Self {
        Self {
            allocated: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
            retired: AtomicUsize::new(0),
        }
    }

    pub(crate) fn allocated(&self) {
        self.allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn freed(&self, n: usize) {
        self.freed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn retired(&self) {
        self.retired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> NodeCountsSnapshot {
        NodeCountsSnapshot {
            allocated: self.allocated.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
        }
    }
}

/// How many nodes a stack has allocated, freed itself, and handed off to a [`Registry`].
///
/// Counts are read with relaxed loads, so they are only exact once the stack is quiescent.
///
/// [`Registry`]: crate::Registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCountsSnapshot {
    pub allocated: usize,
    pub freed: usize,
    /// Nodes whose reclamation was deferred to a hazard pointer registry.
    pub retired: usize,
}

impl NodeCountsSnapshot {
    /// Nodes that are still owned by the stack, either linked or waiting on a pending list.
    pub fn live(&self) -> usize {
        self.allocated.saturating_sub(self.freed + self.retired)
    }
}
