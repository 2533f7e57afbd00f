//! Reclamation by counting the threads that are currently inside `pop`.
//!
//! A popped node may only be freed by a thread that observes itself as the sole popper, since
//! any other popper might have loaded that node as its head snapshot and be about to read its
//! `next` link. Nodes that cannot be freed on the spot are chained onto a pending list, which the
//! next sole popper drains.
//!
//! Under sustained contention there may never be a sole popper, and the pending list then grows
//! without bound. That is a property of this strategy, not something it tries to hide; prefer
//! [`SplitCountStack`](crate::SplitCountStack) where memory must stay bounded.

use crate::node::{link_head, Node, NodeCounts, NodeCountsSnapshot};
use crate::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use crate::sync::Backoff;
use crate::Result;
use core::marker::PhantomData;
use core::ptr;

/// A lock-free stack that defers reclamation while more than one thread is popping.
pub struct RefCountStack<T> {
    head: AtomicPtr<Node<T>>,
    threads_in_pop: AtomicUsize,
    // Unlinked nodes chained through their own `next` links. Every node here has had its
    // payload taken and is unreachable from `head`.
    to_be_deleted: AtomicPtr<Node<T>>,
    counts: NodeCounts,
    _owns: PhantomData<*mut T>,
}

// Safety: values move between threads through the stack but are never shared.
unsafe impl<T: Send> Send for RefCountStack<T> {}
unsafe impl<T: Send> Sync for RefCountStack<T> {}

impl<T> Default for RefCountStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RefCountStack<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            threads_in_pop: AtomicUsize::new(0),
            to_be_deleted: AtomicPtr::new(ptr::null_mut()),
            counts: NodeCounts::new(),
            _owns: PhantomData,
        }
    }

    pub fn push(&self, value: T) {
        self.counts.allocated();
        link_head(&self.head, Node::alloc(value));
    }

    /// Push `value`, returning [`Error::OutOfMemory`](crate::Error::OutOfMemory) (and dropping
    /// `value`) if no node could be allocated.
    pub fn try_push(&self, value: T) -> Result<()> {
        let node = Node::try_alloc(value)?;
        self.counts.allocated();
        link_head(&self.head, node);
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        self.threads_in_pop.fetch_add(1, Ordering::SeqCst);

        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);
        while !head.is_null() {
            // Safety: we are counted in `threads_in_pop`, so no node we can observe through
            // `head` is freed until we leave.
            let next = unsafe { &*head }.next.load(Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(now) => {
                    head = now;
                    backoff.spin();
                }
            }
        }

        let value = if head.is_null() {
            None
        } else {
            // Safety: we unlinked `head`, so its payload is ours.
            Some(unsafe { Node::take(head) })
        };
        self.try_reclaim(head);
        value
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    pub fn node_counts(&self) -> NodeCountsSnapshot {
        self.counts.snapshot()
    }

    /// Number of unlinked nodes waiting for a sole popper.
    ///
    /// Walks the list, so only meaningful while no thread is popping.
    pub fn pending_len(&self) -> usize {
        let mut n = 0;
        let mut node = self.to_be_deleted.load(Ordering::Acquire);
        while !node.is_null() {
            n += 1;
            // Safety: pending nodes are only freed by a sole popper, and the caller promises
            // there is none.
            node = unsafe { &*node }.next.load(Ordering::Relaxed);
        }
        n
    }

    // Called on the way out of `pop`, with `old_head` either null or unlinked by us.
    fn try_reclaim(&self, old_head: *mut Node<T>) {
        if self.threads_in_pop.load(Ordering::SeqCst) == 1 {
            // Nobody else is in pop, so nobody else can have seen anything on the pending list.
            let claimed = self.to_be_deleted.swap(ptr::null_mut(), Ordering::SeqCst);
            if self.threads_in_pop.fetch_sub(1, Ordering::SeqCst) == 1 {
                // Still alone after claiming: no thread that entered since can reach the claimed
                // nodes, since they were unlinked before it arrived.
                //
                // Safety: every pending node is unlinked and unreachable.
                let n = unsafe { self.delete_nodes(claimed) };
                if n != 0 {
                    tracing::trace!(reclaimed = n, "drained pending list");
                }
            } else if !claimed.is_null() {
                // Someone joined between the check and the swap and may have loaded one of the
                // claimed nodes as its head snapshot; hand them back.
                // Safety: `claimed` is a well-formed chain we took ownership of.
                unsafe { self.chain_pending_nodes(claimed) };
            }
            if !old_head.is_null() {
                // Safety: we were sole when we unlinked `old_head`, and late arrivals can only
                // see nodes that are still linked.
                unsafe { Node::free(old_head) };
                self.counts.freed(1);
            }
        } else {
            if !old_head.is_null() {
                // Safety: `old_head` is unlinked and ours; it becomes the pending list's.
                unsafe { self.chain_pending_node(old_head) };
            }
            self.threads_in_pop.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// # Safety
    ///
    /// `nodes` must be a null-terminated chain of unlinked nodes that no thread can reach.
    unsafe fn delete_nodes(&self, mut nodes: *mut Node<T>) -> usize {
        let mut n = 0;
        while !nodes.is_null() {
            let next = unsafe { &*nodes }.next.load(Ordering::Relaxed);
            unsafe { Node::free(nodes) };
            nodes = next;
            n += 1;
        }
        self.counts.freed(n);
        n
    }

    /// # Safety
    ///
    /// `nodes` must be a non-null, null-terminated chain owned by the caller.
    unsafe fn chain_pending_nodes(&self, nodes: *mut Node<T>) {
        let mut last = nodes;
        loop {
            let next = unsafe { &*last }.next.load(Ordering::Relaxed);
            if next.is_null() {
                break;
            }
            last = next;
        }
        unsafe { self.chain_pending_range(nodes, last) };
    }

    /// # Safety
    ///
    /// `node` must be unlinked and owned by the caller.
    unsafe fn chain_pending_node(&self, node: *mut Node<T>) {
        unsafe { self.chain_pending_range(node, node) };
        tracing::trace!("deferred reclamation of popped node");
    }

    /// # Safety
    ///
    /// `first..=last` must be a chain owned by the caller.
    unsafe fn chain_pending_range(&self, first: *mut Node<T>, last: *mut Node<T>) {
        let backoff = Backoff::new();
        let mut current = self.to_be_deleted.load(Ordering::SeqCst);
        loop {
            unsafe { &*last }.next.store(current, Ordering::Relaxed);
            match self.to_be_deleted.compare_exchange_weak(
                current,
                first,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(now) => {
                    current = now;
                    backoff.spin();
                }
            }
        }
    }
}

impl<T> Drop for RefCountStack<T> {
    fn drop(&mut self) {
        let mut node = self.head.load(Ordering::Relaxed);
        while !node.is_null() {
            // Safety: &mut self, so every linked node is exclusively ours.
            let next = unsafe { &*node }.next.load(Ordering::Relaxed);
            unsafe { Node::destroy(node) };
            node = next;
        }
        let pending = self.to_be_deleted.load(Ordering::Relaxed);
        // Safety: no thread is in pop, and pending payloads were already taken.
        unsafe { self.delete_nodes(pending) };
    }
}
