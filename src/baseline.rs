//! The classic Treiber stack without any reclamation scheme.
//!
//! **For illustration only.** [`UnsafeStack`] frees a node the moment it unlinks it. If two
//! threads pop concurrently, one of them may still be about to read `next` from a node the other
//! has just freed (use-after-free), and a recycled allocation at the same address can make the
//! unlinking CAS succeed against a stale `next` (ABA). The other stacks in this crate exist to
//! close exactly that window.

use crate::node::{link_head, Node, NodeCounts, NodeCountsSnapshot};
use crate::sync::atomic::{AtomicPtr, Ordering};
use crate::sync::Backoff;
use crate::Result;
use core::marker::PhantomData;
use core::ptr;

/// A lock-free stack that reclaims popped nodes immediately.
///
/// Any number of threads may push at once. Only one thread may pop at a time, which is the
/// contract callers accept through the `unsafe` constructor.
pub struct UnsafeStack<T> {
    head: AtomicPtr<Node<T>>,
    counts: NodeCounts,
    _owns: PhantomData<*mut T>,
}

// Safety: values move between threads through the stack but are never shared.
unsafe impl<T: Send> Send for UnsafeStack<T> {}
unsafe impl<T: Send> Sync for UnsafeStack<T> {}

impl<T> UnsafeStack<T> {
    /// Create an empty stack.
    ///
    /// # Safety
    ///
    /// The caller must ensure that at most one thread is inside [`UnsafeStack::pop`] at any
    /// time. Concurrent pushes are fine.
    pub unsafe fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
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
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return None;
            }
            // Safety: only sound because no other popper can free `head` under us.
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

        // Safety: we unlinked `head`, so we own its payload and its memory.
        let value = unsafe { Node::take(head) };
        unsafe { Node::free(head) };
        self.counts.freed(1);
        Some(value)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    pub fn node_counts(&self) -> NodeCountsSnapshot {
        self.counts.snapshot()
    }
}

impl<T> Drop for UnsafeStack<T> {
    fn drop(&mut self) {
        let mut node = self.head.load(Ordering::Relaxed);
        while !node.is_null() {
            // Safety: &mut self, so every linked node is exclusively ours.
            let next = unsafe { &*node }.next.load(Ordering::Relaxed);
            unsafe { Node::destroy(node) };
            node = next;
        }
    }
}
