//! Reclamation through split reference counts.
//!
//! The head is a [`CountedPtr`]: the node pointer together with an _external_ count of threads
//! that have announced, through the head, that they are about to dereference that node. Each node
//! carries an _internal_ count in addition. A popper first bumps the external count on its head
//! snapshot; then:
//!
//! * if it unlinks the node, it folds the external count into the internal one, minus one for
//!   its own reference and one for the stack's, and frees the node if that brings the internal
//!   count to zero;
//! * if it loses the race, it drops its own reference by decrementing the internal count, and
//!   frees the node if that was the last one.
//!
//! Exactly one thread sees the internal count reach zero, so every node is freed exactly once,
//! and nothing ever waits on a pending list.

use crate::node::{NodeCounts, NodeCountsSnapshot};
use crate::sync::atomic::{fence, AtomicIsize, AtomicU128, Ordering};
use crate::sync::Backoff;
use crate::{Error, Result};
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ptr;
use std::alloc::Layout;

// The node address takes the low half of the counted pointer and the external count the high half.
const COUNT_SHIFT: u32 = 64;
const PTR_MASK: u128 = u64::MAX as u128;
const _: () = assert!(usize::BITS <= COUNT_SHIFT);

/// Largest external count a head snapshot can carry.
///
/// The external count is not bounded by the number of threads. A popper that loses its unlink
/// race to a push leaves its increment behind in the word the push copies into the new node's
/// `next`, and that increment comes back when the new node is popped. A node that stays on the
/// stack through a lot of churn accumulates such increments (balanced by decrements of its
/// internal count) until it is finally popped, which is why the count gets a full 64 bits.
pub const MAX_EXTERNAL_COUNT: u64 = u64::MAX;

/// A node pointer and its external count, packed into one word so both change in a single CAS.
struct CountedPtr<T> {
    raw: u128,
    _node: PhantomData<*mut CountedNode<T>>,
}

impl<T> Clone for CountedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for CountedPtr<T> {}

impl<T> PartialEq for CountedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> CountedPtr<T> {
    const NULL: u128 = 0;

    fn new(external_count: u64, ptr: *mut CountedNode<T>) -> Self {
        // `as` exposes the provenance of the `Box` allocation, which `ptr` picks up again.
        let addr = ptr as usize as u128;
        Self::from_raw(((external_count as u128) << COUNT_SHIFT) | addr)
    }

    fn from_raw(raw: u128) -> Self {
        Self {
            raw,
            _node: PhantomData,
        }
    }

    fn ptr(self) -> *mut CountedNode<T> {
        (self.raw & PTR_MASK) as usize as *mut CountedNode<T>
    }

    fn external_count(self) -> u64 {
        (self.raw >> COUNT_SHIFT) as u64
    }

    fn with_one_more(self) -> Self {
        assert!(
            self.external_count() < MAX_EXTERNAL_COUNT,
            "external count overflow"
        );
        Self::from_raw(self.raw + (1 << COUNT_SHIFT))
    }
}

struct CountedNode<T> {
    value: ManuallyDrop<T>,
    internal_count: AtomicIsize,
    // Written once before the node is published, read-only afterwards.
    next: CountedPtr<T>,
}

impl<T> CountedNode<T> {
    fn new(value: T) -> Self {
        Self {
            value: ManuallyDrop::new(value),
            internal_count: AtomicIsize::new(0),
            next: CountedPtr::from_raw(CountedPtr::<T>::NULL),
        }
    }
}

/// A lock-free stack that frees every node exactly when its last observer lets go.
///
/// Memory overhead is bounded by the nodes that are actually on the stack plus those that are
/// being popped right now: there is no deferred list. The price is one extra atomic counter per
/// node and a second CAS loop per pop. This is the variant to pick by default.
///
/// The head is a 128-bit atomic from `portable-atomic`. It is lock-free on x86-64 CPUs with
/// `cmpxchg16b` and on AArch64, and falls back to a lock elsewhere; see
/// [`SplitCountStack::is_lock_free`].
pub struct SplitCountStack<T> {
    head: AtomicU128,
    counts: NodeCounts,
    _owns: PhantomData<*mut T>,
}

// Safety: values move between threads through the stack but are never shared.
unsafe impl<T: Send> Send for SplitCountStack<T> {}
unsafe impl<T: Send> Sync for SplitCountStack<T> {}

impl<T> Default for SplitCountStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SplitCountStack<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicU128::new(CountedPtr::<T>::NULL),
            counts: NodeCounts::new(),
            _owns: PhantomData,
        }
    }

    /// Whether the head is updated with native 128-bit atomics on this machine.
    pub fn is_lock_free() -> bool {
        AtomicU128::is_lock_free()
    }

    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(CountedNode::new(value)));
        self.link(node);
    }

    /// Push `value`, returning [`Error::OutOfMemory`] (and dropping `value`) if no node could be
    /// allocated.
    pub fn try_push(&self, value: T) -> Result<()> {
        let layout = Layout::new::<CountedNode<T>>();
        // Safety: `CountedNode` always contains a counter, so the layout is never zero-sized.
        let node = unsafe { std::alloc::alloc(layout) }.cast::<CountedNode<T>>();
        if node.is_null() {
            return Err(Error::OutOfMemory {
                size: layout.size(),
            });
        }
        // Safety: freshly allocated with the layout of `CountedNode<T>`, which also makes it
        // valid for `Box::from_raw` later.
        unsafe { node.write(CountedNode::new(value)) };
        self.link(node);
        Ok(())
    }

    fn link(&self, node: *mut CountedNode<T>) {
        self.counts.allocated();
        let new_head = CountedPtr::new(1, node);
        let backoff = Backoff::new();
        let mut current = CountedPtr::from_raw(self.head.load(Ordering::Relaxed));
        loop {
            // Safety: `node` is not reachable by other threads until the CAS below succeeds.
            unsafe { (*node).next = current };
            match self.head.compare_exchange_weak(
                current.raw,
                new_head.raw,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(now) => {
                    current = CountedPtr::from_raw(now);
                    backoff.spin();
                }
            }
        }
    }

    /// Announce one more observer of `old`'s node, retrying on whatever the head has become.
    ///
    /// Returns the snapshot carrying our increment, or `None` if the head turned out to be null;
    /// an empty head is never modified.
    fn increase_head_count(&self, mut old: CountedPtr<T>) -> Option<CountedPtr<T>> {
        let backoff = Backoff::new();
        loop {
            if old.ptr().is_null() {
                return None;
            }
            let new = old.with_one_more();
            match self.head.compare_exchange(
                old.raw,
                new.raw,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(new),
                Err(now) => {
                    old = CountedPtr::from_raw(now);
                    backoff.spin();
                }
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let mut old_head = CountedPtr::from_raw(self.head.load(Ordering::Relaxed));
        loop {
            old_head = self.increase_head_count(old_head)?;
            let node = old_head.ptr();

            // Safety: our external reference keeps `node` allocated, and `next` is immutable
            // once the node is published.
            let next = unsafe { (*node).next };
            match self.head.compare_exchange(
                old_head.raw,
                next.raw,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // Safety: we unlinked `node`, so its payload is ours; nobody else reads it.
                    let value =
                        ManuallyDrop::into_inner(unsafe { ptr::addr_of!((*node).value).read() });

                    // One for our own reference, one for the stack's.
                    let count_increase = old_head.external_count() as isize - 2;
                    let internal = unsafe { &(*node).internal_count };
                    let previous = internal.fetch_add(count_increase, Ordering::AcqRel);
                    debug_assert!(previous <= 0, "internal count went positive before unlink");
                    if previous == -count_increase {
                        // Safety: every other observer has already retired its reference.
                        unsafe { self.free(node) };
                    }
                    return Some(value);
                }
                Err(now) => {
                    // Safety: our external reference on `node` is still outstanding.
                    unsafe { self.release_reference(node) };
                    old_head = CountedPtr::from_raw(now);
                }
            }
        }
    }

    /// Give up the reference of a popper that lost its unlink race on `node`.
    ///
    /// # Safety
    ///
    /// The caller must hold an external reference on `node` from `increase_head_count`, and must
    /// not touch `node` afterwards.
    unsafe fn release_reference(&self, node: *mut CountedNode<T>) {
        let internal = unsafe { &(*node).internal_count };
        let previous = internal.fetch_sub(1, Ordering::Release);
        if previous == 1 {
            // The unlinking thread has accounted for everyone, and we were last.
            fence(Ordering::Acquire);
            // Safety: we held the last reference.
            unsafe { self.free(node) };
        }
    }

    pub fn is_empty(&self) -> bool {
        CountedPtr::<T>::from_raw(self.head.load(Ordering::Acquire))
            .ptr()
            .is_null()
    }

    pub fn node_counts(&self) -> NodeCountsSnapshot {
        self.counts.snapshot()
    }

    /// # Safety
    ///
    /// `node` must be unlinked, its payload taken, and no other thread may hold a reference.
    unsafe fn free(&self, node: *mut CountedNode<T>) {
        debug_assert_eq!(
            unsafe { &(*node).internal_count }.load(Ordering::Relaxed),
            0,
            "freed a node that still has observers"
        );
        drop(unsafe { Box::from_raw(node) });
        self.counts.freed(1);
    }
}

impl<T> Drop for SplitCountStack<T> {
    fn drop(&mut self) {
        let mut node = CountedPtr::<T>::from_raw(self.head.load(Ordering::Relaxed)).ptr();
        while !node.is_null() {
            // Safety: &mut self, so every linked node is exclusively ours.
            let mut boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.ptr();
            unsafe { ManuallyDrop::drop(&mut boxed.value) };
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn counted_ptr_packs_count_and_address() {
        let node = Box::into_raw(Box::new(CountedNode::new(7u32)));
        let p = CountedPtr::new(1, node);
        assert_eq!(p.ptr(), node);
        assert_eq!(p.external_count(), 1);

        let q = p.with_one_more().with_one_more();
        assert_eq!(q.ptr(), node);
        assert_eq!(q.external_count(), 3);
        assert!(p != q);

        drop(unsafe { Box::from_raw(node) });
    }

    #[test]
    fn null_head_is_left_untouched() {
        let stack: SplitCountStack<u32> = SplitCountStack::new();
        for _ in 0..10 {
            assert_eq!(stack.pop(), None);
        }
        assert_eq!(stack.head.load(Ordering::Relaxed), CountedPtr::<u32>::NULL);
    }

    #[test]
    fn unlinked_node_carries_predecessor_count() {
        let stack = SplitCountStack::new();
        stack.push(1);
        // Pretend a reader is in flight on the bottom node.
        let head = CountedPtr::<i32>::from_raw(stack.head.load(Ordering::Relaxed));
        stack.head.store(head.with_one_more().raw, Ordering::Relaxed);
        stack.push(2);

        assert_eq!(stack.pop(), Some(2));
        let head = CountedPtr::<i32>::from_raw(stack.head.load(Ordering::Relaxed));
        assert_eq!(head.external_count(), 2);

        // Retire the pretend reader's reference the way a losing popper would.
        unsafe { &(*head.ptr()).internal_count }.fetch_sub(1, Ordering::Relaxed);
        // Internal is now -1. Our increment makes the external count 3, and 3 - 2 = 1 brings the
        // internal count back to zero.
        assert_eq!(stack.pop(), Some(1));
        let counts = stack.node_counts();
        assert_eq!(counts.allocated, 2);
        assert_eq!(counts.freed, 2);
    }

    #[test]
    fn lost_races_under_a_push_accumulate_without_overflow() {
        const LOST_RACES: u64 = 70_000;
        let stack = SplitCountStack::new();
        stack.push(0u64);

        for i in 1..=LOST_RACES {
            // A popper announces itself on the bottom node.
            let snapshot = CountedPtr::from_raw(stack.head.load(Ordering::Relaxed));
            let claimed = stack.increase_head_count(snapshot).unwrap();
            // A push covers the node, so the popper's unlink CAS fails.
            stack.push(i);
            unsafe { stack.release_reference(claimed.ptr()) };
            // Popping the cover exposes the bottom node again, stale increment included.
            assert_eq!(stack.pop(), Some(i));
        }

        let head = CountedPtr::<u64>::from_raw(stack.head.load(Ordering::Relaxed));
        assert_eq!(head.external_count(), LOST_RACES + 1);
        let internal = unsafe { &(*head.ptr()).internal_count }.load(Ordering::Relaxed);
        assert_eq!(internal, -(LOST_RACES as isize));

        assert_eq!(stack.pop(), Some(0));
        let counts = stack.node_counts();
        assert_eq!(counts.allocated, LOST_RACES as usize + 1);
        assert_eq!(counts.freed, counts.allocated);
        assert!(stack.is_empty());
    }

    #[test]
    #[should_panic(expected = "external count overflow")]
    fn saturated_external_count_is_refused() {
        let p = CountedPtr::<u32>::new(MAX_EXTERNAL_COUNT, ptr::null_mut());
        let _ = p.with_one_more();
    }
}
