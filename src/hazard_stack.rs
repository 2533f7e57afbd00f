//! A Treiber stack whose poppers protect the head with hazard pointers.
//!
//! Before a popper dereferences the head node it publishes the node's address in its
//! [`HazardSlot`] and re-reads the head to make sure the node was still linked at that point.
//! Whoever unlinks a node frees it straight away if no slot in the registry holds its address, and
//! retires it into the registry otherwise. Every pop also makes one pass over the registry's
//! retired nodes and frees those that are no longer protected.

use crate::hazard::HazardSlot;
use crate::node::{link_head, Node, NodeCounts, NodeCountsSnapshot};
use crate::sync::atomic::{AtomicPtr, Ordering};
use crate::sync::{thread_local, Backoff};
use crate::{Registry, Result};
use core::cell::RefCell;
use core::marker::PhantomData;
use core::ptr;

thread_local! {
    // Slots registered implicitly by `HazardStack::pop`, at most one per registry. Dropped, and
    // so released, when the thread exits.
    static LOCAL_SLOTS: RefCell<Vec<HazardSlot<'static>>> = RefCell::new(Vec::new());
}

/// A lock-free stack that defers reclamation of nodes other threads are reading.
///
/// The `'registry` lifetime ties the stack to the [`Registry`] its readers register with; use
/// [`HazardStack::new`] for the process-wide one.
///
/// There are two ways to pop:
///
/// * [`HazardStack::pop_with`] takes the caller's [`HazardSlot`] explicitly. This works with
///   any registry and never fails.
/// * [`HazardStack::pop`] registers a slot for the calling thread on first use and keeps it in
///   a thread-local until the thread exits or calls [`HazardStack::deregister_thread`]. This
///   requires a `'static` registry, and fails with
///   [`Error::ResourceExhausted`](crate::Error::ResourceExhausted) if no slot is free.
pub struct HazardStack<'registry, T> {
    head: AtomicPtr<Node<T>>,
    registry: &'registry Registry,
    counts: NodeCounts,
    _owns: PhantomData<*mut T>,
}

// Safety: values move between threads through the stack but are never shared.
unsafe impl<T: Send> Send for HazardStack<'_, T> {}
unsafe impl<T: Send> Sync for HazardStack<'_, T> {}

// Frees a node retired by a `HazardStack<T>`; its payload has already been taken.
unsafe fn free_node<T>(ptr: *mut u8) {
    #[cfg(all(test, not(loom)))]
    tests::assert_not_validated(ptr);
    // Safety: by the contract of `Registry::retire`.
    unsafe { Node::free(ptr.cast::<Node<T>>()) };
}

impl<T> Default for HazardStack<'static, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HazardStack<'static, T> {
    /// Create an empty stack in the [global registry](Registry::global).
    pub fn new() -> Self {
        Self::in_registry(Registry::global())
    }

    /// Pop using the calling thread's implicitly registered slot.
    ///
    /// The first call on a thread claims a slot in this stack's registry. Returns `Ok(None)` if the
    /// stack was empty.
    pub fn pop(&self) -> Result<Option<T>> {
        with_local_slot(self.registry, |slot| self.pop_with(slot))
    }

    /// Claim the calling thread's slot now rather than on its first [`HazardStack::pop`].
    pub fn register_thread(&self) -> Result<()> {
        with_local_slot(self.registry, |_| ())
    }

    /// Release the calling thread's implicitly registered slot, if it has one.
    ///
    /// Slots are also released when the thread exits.
    pub fn deregister_thread(&self) {
        let registry = self.registry;
        let _ = LOCAL_SLOTS.try_with(|slots| {
            if let Ok(mut slots) = slots.try_borrow_mut() {
                slots.retain(|slot| !ptr::eq(slot.registry(), registry));
            }
        });
    }
}

fn with_local_slot<R>(
    registry: &'static Registry,
    f: impl FnOnce(&mut HazardSlot<'static>) -> R,
) -> Result<R> {
    let mut f = Some(f);
    let local = LOCAL_SLOTS.try_with(|slots| {
        let Ok(mut slots) = slots.try_borrow_mut() else {
            return None;
        };
        let index = match slots.iter().position(|s| ptr::eq(s.registry(), registry)) {
            Some(index) => index,
            None => match registry.register() {
                Ok(slot) => {
                    slots.push(slot);
                    slots.len() - 1
                }
                Err(e) => return Some(Err(e)),
            },
        };
        let f = f.take()?;
        Some(Ok(f(&mut slots[index])))
    });

    match local {
        Ok(Some(result)) => result,
        // The thread-local is being torn down or is already borrowed further up the stack, so
        // fall back to a slot that only lives for this call.
        _ => {
            let mut slot = registry.register()?;
            match f.take() {
                Some(f) => Ok(f(&mut slot)),
                None => unreachable!("slot callback ran but produced no result"),
            }
        }
    }
}

impl<'registry, T> HazardStack<'registry, T> {
    /// Create an empty stack whose readers register in `registry`.
    pub fn in_registry(registry: &'registry Registry) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            registry,
            counts: NodeCounts::new(),
            _owns: PhantomData,
        }
    }

    pub fn registry(&self) -> &'registry Registry {
        self.registry
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

    /// Pop the top value, using `slot` to protect the head while reading it.
    ///
    /// Returns `None` if the stack was empty; in
    /// that case nothing is allocated and nothing is retired.
    ///
    /// # Panics
    ///
    /// If `slot` was not registered in this stack's [registry](HazardStack::registry).
    pub fn pop_with(&self, slot: &mut HazardSlot<'_>) -> Option<T> {
        // A slot from another registry is invisible to this stack's reclamation.
        assert!(
            ptr::eq(slot.registry(), self.registry),
            "hazard slot belongs to a different registry than the stack"
        );

        let backoff = Backoff::new();
        let head = loop {
            let head = slot.protect(&self.head);
            if head.is_null() {
                return None;
            }
            // Safety: `head` was linked after we published it, so it cannot be freed until we
            // reset the slot.
            let next = unsafe { &*head }.next.load(Ordering::Relaxed);
            if self
                .head
                .compare_exchange(head, next, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break head;
            }
            backoff.spin();
        };
        slot.reset();

        // Safety: we unlinked `head`, so its payload is ours.
        let value = unsafe { Node::take(head) };
        if self.registry.is_protected(head.cast()) {
            // Safety: `head` is unlinked, retired once, and `free_node` matches its type.
            unsafe { self.registry.retire(head.cast(), free_node::<T>) };
            self.counts.retired();
        } else {
            // Safety: unlinked and unprotected. Anyone publishing it from now on will fail to
            // validate against the head and never dereference it.
            unsafe { free_node::<T>(head.cast()) };
            self.counts.freed(1);
        }

        self.registry.reclaim();
        Some(value)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    pub fn node_counts(&self) -> NodeCountsSnapshot {
        self.counts.snapshot()
    }
}

impl<T> Drop for HazardStack<'_, T> {
    fn drop(&mut self) {
        // Every pop resets its slot before returning, so once we have &mut self no slot can
        // publish a node that is still linked.
        let mut node = self.head.load(Ordering::Relaxed);
        while !node.is_null() {
            let next = unsafe { &*node }.next.load(Ordering::Relaxed);
            unsafe { Node::destroy(node) };
            node = next;
        }
    }
}
