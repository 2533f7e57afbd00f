use crate::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use core::ptr;

/// Owner value of a slot nobody has claimed.
pub(crate) const UNOWNED: usize = 0;

/// One entry of a [`Registry`](crate::Registry): who owns it, and what it protects.
pub(crate) struct SlotRecord {
    pub(crate) owner: AtomicUsize,
    pub(crate) ptr: AtomicPtr<u8>,
}

impl SlotRecord {
    pub(crate) fn new() -> Self {
        Self {
            owner: AtomicUsize::new(UNOWNED),
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn try_claim(&self, ticket: usize) -> bool {
        debug_assert_ne!(ticket, UNOWNED);
        self.owner.load(Ordering::Relaxed) == UNOWNED
            && self
                .owner
                .compare_exchange(UNOWNED, ticket, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    pub(crate) fn protect(&self, ptr: *mut u8) {
        self.ptr.store(ptr, Ordering::SeqCst);
    }

    pub(crate) fn reset(&self) {
        self.ptr.store(ptr::null_mut(), Ordering::Release);
    }

    pub(crate) fn is_owned(&self) -> bool {
        self.owner.load(Ordering::Acquire) != UNOWNED
    }

    /// Clear the published address and give the slot back.
    pub(crate) fn release(&self, ticket: usize) {
        debug_assert_eq!(
            self.owner.load(Ordering::Relaxed),
            ticket,
            "slot released by a participant that does not own it"
        );
        self.reset();
        self.owner.store(UNOWNED, Ordering::Release);
    }
}
