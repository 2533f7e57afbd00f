use crate::record::SlotRecord;
use crate::sync::atomic::{AtomicPtr, Ordering};
use crate::Registry;
use core::marker::PhantomData;

/// An owned hazard slot: the capability to dereference nodes of stacks in one [`Registry`].
///
/// Returned by [`Registry::register`]. A slot protects at most one address at a time; publishing
/// an address keeps the node at that address from being freed
/// through the registry until the slot is [reset](HazardSlot::reset), protects something else,
/// or is released.
///
/// The slot is released when this value is dropped, or explicitly through
/// [`HazardSlot::deregister`]. A leaked slot looks like a permanent "address in use" to every
/// reclamation pass, so it should never be forgotten with [`core::mem::forget`].
///
/// Slots are tied to the thread that registered them and cannot be sent to another thread.
pub struct HazardSlot<'registry> {
    rec: &'registry SlotRecord,
    registry: &'registry Registry,
    ticket: usize,
    _not_send: PhantomData<*mut ()>,
}

impl<'registry> HazardSlot<'registry> {
    pub(crate) fn new(
        registry: &'registry Registry,
        rec: &'registry SlotRecord,
        ticket: usize,
    ) -> Self {
        Self {
            rec,
            registry,
            ticket,
            _not_send: PhantomData,
        }
    }

    #[cfg(all(test, not(loom)))]
    pub(crate) fn record(&self) -> &SlotRecord {
        self.rec
    }

    /// The registry this slot belongs to.
    pub fn registry(&self) -> &'registry Registry {
        self.registry
    }

    /// Publish the pointer currently stored in `src` and return it once it is known to be stable.
    ///
    /// Publishes what it read, then re-reads `src`, and repeats until two reads agree.
    ///
    /// On return the slot publishes the returned pointer, or is clear if it is null. Whatever it
    /// points to stays allocated until the slot is reset, as long as every thread that frees such
    /// nodes first checks this slot's registry.
    pub(crate) fn protect<N>(&mut self, src: &AtomicPtr<N>) -> *mut N {
        let mut ptr = src.load(Ordering::Relaxed);
        loop {
            if ptr.is_null() {
                self.rec.reset();
                return ptr;
            }
            self.rec.protect(ptr.cast());

            crate::sync::atomic::light_barrier();

            let ptr2 = src.load(Ordering::Acquire);
            if ptr == ptr2 {
                return ptr;
            }
            ptr = ptr2;
        }
    }

    /// Stop protecting whatever this slot currently publishes.
    pub fn reset(&mut self) {
        self.rec.reset();
    }

    /// Release the slot so that another participant can claim it.
    pub fn deregister(self) {
        drop(self);
    }
}

impl Drop for HazardSlot<'_> {
    fn drop(&mut self) {
        self.registry.release(self.rec, self.ticket);
    }
}

impl core::fmt::Debug for HazardSlot<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HazardSlot")
            .field("ticket", &self.ticket)
            .field("protected", &self.rec.ptr.load(Ordering::Relaxed))
            .finish()
    }
}
