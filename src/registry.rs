use crate::hazard::HazardSlot;
use crate::record::{SlotRecord, UNOWNED};
use crate::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use crate::sync::Backoff;
use crate::{Error, Result};
use crossbeam_utils::CachePadded;
use std::collections::BTreeSet;

/// Number of hazard slots in the [global registry](Registry::global).
#[cfg(not(loom))]
pub const DEFAULT_CAPACITY: usize = 100;
#[cfg(loom)]
pub const DEFAULT_CAPACITY: usize = 4;

#[cfg(not(loom))]
static GLOBAL: std::sync::OnceLock<Registry> = std::sync::OnceLock::new();

#[cfg(loom)]
loom::lazy_static! {
    static ref GLOBAL: Registry = Registry::new(DEFAULT_CAPACITY);
}

/// A bounded table of hazard slots, and the list of nodes retired against it.
///
/// Every participant in a [`HazardStack`](crate::HazardStack) owns one slot of the registry the
/// stack was created in, in which it publishes the address of the node it is about to
/// dereference. A popped node whose address appears in any slot is not freed but _retired_ into
/// the registry, and reclaimed by a later pass once no slot holds it any more.
///
/// The table has a fixed size chosen at construction. Claiming a slot is a lock-free scan over
/// it; if every slot is owned, [`Registry::register`] fails with
/// [`Error::ResourceExhausted`] rather than letting the caller proceed unprotected.
///
/// Hazard slots only guard against reclamation through the registry they were claimed from. A
/// stack and every slot used to pop from it must therefore share one registry, which
/// [`HazardStack::pop_with`](crate::HazardStack::pop_with) enforces.
///
/// There is one process-wide registry, reachable through [`Registry::global`], which is created
/// on first use and lives until the process exits. Separate instances made with
/// [`Registry::new`] reclaim whatever is still retired in them when they are dropped; the borrow
/// held by every [`HazardSlot`] guarantees no slot is in use at that point.
pub struct Registry {
    slots: Box<[CachePadded<SlotRecord>]>,
    retired: RetiredList,
    nretired: AtomicUsize,
    next_ticket: AtomicUsize,
}

impl Registry {
    /// Get a handle to the process-wide registry.
    pub fn global() -> &'static Self {
        #[cfg(not(loom))]
        {
            GLOBAL.get_or_init(|| Registry::new(DEFAULT_CAPACITY))
        }
        #[cfg(loom)]
        {
            &GLOBAL
        }
    }

    /// Construct a registry with room for `capacity` concurrent participants.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| CachePadded::new(SlotRecord::new()))
                .collect(),
            retired: RetiredList::new(),
            nretired: AtomicUsize::new(0),
            next_ticket: AtomicUsize::new(UNOWNED + 1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently owned by a participant.
    pub fn registered(&self) -> usize {
        self.slots.iter().filter(|rec| rec.is_owned()).count()
    }

    /// Number of retired nodes that have not been reclaimed yet.
    pub fn retired_len(&self) -> usize {
        self.nretired.load(Ordering::Acquire)
    }

    /// Claim a free slot.
    ///
    /// The slot stays claimed until the returned [`HazardSlot`] is dropped or
    /// [deregistered](HazardSlot::deregister).
    pub fn register(&self) -> Result<HazardSlot<'_>> {
        let mut ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        if ticket == UNOWNED {
            // Wrapped around.
            ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        }

        for (index, rec) in self.slots.iter().enumerate() {
            if rec.try_claim(ticket) {
                tracing::debug!(slot = index, ticket, "registered hazard slot");
                return Ok(HazardSlot::new(self, rec, ticket));
            }
        }

        tracing::warn!(capacity = self.capacity(), "hazard slot table exhausted");
        Err(Error::ResourceExhausted {
            capacity: self.capacity(),
        })
    }

    pub(crate) fn release(&self, rec: &SlotRecord, ticket: usize) {
        rec.release(ticket);
        tracing::debug!(ticket, "released hazard slot");
    }

    /// Whether any slot currently publishes `addr`.
    pub(crate) fn is_protected(&self, addr: *mut u8) -> bool {
        crate::sync::atomic::heavy_barrier();
        self.slots
            .iter()
            .any(|rec| rec.ptr.load(Ordering::Acquire) == addr)
    }

    /// Hand `ptr` over to the registry, to be passed to `deleter` once no slot protects it.
    ///
    /// # Safety
    ///
    /// 1. `ptr` is unreachable for any thread that has not already published it in a slot.
    /// 2. `ptr` has not been retired before.
    /// 3. `deleter(ptr)` is sound to call exactly once, from any thread, at any later point.
    pub(crate) unsafe fn retire(&self, ptr: *mut u8, deleter: unsafe fn(*mut u8)) {
        debug_assert!(!ptr.is_null());
        let retired = Box::into_raw(Box::new(Retired {
            ptr,
            deleter,
            next: AtomicPtr::new(core::ptr::null_mut()),
        }));
        // Count first so `retired_len` never undercounts what a concurrent pass may reclaim.
        self.nretired.fetch_add(1, Ordering::Release);
        // Safety: `retired` is a fresh single-element list.
        unsafe { self.retired.push(retired, retired) };
        tracing::trace!(addr = ?ptr, "retired node");
    }

    /// Reclaim every retired node that no slot protects.
    ///
    /// Returns the number of nodes reclaimed.
    pub fn eager_reclaim(&self) -> usize {
        self.reclaim()
    }

    // Only used for tests: repeat until a pass makes no progress.
    #[doc(hidden)]
    pub fn cleanup(&self) -> usize {
        let mut total = 0;
        loop {
            let n = self.reclaim();
            if n == 0 {
                break total;
            }
            total += n;
        }
    }

    pub(crate) fn reclaim(&self) -> usize {
        let stolen = self.retired.pop_all();
        if stolen.is_null() {
            return 0;
        }

        crate::sync::atomic::heavy_barrier();

        // Find all guarded addresses.
        let guarded: BTreeSet<*mut u8> = self
            .slots
            .iter()
            .map(|rec| rec.ptr.load(Ordering::Acquire))
            .filter(|ptr| !ptr.is_null())
            .collect();

        let mut unreclaimed = core::ptr::null_mut();
        let mut unreclaimed_tail: *mut Retired = core::ptr::null_mut();
        let mut reclaimable = core::ptr::null_mut();
        let mut nreclaimed = 0;

        let mut node = stolen;
        while !node.is_null() {
            // Safety: we stole the whole list, so nobody else touches these records.
            let n = unsafe { &*node };
            let next = n.next.load(Ordering::Relaxed);
            debug_assert_ne!(node, next);

            if guarded.contains(&n.ptr) {
                n.next.store(unreclaimed, Ordering::Relaxed);
                unreclaimed = node;
                if unreclaimed_tail.is_null() {
                    unreclaimed_tail = unreclaimed;
                }
            } else {
                n.next.store(reclaimable, Ordering::Relaxed);
                reclaimable = node;
                nreclaimed += 1;
            }
            node = next;
        }

        // Safety: none of `reclaimable` is guarded, and each was retired exactly once.
        unsafe { Self::reclaim_unconditional(reclaimable) };
        if nreclaimed != 0 {
            self.nretired.fetch_sub(nreclaimed, Ordering::Release);
        }

        // Safety: `unreclaimed..=unreclaimed_tail` is a chain we own.
        unsafe { self.retired.push(unreclaimed, unreclaimed_tail) };

        tracing::trace!(reclaimed = nreclaimed, "reclamation pass");
        nreclaimed
    }

    /// # Safety
    ///
    /// Every record in `retired` must be owned by the caller and safe to delete.
    unsafe fn reclaim_unconditional(mut retired: *mut Retired) {
        while !retired.is_null() {
            let n = unsafe { Box::from_raw(retired) };
            retired = n.next.load(Ordering::Relaxed);
            // Safety: by the contract of `retire`.
            unsafe { (n.deleter)(n.ptr) };
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        debug_assert_eq!(self.registered(), 0);
        let head = self.retired.pop_all();
        // Safety: &mut self implies that no slot is in use, so nothing is protected.
        unsafe { Self::reclaim_unconditional(head) };
    }
}

struct Retired {
    ptr: *mut u8,
    deleter: unsafe fn(*mut u8),
    next: AtomicPtr<Retired>,
}

struct RetiredList {
    head: AtomicPtr<Retired>,
}

impl RetiredList {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// # Safety
    ///
    /// `sublist_head..=sublist_tail` is a chain owned by the caller, or both are null.
    unsafe fn push(&self, sublist_head: *mut Retired, sublist_tail: *mut Retired) {
        if sublist_head.is_null() {
            return;
        }

        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // Safety: the tail is ours until the CAS publishes it.
            unsafe { &*sublist_tail }.next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                sublist_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(head_now) => {
                    head = head_now;
                    backoff.spin();
                }
            }
        }
    }

    fn pop_all(&self) -> *mut Retired {
        self.head.swap(core::ptr::null_mut(), Ordering::Acquire)
    }
}
