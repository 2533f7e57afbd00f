#[cfg(loom)]
pub(crate) mod atomic {
    pub(crate) use super::wide::AtomicU128;
    pub(crate) use loom::sync::atomic::{fence, AtomicIsize, AtomicPtr, AtomicUsize, Ordering};

    pub fn light_barrier() {
        fence(Ordering::SeqCst)
    }

    pub fn heavy_barrier() {
        fence(Ordering::SeqCst)
    }
}
#[cfg(loom)]
pub(crate) use loom::thread_local;

// Loom has no 128-bit atomic. A mutex around the word keeps every access a point loom can
// interleave at, with stronger ordering than the real thing.
#[cfg(loom)]
mod wide {
    use loom::sync::atomic::Ordering;
    use loom::sync::{Mutex, MutexGuard};
    use std::sync::PoisonError;

    pub(crate) struct AtomicU128(Mutex<u128>);

    impl AtomicU128 {
        pub(crate) fn new(v: u128) -> Self {
            Self(Mutex::new(v))
        }

        pub(crate) fn is_lock_free() -> bool {
            true
        }

        fn word(&self) -> MutexGuard<'_, u128> {
            self.0.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub(crate) fn load(&self, _: Ordering) -> u128 {
            *self.word()
        }

        pub(crate) fn compare_exchange(
            &self,
            current: u128,
            new: u128,
            _: Ordering,
            _: Ordering,
        ) -> Result<u128, u128> {
            let mut word = self.word();
            if *word == current {
                *word = new;
                Ok(current)
            } else {
                Err(*word)
            }
        }

        pub(crate) fn compare_exchange_weak(
            &self,
            current: u128,
            new: u128,
            success: Ordering,
            failure: Ordering,
        ) -> Result<u128, u128> {
            self.compare_exchange(current, new, success, failure)
        }
    }
}

#[cfg(not(loom))]
pub(crate) mod atomic {
    pub(crate) use core::sync::atomic::{fence, AtomicIsize, AtomicPtr, AtomicUsize, Ordering};
    pub(crate) use portable_atomic::AtomicU128;

    // Issued by a reader right after publishing a hazard address, before it re-reads the source.
    pub fn light_barrier() {
        fence(Ordering::SeqCst)
    }

    // Issued by a reclaimer after unlinking, before it reads the hazard slots.
    pub fn heavy_barrier() {
        fence(Ordering::SeqCst)
    }
}
#[cfg(not(loom))]
pub(crate) use std::thread_local;

/// Retry policy for CAS loops.
///
/// Outside of loom this is crossbeam's exponential backoff. Loom has to observe every retry as a
/// yield point, otherwise a failed CAS spins without giving the model a chance to schedule the
/// thread that made it fail.
#[cfg(not(loom))]
pub(crate) use crossbeam_utils::Backoff;

#[cfg(loom)]
pub(crate) struct Backoff;

#[cfg(loom)]
impl Backoff {
    pub(crate) fn new() -> Self {
        Backoff
    }

    pub(crate) fn spin(&self) {
        loom::thread::yield_now();
    }
}
