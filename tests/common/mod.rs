//! Shared test utilities.
//!
//! Set `RUST_LOG` (e.g. `RUST_LOG=reclaim_stack=trace`) to see the library's events.

#![allow(dead_code)]

use reclaim_stack::{HazardStack, NodeCountsSnapshot, RefCountStack, SplitCountStack};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a console subscriber filtered by `RUST_LOG`. Only the first call has an effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .with_test_writer()
            .try_init();
    });
}

/// The API every reclaiming stack offers, so properties can be checked once for all of them.
pub trait TestStack<T>: Send + Sync {
    fn push(&self, value: T);
    fn pop(&self) -> Option<T>;
    fn is_empty(&self) -> bool;
    fn node_counts(&self) -> NodeCountsSnapshot;
}

impl<T: Send> TestStack<T> for RefCountStack<T> {
    fn push(&self, value: T) {
        RefCountStack::push(self, value)
    }
    fn pop(&self) -> Option<T> {
        RefCountStack::pop(self)
    }
    fn is_empty(&self) -> bool {
        RefCountStack::is_empty(self)
    }
    fn node_counts(&self) -> NodeCountsSnapshot {
        RefCountStack::node_counts(self)
    }
}

impl<T: Send> TestStack<T> for SplitCountStack<T> {
    fn push(&self, value: T) {
        SplitCountStack::push(self, value)
    }
    fn pop(&self) -> Option<T> {
        SplitCountStack::pop(self)
    }
    fn is_empty(&self) -> bool {
        SplitCountStack::is_empty(self)
    }
    fn node_counts(&self) -> NodeCountsSnapshot {
        SplitCountStack::node_counts(self)
    }
}

impl<T: Send> TestStack<T> for HazardStack<'static, T> {
    fn push(&self, value: T) {
        HazardStack::push(self, value)
    }
    fn pop(&self) -> Option<T> {
        HazardStack::pop(self).expect("hazard slot available")
    }
    fn is_empty(&self) -> bool {
        HazardStack::is_empty(self)
    }
    fn node_counts(&self) -> NodeCountsSnapshot {
        HazardStack::node_counts(self)
    }
}

/// Payload that counts how often it has been dropped.
#[derive(Debug)]
pub struct CountDrops {
    pub id: usize,
    drops: Arc<AtomicUsize>,
}

impl CountDrops {
    pub fn new(id: usize, drops: &Arc<AtomicUsize>) -> Self {
        Self {
            id,
            drops: Arc::clone(drops),
        }
    }
}

impl Drop for CountDrops {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}
