use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Minimal counters for operational visibility.
#[derive(Clone, Default, Debug)]
pub struct Counters {
    pub committed: Arc<AtomicU64>,
    pub reused: Arc<AtomicU64>,

    // retry reasons
    pub contention: Arc<AtomicU64>,
    pub store_errors: Arc<AtomicU64>,

    // terminal outcomes
    pub insufficient: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    pub fallback: Arc<AtomicU64>,

    pub stale_lock_overrides: Arc<AtomicU64>,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
