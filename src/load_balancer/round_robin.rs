// src/load_balancer/round_robin.rs
use crate::proxy::Backend;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Rotation cursor shared by every concurrent dispatch.
///
/// Each selection reserves its starting slot with a single `fetch_add`, so
/// concurrent callers never land on the same slot. Skipped backends advance
/// the cursor as well, which keeps the next caller after the chosen one.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    /// Current raw cursor value; the effective index is `cursor % len`.
    pub fn cursor(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    /// Picks the next live backend, probing at most one full pass.
    pub fn select(&self, backends: &[Arc<dyn Backend>]) -> Option<Arc<dyn Backend>> {
        let len = backends.len();
        if len == 0 {
            return None;
        }

        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        for offset in 0..len {
            let candidate = &backends[start.wrapping_add(offset) % len];
            if candidate.is_alive() {
                if offset > 0 {
                    self.counter.fetch_add(offset, Ordering::Relaxed);
                }
                return Some(candidate.clone());
            }
        }

        self.counter.fetch_add(len - 1, Ordering::Relaxed);
        None
    }
}
