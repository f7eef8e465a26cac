//! Round-robin selection across backends.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin selector.
/// Stores an internal counter to rotate through candidates.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next candidate accepted by `eligible`, starting one past the previous
    /// pick. `None` when every candidate is refused.
    pub fn next<'a, T>(&self, candidates: &'a [T], mut eligible: impl FnMut(&T) -> bool) -> Option<&'a T> {
        if candidates.is_empty() {
            return None;
        }

        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        let len = candidates.len();
        (0..len)
            .map(|i| &candidates[(start + i) % len])
            .find(|candidate| eligible(candidate))
    }
}
