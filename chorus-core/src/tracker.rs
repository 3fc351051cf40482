//! Count of connections owned by this instance.
//!
//! Never published; it only tells the shutdown reconciler how much this
//! instance contributed to the shared counter.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct ConnectionTracker {
    local_open: AtomicUsize,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connect whose shared increment succeeded.
    pub fn opened(&self) -> usize {
        self.local_open.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record a disconnect whose shared decrement succeeded.
    pub fn closed(&self) -> usize {
        let previous = self
            .local_open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn local_open(&self) -> usize {
        self.local_open.load(Ordering::SeqCst)
    }
}
