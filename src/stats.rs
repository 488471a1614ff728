//! Monotonic client counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Point-in-time copy of a client's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Requests handed to the transport, retries included.
    pub dispatched: u64,
    /// 429 responses received.
    pub rate_limited: u64,
    /// Backpressure-zone delays served.
    pub pacing_delays: u64,
    /// Waits for a retry-after, an empty bucket, or an unavailable store.
    pub hard_blocks: u64,
    /// Waits imposed by the legacy error budget.
    pub budget_waits: u64,
    /// Requests that obtained no response.
    pub transport_errors: u64,
    /// Responses whose reported group differed from the classified one.
    pub group_mismatches: u64,
    /// Callers currently waiting for their turn.
    pub queued: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    dispatched: AtomicU64,
    rate_limited: AtomicU64,
    pacing_delays: AtomicU64,
    hard_blocks: AtomicU64,
    budget_waits: AtomicU64,
    transport_errors: AtomicU64,
    group_mismatches: AtomicU64,
    queued: AtomicUsize,
}

impl StatsRecorder {
    pub(crate) fn dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pacing_delay(&self) {
        self.pacing_delays.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn hard_block(&self) {
        self.hard_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn budget_wait(&self) {
        self.budget_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn group_mismatch(&self) {
        self.group_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a waiting caller until the returned guard drops.
    pub(crate) fn enqueue(&self) -> QueuedGuard<'_> {
        self.queued.fetch_add(1, Ordering::Relaxed);
        QueuedGuard { queued: &self.queued }
    }

    pub(crate) fn snapshot(&self) -> ClientStats {
        ClientStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            pacing_delays: self.pacing_delays.load(Ordering::Relaxed),
            hard_blocks: self.hard_blocks.load(Ordering::Relaxed),
            budget_waits: self.budget_waits.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            group_mismatches: self.group_mismatches.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct QueuedGuard<'a> {
    queued: &'a AtomicUsize,
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
    }
}
