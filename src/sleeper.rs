//! Abstraction for sleeping/waiting
//!
//! Every wait the client performs (backpressure, hard blocks, retry-after,
//! dispatch spacing) goes through a [`Sleeper`], so tests can run the whole
//! gating loop without real time passing.

use crate::clock::ManualClock;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstraction for sleeping/waiting
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test sleeper that records every call and returns immediately.
///
/// When built with [`TrackingSleeper::with_clock`], each call also advances the
/// given [`ManualClock`] by the requested duration, which is what makes
/// time-based gating loops terminate under test.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
    clock: Option<ManualClock>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record calls and advance `clock` by each slept duration.
    pub fn with_clock(clock: ManualClock) -> Self {
        Self { calls: Arc::default(), clock: Some(clock) }
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Sum of all recorded sleeps.
    pub fn total(&self) -> Duration {
        self.calls().into_iter().sum()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(duration);
        if let Some(clock) = &self.clock {
            clock.advance(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        }
        // Yield so other tasks queued behind this one still get polled.
        Box::pin(tokio::task::yield_now())
    }
}
