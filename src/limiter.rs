//! Floating-window token bucket limiter shared through the store.
//!
//! - [`RateLimiter::calculate_delay`] decides how long to wait before a call.
//! - [`RateLimiter::consume_tokens`] charges a completed call.
//! - [`RateLimiter::handle_rate_limit`] records a 429.
//!
//! Windows reset lazily: a bucket whose window ran out is replaced by a full
//! one the next time anyone reads or charges it. There is no partial refill.
//!
//! Below 50% usage calls go straight through; above it a random pacing delay
//! grows with usage (see [`zone_delay`]).

use crate::address::OutboundAddressResolver;
use crate::bucket::TokenBucketState;
use crate::clock::{Clock, SystemClock};
use crate::config::StoreFailurePolicy;
use crate::groups::group_config;
use crate::headers::reported_tokens;
use crate::store::{KeyValueStore, SharedBucketStore, StoreError};
use rand::Rng;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;

/// Usage (percent) at which a warning is logged.
pub const WARN_USAGE_PERCENT: f64 = 80.0;

/// Why a call must wait regardless of usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// The upstream answered 429 and its retry-after has not passed.
    RetryAfter,
    /// Not enough tokens left; wait for the window to end.
    Exhausted,
    /// The shared store failed and the policy is fail-closed.
    StoreUnavailable,
}

/// Outcome of gating one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Dispatch now.
    Ready,
    /// Backpressure zone delay.
    Pace(Duration),
    /// Hard block.
    Blocked { wait: Duration, reason: BlockReason },
}

impl Gate {
    /// Time to wait before dispatching; zero when ready.
    pub fn delay(&self) -> Duration {
        match self {
            Gate::Ready => Duration::ZERO,
            Gate::Pace(delay) => *delay,
            Gate::Blocked { wait, .. } => *wait,
        }
    }
}

/// Random pacing delay for a bucket at `usage_percent`.
///
/// | usage        | delay (ms)     |
/// |--------------|----------------|
/// | < 50         | 0              |
/// | 50 .. 80     | [100, 600)     |
/// | 80 .. 95     | [1000, 3000)   |
/// | >= 95        | [2000, 5000)   |
pub fn zone_delay<R: Rng>(usage_percent: f64, rng: &mut R) -> Duration {
    let millis = if usage_percent < 50.0 {
        0
    } else if usage_percent < 80.0 {
        rng.random_range(100..600)
    } else if usage_percent < 95.0 {
        rng.random_range(1_000..3_000)
    } else {
        rng.random_range(2_000..5_000)
    };
    Duration::from_millis(millis)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    Kept,
    Created,
    WindowReset,
    RetryAfterCleared,
}

/// Current state of a bucket after lazy resets, and what changed.
fn refreshed(current: Option<TokenBucketState>, group: &str, now: u64) -> (TokenBucketState, Refresh) {
    let config = group_config(group);
    match current {
        None => (TokenBucketState::fresh(config, now), Refresh::Created),
        Some(state) if state.is_expired(now) => {
            (TokenBucketState::fresh(config, now), Refresh::WindowReset)
        }
        Some(state) if state.retry_after.is_some_and(|until| until <= now) => {
            (TokenBucketState::fresh(config, now), Refresh::RetryAfterCleared)
        }
        Some(state) => (state, Refresh::Kept),
    }
}

fn evaluate(state: &TokenBucketState, cost: u32, now: u64) -> Gate {
    if let Some(until) = state.retry_after {
        if until > now {
            return Gate::Blocked {
                wait: Duration::from_millis(until - now),
                reason: BlockReason::RetryAfter,
            };
        }
    }
    if state.tokens_remaining < cost {
        return Gate::Blocked {
            wait: Duration::from_millis(state.window_remaining(now)),
            reason: BlockReason::Exhausted,
        };
    }
    match zone_delay(state.usage_percent(), &mut rand::rng()) {
        delay if delay.is_zero() => Gate::Ready,
        delay => Gate::Pace(delay),
    }
}

/// Token bucket limiter keyed by (outbound address, group).
#[derive(Debug)]
pub struct RateLimiter<K> {
    store: SharedBucketStore<K>,
    address: Arc<OutboundAddressResolver>,
    clock: Arc<dyn Clock>,
    failure_policy: StoreFailurePolicy,
}

impl<K> RateLimiter<K>
where
    K: KeyValueStore,
{
    pub fn new(store: SharedBucketStore<K>, address: Arc<OutboundAddressResolver>) -> Self {
        Self {
            store,
            address,
            clock: Arc::new(SystemClock),
            failure_policy: StoreFailurePolicy::default(),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_clock_arc(Arc::new(clock))
    }

    pub(crate) fn with_clock_arc(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn store(&self) -> &SharedBucketStore<K> {
        &self.store
    }

    /// Outbound address used in bucket keys.
    pub async fn address(&self) -> &str {
        self.address.resolve().await
    }

    /// Current bucket for `group`, as stored.
    pub async fn state(&self, group: &str) -> Result<Option<TokenBucketState>, StoreError> {
        let address = self.address.resolve().await;
        self.store.get(address, group).await
    }

    /// Milliseconds-resolution wait before a call costing `cost` tokens.
    pub async fn calculate_delay(&self, group: &str, cost: u32) -> Duration {
        self.assess(group, cost).await.delay()
    }

    /// Gate a call costing `cost` tokens against the bucket of `group`.
    ///
    /// A missing bucket is created full, an expired one reset, and an expired
    /// retry-after cleared; all three are persisted.
    pub async fn assess(&self, group: &str, cost: u32) -> Gate {
        let address = self.address.resolve().await;
        let now = self.clock.now_millis();
        let mut observed = None;
        let mut refresh = Refresh::Kept;

        let result = self
            .store
            .update(address, group, |current| {
                let (state, change) = refreshed(current, group, now);
                refresh = change;
                observed = Some(state.clone());
                (change != Refresh::Kept).then_some(state)
            })
            .await;

        if let Err(e) = result {
            return self.store_failed(group, "gate", &e);
        }
        let Some(state) = observed else {
            return Gate::Ready;
        };
        match refresh {
            Refresh::WindowReset => tracing::info!(group, address, "rate limit window reset"),
            Refresh::RetryAfterCleared => {
                tracing::info!(group, address, "retry-after passed; starting a fresh window")
            }
            Refresh::Created | Refresh::Kept => {}
        }

        let gate = evaluate(&state, cost, now);
        if gate != Gate::Ready {
            tracing::debug!(
                group,
                delay_ms = gate.delay().as_millis() as u64,
                remaining = state.tokens_remaining,
                usage = state.usage_percent(),
                "delaying request"
            );
        }
        gate
    }

    /// Charge a completed call against the bucket of `group`.
    ///
    /// Token counts reported in `headers` take precedence over `cost`.
    /// Store failures are logged and otherwise ignored.
    pub async fn consume_tokens(&self, group: &str, cost: u32, headers: Option<&HeaderMap>) {
        let (remaining, used) = headers.map(reported_tokens).unwrap_or((None, None));
        let address = self.address.resolve().await;
        let now = self.clock.now_millis();
        let mut before = 0.0;

        let result = self
            .store
            .update(address, group, |current| {
                let (mut state, _) = refreshed(current, group, now);
                before = state.usage_percent();
                if remaining.is_some() || used.is_some() {
                    state.apply_reported(remaining, used);
                } else {
                    state.consume(cost);
                }
                Some(state)
            })
            .await;

        match result {
            Ok(Some(state)) => {
                let usage = state.usage_percent();
                if before < WARN_USAGE_PERCENT && usage >= WARN_USAGE_PERCENT {
                    tracing::warn!(
                        group,
                        usage,
                        remaining = state.tokens_remaining,
                        max = state.max_tokens,
                        "rate limit usage above 80%"
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.store_failed(group, "consume", &e);
            }
        }
    }

    /// Record a 429: block `group` for `retry_after` and empty its bucket.
    pub async fn handle_rate_limit(&self, group: &str, retry_after: Duration) {
        let address = self.address.resolve().await;
        let now = self.clock.now_millis();
        let wait_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
        tracing::warn!(group, address, retry_after_s = retry_after.as_secs(), "rate limited by upstream");

        let result = self
            .store
            .update(address, group, |current| {
                let (mut state, _) = refreshed(current, group, now);
                state.retry_after = Some(now.saturating_add(wait_ms));
                state.tokens_remaining = 0;
                Some(state)
            })
            .await;
        if let Err(e) = result {
            self.store_failed(group, "rate limit", &e);
        }
    }

    fn store_failed(&self, group: &str, operation: &'static str, error: &StoreError) -> Gate {
        tracing::warn!(group, operation, error = %error, policy = ?self.failure_policy, "shared store unavailable");
        match self.failure_policy {
            StoreFailurePolicy::FailOpen => Gate::Ready,
            StoreFailurePolicy::FailClosed(wait) => {
                Gate::Blocked { wait, reason: BlockReason::StoreUnavailable }
            }
        }
    }
}
