//! Token bucket state shared between processes through the store.

use crate::groups::RateLimitGroupConfig;
use serde::{Deserialize, Serialize};

/// State of one (outbound address, group) bucket.
///
/// Serialized with camelCase field names so every process sharing the store,
/// whatever it is written in, reads the same record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucketState {
    pub tokens_used: u32,
    pub tokens_remaining: u32,
    pub max_tokens: u32,
    /// Window length in seconds.
    pub window: u64,
    /// Start of the current window, epoch milliseconds.
    pub last_reset: u64,
    /// Hard block until this instant (epoch milliseconds), set after a 429.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl TokenBucketState {
    /// A full bucket whose window starts at `now`.
    pub fn fresh(config: &RateLimitGroupConfig, now: u64) -> Self {
        Self {
            tokens_used: 0,
            tokens_remaining: config.max_tokens,
            max_tokens: config.max_tokens,
            window: config.window_secs,
            last_reset: now,
            retry_after: None,
        }
    }

    pub fn window_millis(&self) -> u64 {
        self.window.saturating_mul(1_000)
    }

    /// The floating window has run out and the bucket should start over.
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.last_reset) >= self.window_millis()
    }

    /// Milliseconds left in the current window.
    pub fn window_remaining(&self, now: u64) -> u64 {
        self.window_millis().saturating_sub(now.saturating_sub(self.last_reset))
    }

    /// Share of the window's tokens already used, in percent.
    pub fn usage_percent(&self) -> f64 {
        if self.max_tokens == 0 {
            return 100.0;
        }
        f64::from(self.tokens_used) / f64::from(self.max_tokens) * 100.0
    }

    /// Charge `cost` tokens against the bucket.
    pub fn consume(&mut self, cost: u32) {
        self.tokens_used = self.tokens_used.saturating_add(cost);
        self.tokens_remaining = self.tokens_remaining.saturating_sub(cost);
    }

    /// Adopt the counts reported by the upstream.
    ///
    /// A reported remaining count is taken as is and the used count derived
    /// from it. Without one, a reported `used` (the upstream's charge for this
    /// call) is added to the used count and the remaining count recomputed.
    pub fn apply_reported(&mut self, remaining: Option<u32>, used: Option<u32>) {
        match (remaining, used) {
            (Some(remaining), _) => {
                self.tokens_remaining = remaining;
                self.tokens_used = self.max_tokens.saturating_sub(remaining);
            }
            (None, Some(used)) => {
                self.tokens_used = self.tokens_used.saturating_add(used);
                self.tokens_remaining = self.max_tokens.saturating_sub(self.tokens_used);
            }
            (None, None) => {}
        }
    }
}
