//! Client configuration.
//!
//! Group sizes and classification rules are compiled in (see
//! [`crate::groups`]); this covers the knobs around them.

use crate::error_budget::ErrorBudgetConfig;
use crate::store::DEFAULT_KEY_PREFIX;
use std::time::Duration;

/// What gating does when the shared store cannot be read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreFailurePolicy {
    /// Dispatch without delay.
    #[default]
    FailOpen,
    /// Hold the request for the given duration, then gate again.
    FailClosed(Duration),
}

/// Invalid configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("key prefix must not be empty")]
    EmptyKeyPrefix,
    #[error("key prefix `{0}` must not end with ':' or contain control characters")]
    InvalidKeyPrefix(String),
    #[error("`{field}` must be greater than zero")]
    ZeroDuration { field: &'static str },
    #[error("invalid base url `{url}`: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("failed to build http client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Settings of an [`EsiClient`](crate::client::EsiClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    key_prefix: String,
    dispatch_spacing: Duration,
    address_lookup_timeout: Duration,
    store_failure_policy: StoreFailurePolicy,
    max_rate_limit_retries: Option<u32>,
    default_retry_after: Duration,
    error_budget: ErrorBudgetConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            dispatch_spacing: Duration::from_millis(100),
            address_lookup_timeout: Duration::from_secs(5),
            store_failure_policy: StoreFailurePolicy::FailOpen,
            max_rate_limit_retries: None,
            default_retry_after: Duration::from_secs(60),
            error_budget: ErrorBudgetConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder { config: ClientConfig::default() }
    }

    /// Prefix of shared bucket keys.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Minimum gap between two consecutive dispatches of one client.
    pub fn dispatch_spacing(&self) -> Duration {
        self.dispatch_spacing
    }

    pub fn address_lookup_timeout(&self) -> Duration {
        self.address_lookup_timeout
    }

    pub fn store_failure_policy(&self) -> StoreFailurePolicy {
        self.store_failure_policy
    }

    /// Consecutive 429s tolerated per request; `None` retries forever.
    pub fn max_rate_limit_retries(&self) -> Option<u32> {
        self.max_rate_limit_retries
    }

    /// Wait used when a 429 carries no usable `retry-after`.
    pub fn default_retry_after(&self) -> Duration {
        self.default_retry_after
    }

    pub fn error_budget(&self) -> &ErrorBudgetConfig {
        &self.error_budget
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    pub fn dispatch_spacing(mut self, spacing: Duration) -> Self {
        self.config.dispatch_spacing = spacing;
        self
    }

    pub fn address_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.config.address_lookup_timeout = timeout;
        self
    }

    pub fn store_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.config.store_failure_policy = policy;
        self
    }

    /// Fail a request with
    /// [`FetchError::RateLimitRetriesExhausted`](crate::FetchError::RateLimitRetriesExhausted)
    /// after `retries` retried 429s instead of retrying forever.
    pub fn max_rate_limit_retries(mut self, retries: u32) -> Self {
        self.config.max_rate_limit_retries = Some(retries);
        self
    }

    pub fn default_retry_after(mut self, wait: Duration) -> Self {
        self.config.default_retry_after = wait;
        self
    }

    pub fn error_budget(mut self, config: ErrorBudgetConfig) -> Self {
        self.config.error_budget = config;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let config = self.config;
        if config.key_prefix.is_empty() {
            return Err(ConfigError::EmptyKeyPrefix);
        }
        if config.key_prefix.ends_with(':') || config.key_prefix.chars().any(char::is_control) {
            return Err(ConfigError::InvalidKeyPrefix(config.key_prefix));
        }
        if config.address_lookup_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "address_lookup_timeout" });
        }
        if let StoreFailurePolicy::FailClosed(wait) = config.store_failure_policy {
            if wait.is_zero() {
                return Err(ConfigError::ZeroDuration { field: "store_failure_policy" });
            }
        }
        Ok(config)
    }
}
