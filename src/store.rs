//! Shared bucket storage.
//!
//! Two layers:
//! - [`KeyValueStore`]: the external key-value store every process talks to
//!   (raw string values with a TTL, plus compare-and-swap). Implement it for
//!   your backend; `esi-throttle-redis` provides a Redis one and
//!   [`InMemoryStore`] serves single-process use and tests.
//! - [`SharedBucketStore`]: typed access to [`TokenBucketState`] records keyed
//!   by `prefix:address:group`, with a TTL of `window + 60` seconds so unused
//!   buckets garbage-collect themselves.
//!
//! Plain `get` then `set` is a read-modify-write race between processes.
//! [`SharedBucketStore::update`] narrows it with an optimistic
//! compare-and-swap loop and falls back to a last-writer-wins `set` when the
//! key stays contended.

use crate::bucket::TokenBucketState;
use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default key prefix for bucket records.
pub const DEFAULT_KEY_PREFIX: &str = "esi-rate-limit";

/// Extra lifetime given to a bucket record beyond its window.
pub const TTL_SLACK: Duration = Duration::from_secs(60);

const CAS_ATTEMPTS: usize = 3;

/// Abstract external key-value store holding bucket records.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the raw value stored under `key`, if any.
    async fn get_raw(&self, key: &str) -> Result<Option<String>, Self::Error>;

    /// Store `value` under `key`, expiring after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Self::Error>;

    /// Store `value` only if the current value equals `expected` (`None`: key absent).
    ///
    /// Returns `Ok(false)` when another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, Self::Error>;
}

#[async_trait]
impl<K: KeyValueStore + ?Sized> KeyValueStore for Arc<K> {
    type Error = K::Error;

    async fn get_raw(&self, key: &str) -> Result<Option<String>, Self::Error> {
        (**self).get_raw(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Self::Error> {
        (**self).set_with_ttl(key, value, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, Self::Error> {
        (**self).compare_and_swap(key, expected, value, ttl).await
    }
}

/// Errors surfaced by [`SharedBucketStore`].
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The backing key-value store failed.
    #[error("shared store {operation} failed: {source}")]
    Backend {
        /// Operation that failed (`get`, `set`, `compare_and_swap`).
        operation: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A bucket could not be encoded.
    #[error("failed to encode bucket state: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    fn backend<E>(operation: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend { operation, source: Box::new(source) }
    }
}

/// Simple in-memory store with TTL expiry, for a single process and for tests.
#[derive(Clone, Debug)]
pub struct InMemoryStore {
    // key -> (value, expires_at_millis)
    data: Arc<Mutex<HashMap<String, (String, u64)>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { data: Arc::default(), clock: Arc::new(SystemClock) }
    }

    /// Evaluate expiry against `clock` instead of the wall clock.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        let guard = self.data.lock().unwrap_or_else(|e| e.into_inner());
        guard.values().filter(|(_, expires_at)| *expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_value(map: &mut HashMap<String, (String, u64)>, key: &str, now: u64) -> Option<String> {
        match map.get(key) {
            Some((value, expires_at)) if *expires_at > now => Some(value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    fn expires_at(&self, ttl: Duration) -> u64 {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.clock.now_millis().saturating_add(ttl_ms)
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    type Error = std::convert::Infallible;

    async fn get_raw(&self, key: &str) -> Result<Option<String>, Self::Error> {
        let now = self.clock.now_millis();
        let mut guard = self.data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Self::live_value(&mut guard, key, now))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Self::Error> {
        let expires_at = self.expires_at(ttl);
        let mut guard = self.data.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, Self::Error> {
        let now = self.clock.now_millis();
        let expires_at = self.expires_at(ttl);
        let mut guard = self.data.lock().unwrap_or_else(|e| e.into_inner());

        let current = Self::live_value(&mut guard, key, now);
        if current.as_deref() != expected {
            return Ok(false); // Race detected
        }
        guard.insert(key.to_string(), (value.to_string(), expires_at));
        Ok(true)
    }
}

/// Typed, key-namespaced access to bucket records in a [`KeyValueStore`].
#[derive(Debug, Clone)]
pub struct SharedBucketStore<K> {
    kv: K,
    prefix: String,
}

impl<K> SharedBucketStore<K>
where
    K: KeyValueStore,
{
    /// Wrap `kv` using the default `esi-rate-limit` key prefix.
    pub fn new(kv: K) -> Self {
        Self::with_prefix(kv, DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(kv: K, prefix: impl Into<String>) -> Self {
        Self { kv, prefix: prefix.into() }
    }

    /// Borrow the backing key-value store.
    pub fn kv(&self) -> &K {
        &self.kv
    }

    /// Record key of the bucket for (`address`, `group`).
    pub fn key(&self, address: &str, group: &str) -> String {
        format!("{}:{}:{}", self.prefix, address, group)
    }

    /// Lifetime of a record for a bucket with this window.
    pub fn ttl(state: &TokenBucketState) -> Duration {
        Duration::from_secs(state.window).saturating_add(TTL_SLACK)
    }

    /// Load the bucket for (`address`, `group`); `None` when absent or expired.
    ///
    /// A record that no longer decodes is reported as absent and will be
    /// overwritten by the next write.
    pub async fn get(
        &self,
        address: &str,
        group: &str,
    ) -> Result<Option<TokenBucketState>, StoreError> {
        let key = self.key(address, group);
        let raw = self.kv.get_raw(&key).await.map_err(|e| StoreError::backend("get", e))?;
        Ok(raw.and_then(|raw| decode(&key, &raw)))
    }

    /// Persist `state` for (`address`, `group`) unconditionally.
    pub async fn set(
        &self,
        address: &str,
        group: &str,
        state: &TokenBucketState,
    ) -> Result<(), StoreError> {
        let key = self.key(address, group);
        let value = serde_json::to_string(state)?;
        self.kv
            .set_with_ttl(&key, &value, Self::ttl(state))
            .await
            .map_err(|e| StoreError::backend("set", e))
    }

    /// Read-modify-write the bucket for (`address`, `group`).
    ///
    /// `f` receives the current state (`None` if absent) and returns the new
    /// one; it may run more than once when other writers race us. `None` from
    /// `f` leaves the record untouched. Returns the state `f` produced last.
    pub async fn update<F>(
        &self,
        address: &str,
        group: &str,
        mut f: F,
    ) -> Result<Option<TokenBucketState>, StoreError>
    where
        F: FnMut(Option<TokenBucketState>) -> Option<TokenBucketState> + Send,
    {
        let key = self.key(address, group);
        let mut last = None;

        // Optimistic locking loop
        for _ in 0..CAS_ATTEMPTS {
            let raw = self.kv.get_raw(&key).await.map_err(|e| StoreError::backend("get", e))?;
            let current = raw.as_deref().and_then(|raw| decode(&key, raw));
            let Some(next) = f(current) else {
                return Ok(None);
            };
            let value = serde_json::to_string(&next)?;
            let swapped = self
                .kv
                .compare_and_swap(&key, raw.as_deref(), &value, Self::ttl(&next))
                .await
                .map_err(|e| StoreError::backend("compare_and_swap", e))?;
            if swapped {
                return Ok(Some(next));
            }
            last = Some((next, value));
        }

        // Still contended: last writer wins, as plain get/set would.
        let Some((next, value)) = last else {
            return Ok(None);
        };
        tracing::debug!(key = %key, attempts = CAS_ATTEMPTS, "bucket update contended; overwriting");
        self.kv
            .set_with_ttl(&key, &value, Self::ttl(&next))
            .await
            .map_err(|e| StoreError::backend("set", e))?;
        Ok(Some(next))
    }
}

fn decode(key: &str, raw: &str) -> Option<TokenBucketState> {
    match serde_json::from_str(raw) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "discarding undecodable bucket record");
            None
        }
    }
}
