//! The rate-limited fetch client.
//!
//! Each call goes through four stages:
//!
//! 1. **Queue**: wait for this client's turn. Turns are handed out in FIFO
//!    order by a fair async mutex; a request keeps its turn while it waits
//!    out delays and 429s, so a long wait holds up everyone behind it.
//! 2. **Gate**: loop until the legacy error budget and the token bucket of
//!    the request's group both allow dispatch, sleeping in between.
//! 3. **Dispatch**: send through the [`Transport`]. A 429 is recorded and the
//!    same request retried after `retry-after`; the caller never sees it.
//! 4. **Charge**: adopt error-budget headers, charge the bucket, and hand the
//!    response back. The next turn starts no sooner than the configured
//!    dispatch spacing after this one ended.
//!
//! ```rust,no_run
//! use esi_throttle::{EsiClient, InMemoryStore, ReqwestTransport};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = ReqwestTransport::builder().user_agent("my-app/1.0").build()?;
//! let client = EsiClient::new(transport, InMemoryStore::new());
//! let status = client.get("/status/").await?;
//! println!("{}", status.text());
//! # Ok(())
//! # }
//! ```

use crate::address::{HttpAddressLookup, OutboundAddressResolver};
use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::cost::{token_cost, EXPECTED_COST};
use crate::error::FetchError;
use crate::error_budget::LegacyErrorBudget;
use crate::groups::classify;
use crate::headers;
use crate::limiter::{Gate, RateLimiter};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::stats::{ClientStats, StatsRecorder};
use crate::store::{KeyValueStore, SharedBucketStore};
use crate::transport::{ApiRequest, ApiResponse, FetchOptions, Transport};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

const TOO_MANY_REQUESTS: u16 = 429;

#[derive(Debug, Default)]
struct Turn {
    // When the previous request finished, clock millis.
    last_finished: Option<u64>,
}

struct FinishTurn<'a> {
    turn: MutexGuard<'a, Turn>,
    clock: &'a dyn Clock,
}

impl Drop for FinishTurn<'_> {
    fn drop(&mut self) {
        self.turn.last_finished = Some(self.clock.now_millis());
    }
}

#[derive(Debug)]
struct Inner<K, T> {
    transport: T,
    limiter: RateLimiter<K>,
    budget: LegacyErrorBudget,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    turn: Mutex<Turn>,
    stats: StatsRecorder,
}

/// Rate-limited client for the upstream API. Clones share one queue.
#[derive(Debug)]
pub struct EsiClient<K, T> {
    inner: Arc<Inner<K, T>>,
}

impl<K, T> Clone for EsiClient<K, T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K, T> EsiClient<K, T>
where
    K: KeyValueStore,
    T: Transport,
{
    /// Client with default configuration, wall clock and HTTP address detection.
    pub fn new(transport: T, kv: K) -> Self {
        Self::builder(transport, kv).build()
    }

    pub fn builder(transport: T, kv: K) -> EsiClientBuilder<K, T> {
        EsiClientBuilder {
            transport,
            kv,
            config: ClientConfig::default(),
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            address: None,
        }
    }

    /// `GET` `path`.
    pub async fn get(&self, path: &str) -> Result<ApiResponse, FetchError> {
        self.execute(ApiRequest::get(path)).await
    }

    /// Fetch `path` with `options`, waiting as long as the limits require.
    ///
    /// Returns every response except 429s, which are retried. Errors only
    /// when no response could be obtained, or when a configured 429 retry
    /// ceiling is exceeded. Dropping the future gives up the request.
    pub async fn fetch(
        &self,
        path: impl Into<String>,
        options: FetchOptions,
    ) -> Result<ApiResponse, FetchError> {
        self.execute(ApiRequest::new(path, options)).await
    }

    /// Like [`fetch`](Self::fetch) for a prepared request.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, FetchError> {
        let inner = &*self.inner;
        let group = classify(&request.path);

        let turn = {
            let _queued = inner.stats.enqueue();
            inner.turn.lock().await
        };
        inner.space_from(turn.last_finished).await;

        // Stamped on drop too, so an abandoned dispatch still spaces the next one.
        let _finish = FinishTurn { turn, clock: &*inner.clock };
        inner.dispatch(group, &request).await
    }

    /// Counters so far.
    pub fn stats(&self) -> ClientStats {
        self.inner.stats.snapshot()
    }

    pub fn limiter(&self) -> &RateLimiter<K> {
        &self.inner.limiter
    }

    pub fn error_budget(&self) -> &LegacyErrorBudget {
        &self.inner.budget
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl<K, T> Inner<K, T>
where
    K: KeyValueStore,
    T: Transport,
{
    async fn space_from(&self, last_finished: Option<u64>) {
        let Some(last) = last_finished else {
            return;
        };
        let spacing = self.config.dispatch_spacing();
        let since = Duration::from_millis(self.clock.now_millis().saturating_sub(last));
        if since < spacing {
            self.sleeper.sleep(spacing - since).await;
        }
    }

    async fn gate(&self, group: &'static str) {
        let mut paced = false;
        loop {
            if !self.budget.can_make_request() {
                self.stats.budget_wait();
                self.sleeper.sleep(self.budget.reset_wait()).await;
                continue;
            }
            match self.limiter.assess(group, EXPECTED_COST).await {
                Gate::Ready => return,
                // At most one pacing delay per dispatch.
                Gate::Pace(_) if paced => return,
                Gate::Pace(delay) => {
                    paced = true;
                    self.stats.pacing_delay();
                    self.sleeper.sleep(delay).await;
                }
                Gate::Blocked { wait, reason } => {
                    self.stats.hard_block();
                    tracing::debug!(group, wait_ms = wait.as_millis() as u64, ?reason, "request blocked");
                    self.sleeper.sleep(wait).await;
                }
            }
        }
    }

    async fn dispatch(
        &self,
        group: &'static str,
        request: &ApiRequest,
    ) -> Result<ApiResponse, FetchError> {
        let mut rate_limited = 0u32;
        loop {
            self.gate(group).await;

            self.stats.dispatched();
            tracing::debug!(group, path = %request.path, method = %request.options.method, "dispatching");
            let response = match self.transport.send(request).await {
                Ok(response) => response,
                Err(e) => {
                    self.stats.transport_error();
                    tracing::warn!(group, path = %request.path, error = %e, "request failed");
                    return Err(e.into());
                }
            };
            self.check_group(group, &response);

            if response.status() == TOO_MANY_REQUESTS {
                self.stats.rate_limited();
                self.budget.record_error();
                let wait = headers::retry_after(response.headers())
                    .unwrap_or(self.config.default_retry_after());
                self.limiter.handle_rate_limit(group, wait).await;

                rate_limited += 1;
                if let Some(max) = self.config.max_rate_limit_retries() {
                    if rate_limited > max {
                        return Err(FetchError::RateLimitRetriesExhausted {
                            group,
                            attempts: rate_limited,
                        });
                    }
                }
                self.sleeper.sleep(wait).await;
                continue;
            }

            let (remain, reset) = headers::error_limit(response.headers());
            self.budget.update_from_headers(remain, reset);
            self.limiter
                .consume_tokens(group, token_cost(response.status()), Some(response.headers()))
                .await;
            return Ok(response);
        }
    }

    fn check_group(&self, group: &str, response: &ApiResponse) {
        if let Some(reported) = headers::reported_group(response.headers()) {
            if reported != group {
                self.stats.group_mismatch();
                tracing::warn!(
                    classified = group,
                    reported,
                    status = response.status(),
                    "upstream reports a different rate limit group"
                );
            }
        }
    }
}

impl<K, T> tower_service::Service<ApiRequest> for EsiClient<K, T>
where
    K: KeyValueStore + 'static,
    T: Transport + 'static,
{
    type Response = ApiResponse;
    type Error = FetchError;
    type Future = Pin<Box<dyn Future<Output = Result<ApiResponse, FetchError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Callers queue inside `call`.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ApiRequest) -> Self::Future {
        let client = self.clone();
        Box::pin(async move { client.execute(request).await })
    }
}

/// Builder for [`EsiClient`].
pub struct EsiClientBuilder<K, T> {
    transport: T,
    kv: K,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    address: Option<Arc<OutboundAddressResolver>>,
}

impl<K, T> EsiClientBuilder<K, T>
where
    K: KeyValueStore,
    T: Transport,
{
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override the sleeper (useful for deterministic tests).
    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Share an address resolver, or pin the address with
    /// [`OutboundAddressResolver::fixed`].
    pub fn address_resolver(mut self, resolver: impl Into<Arc<OutboundAddressResolver>>) -> Self {
        self.address = Some(resolver.into());
        self
    }

    pub fn build(self) -> EsiClient<K, T> {
        let config = self.config;
        let address = self.address.unwrap_or_else(|| {
            Arc::new(
                OutboundAddressResolver::new(HttpAddressLookup::new())
                    .with_timeout(config.address_lookup_timeout()),
            )
        });
        let store = SharedBucketStore::with_prefix(self.kv, config.key_prefix());
        let limiter = RateLimiter::new(store, address)
            .with_clock_arc(Arc::clone(&self.clock))
            .with_failure_policy(config.store_failure_policy());
        let budget =
            LegacyErrorBudget::with_clock_arc(config.error_budget().clone(), Arc::clone(&self.clock));

        let inner = Inner {
            transport: self.transport,
            limiter,
            budget,
            config,
            clock: self.clock,
            sleeper: self.sleeper,
            turn: Mutex::new(Turn::default()),
            stats: StatsRecorder::default(),
        };
        EsiClient { inner: Arc::new(inner) }
    }
}
