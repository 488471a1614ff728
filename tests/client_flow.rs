mod common;

use async_trait::async_trait;
use common::{harness, harness_with, ADDRESS};
use esi_throttle::{
    ApiRequest, ClientConfig, EsiClient, InMemoryStore, KeyValueStore, ManualClock,
    OutboundAddressResolver, StoreFailurePolicy, TrackingSleeper,
};
use futures::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

#[tokio::test]
async fn ten_killmail_fetches_cost_twenty_tokens_without_pacing() {
    let h = harness();

    for id in 0..10 {
        let response = h.client.get(&format!("/killmails/{id}/0123abcd/")).await.unwrap();
        assert_eq!(response.status(), 200);
    }

    let state = h.client.limiter().state("killmail").await.unwrap().unwrap();
    assert_eq!(state.tokens_remaining, 3600 - 20);
    assert!(state.usage_percent() < 50.0);
    // Only the fixed spacing between dispatches, never a pacing delay.
    assert_eq!(h.sleeper.calls(), vec![Duration::from_millis(100); 9]);
    assert_eq!(h.client.stats().pacing_delays, 0);
}

#[tokio::test]
async fn rate_limited_request_is_retried_not_failed() {
    let h = harness();
    h.transport.respond(429, &[("retry-after", "5")]);
    h.transport.respond(200, &[]);

    let response = h.client.get("/killmails/1/abc/").await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(h.transport.requests().len(), 2);
    assert_eq!(h.sleeper.calls(), vec![Duration::from_secs(5)]);
}

#[tokio::test]
async fn error_budget_block_with_zero_reset_sleeps_once() {
    let h = harness();
    let budget = h.client.error_budget();
    budget.update_from_headers(Some(90), Some(0));
    for _ in 0..11 {
        budget.record_error();
    }

    let response = h.client.get("/status/").await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(h.sleeper.calls(), vec![Duration::from_secs(60)]);
    assert_eq!(h.client.stats().budget_waits, 1);
}

#[tokio::test]
async fn rate_limit_blocks_the_next_request_of_the_group() {
    let h = harness();
    h.client.limiter().handle_rate_limit("killmail", Duration::from_secs(5)).await;
    h.clock.advance(50);

    let delay = h.client.limiter().calculate_delay("killmail", 2).await.as_millis();

    assert!((4_900..=5_000).contains(&delay), "{delay}");
}

#[tokio::test]
async fn queue_is_fifo_and_head_of_line_blocking() {
    let h = harness();
    h.transport.respond(429, &[("retry-after", "3")]);

    let first = h.client.get("/characters/1/wallet/");
    let second = h.client.get("/markets/prices/");
    let (a, b) = tokio::join!(first, second);

    assert_eq!(a.unwrap().status(), 200);
    assert_eq!(b.unwrap().status(), 200);
    // The market request waited behind the wallet request's retry.
    assert_eq!(
        h.transport.requests(),
        vec!["/characters/1/wallet/", "/characters/1/wallet/", "/markets/prices/"]
    );
    assert_eq!(h.client.stats().queued, 0);
}

#[tokio::test]
async fn reported_tokens_override_local_cost() {
    let h = harness();
    h.transport.respond(200, &[("X-Ratelimit-Remaining", "100"), ("X-Ratelimit-Used", "2")]);

    h.client.get("/characters/7/assets/").await.unwrap();

    let state = h.client.limiter().state("char-asset").await.unwrap().unwrap();
    assert_eq!(state.tokens_remaining, 100);
    assert_eq!(state.tokens_used, 1700);
}

#[tokio::test]
async fn bucket_is_shared_with_other_processes() {
    let h = harness();
    h.client.get("/universe/types/34/").await.unwrap();

    // A second client on the same store and address sees the same bucket.
    let other = EsiClient::builder(common::ScriptedTransport::new(), h.store.clone())
        .clock(h.clock.clone())
        .sleeper(TrackingSleeper::with_clock(h.clock.clone()))
        .address_resolver(OutboundAddressResolver::fixed(ADDRESS))
        .build();
    other.get("/universe/types/35/").await.unwrap();

    let state = h.client.limiter().state("universe").await.unwrap().unwrap();
    assert_eq!(state.tokens_used, 4);
    let raw = h.store.get_raw(&format!("esi-rate-limit:{ADDRESS}:universe")).await.unwrap();
    assert!(raw.unwrap().contains("\"tokensUsed\":4"));
}

#[tokio::test]
async fn custom_key_prefix_is_used() {
    let config = ClientConfig::builder().key_prefix("prod:esi").build().unwrap();
    let h = harness_with(config);

    h.client.get("/status/").await.unwrap();

    let raw = h.store.get_raw(&format!("prod:esi:{ADDRESS}:status")).await.unwrap();
    assert!(raw.is_some());
}

#[tokio::test]
async fn exhausted_bucket_waits_for_window_end() {
    let h = harness();
    let limiter = h.client.limiter();
    let mut state = esi_throttle::TokenBucketState::fresh(
        esi_throttle::group_config("char-notification"),
        common::START - 300_000,
    );
    state.consume(15);
    limiter.store().set(ADDRESS, "char-notification", &state).await.unwrap();

    h.client.get("/characters/3/notifications/").await.unwrap();

    assert_eq!(h.sleeper.calls(), vec![Duration::from_millis(600_000)]);
    assert_eq!(h.client.stats().hard_blocks, 1);
}

#[tokio::test]
async fn works_as_a_tower_service() {
    let h = harness();
    h.transport.respond(200, &[("x-esi-error-limit-remain", "99")]);

    let response =
        h.client.clone().oneshot(ApiRequest::get("/alliances/99000001/")).await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(h.client.error_budget().remaining(), 99);
}

#[tokio::test]
async fn dropped_request_leaves_the_queue() {
    let h = harness();
    h.transport.respond(429, &[("retry-after", "1")]);

    let blocker = h.client.get("/status/");
    tokio::pin!(blocker);
    // Run the first request until it parks in its retry-after sleep.
    assert!(futures::poll!(&mut blocker).is_pending());
    assert_eq!(h.client.stats().queued, 0);

    // A second request queues behind it and is abandoned.
    assert!(h.client.get("/universe/races/").now_or_never().is_none());
    assert_eq!(h.client.stats().queued, 0);

    assert_eq!(blocker.await.unwrap().status(), 200);
    assert!(!h.transport.requests().iter().any(|p| p == "/universe/races/"));
}

#[derive(Debug, thiserror::Error)]
#[error("store offline")]
struct Offline;

/// Store that fails its first `failures` reads.
#[derive(Debug)]
struct Flaky {
    inner: InMemoryStore,
    failures: AtomicUsize,
}

#[async_trait]
impl KeyValueStore for Flaky {
    type Error = Offline;

    async fn get_raw(&self, key: &str) -> Result<Option<String>, Offline> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Offline);
        }
        self.inner.get_raw(key).await.map_err(|never| match never {})
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Offline> {
        self.inner.set_with_ttl(key, value, ttl).await.map_err(|never| match never {})
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, Offline> {
        self.inner.compare_and_swap(key, expected, value, ttl).await.map_err(|never| match never {})
    }
}

fn flaky_client(
    failures: usize,
    policy: StoreFailurePolicy,
) -> (EsiClient<Flaky, Arc<common::ScriptedTransport>>, TrackingSleeper) {
    let clock = ManualClock::new(common::START);
    let sleeper = TrackingSleeper::with_clock(clock.clone());
    let store = Flaky {
        inner: InMemoryStore::new().with_clock(clock.clone()),
        failures: AtomicUsize::new(failures),
    };
    let config = ClientConfig::builder().store_failure_policy(policy).build().unwrap();
    let client = EsiClient::builder(common::ScriptedTransport::new(), store)
        .config(config)
        .clock(clock)
        .sleeper(sleeper.clone())
        .address_resolver(OutboundAddressResolver::fixed(ADDRESS))
        .build();
    (client, sleeper)
}

#[tokio::test]
async fn unavailable_store_fails_open() {
    let (client, sleeper) = flaky_client(1, StoreFailurePolicy::FailOpen);

    assert_eq!(client.get("/status/").await.unwrap().status(), 200);
    assert!(sleeper.calls().is_empty());
}

#[tokio::test]
async fn fail_closed_store_policy_blocks_then_recovers() {
    let (client, sleeper) =
        flaky_client(1, StoreFailurePolicy::FailClosed(Duration::from_secs(2)));

    assert_eq!(client.get("/status/").await.unwrap().status(), 200);
    assert_eq!(sleeper.calls(), vec![Duration::from_secs(2)]);
    assert_eq!(client.stats().hard_blocks, 1);
    let state = client.limiter().state("status").await.unwrap().unwrap();
    assert_eq!(state.tokens_used, 2);
}

#[tokio::test]
async fn address_resolver_can_be_shared_between_clients() {
    let resolver = Arc::new(OutboundAddressResolver::fixed("198.51.100.9"));
    let build = |resolver: Arc<OutboundAddressResolver>| {
        EsiClient::builder(common::ScriptedTransport::new(), InMemoryStore::new())
            .address_resolver(resolver)
            .build()
    };
    let a = build(Arc::clone(&resolver));
    let b = build(resolver);

    assert_eq!(a.limiter().address().await, "198.51.100.9");
    assert_eq!(b.limiter().address().await, "198.51.100.9");
}
