use esi_throttle::address::UNKNOWN_ADDRESS;
use esi_throttle::{
    AddressLookup, AddressLookupError, ApiRequest, FetchOptions, HttpAddressLookup,
    OutboundAddressResolver, ReqwestTransport, Transport,
};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use std::net::Ipv4Addr;
use std::time::Duration;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn transport(server: &MockServer) -> ReqwestTransport {
    let mut defaults = HeaderMap::new();
    defaults.insert("x-compat-date", HeaderValue::from_static("2025-08-26"));
    ReqwestTransport::builder()
        .base_url(format!("{}/latest", server.uri()))
        .user_agent("esi-throttle-tests/0.1")
        .default_headers(defaults)
        .build()
        .unwrap()
}

#[tokio::test]
async fn reqwest_transport_returns_status_headers_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/latest/status/"))
        .and(header("user-agent", "esi-throttle-tests/0.1"))
        .and(header("x-compat-date", "2025-08-26"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Ratelimit-Remaining", "148")
                .set_body_string(r#"{"players":23456}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let response = transport(&server).send(&ApiRequest::get("/status/")).await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.header("x-ratelimit-remaining"), Some("148"));
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["players"], 23456);
}

#[tokio::test]
async fn reqwest_transport_sends_method_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/latest/universe/names/"))
        .and(body_string("[34,35]"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let options = FetchOptions::new().method(Method::POST).body("[34,35]");
    let response = transport(&server)
        .send(&ApiRequest::new("universe/names/", options))
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn reqwest_transport_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;
    let transport = ReqwestTransport::builder()
        .base_url(server.uri())
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap();

    let err = transport.send(&ApiRequest::get("/status/")).await.unwrap_err();

    assert!(err.is_timeout(), "{err:?}");
}

#[tokio::test]
async fn http_lookup_parses_the_echoed_address() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("203.0.113.44\n"))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = OutboundAddressResolver::new(HttpAddressLookup::with_url(server.uri()));

    assert_eq!(resolver.resolve().await, "203.0.113.44");
    assert_eq!(resolver.resolve().await, "203.0.113.44");
}

#[tokio::test]
async fn http_lookup_rejects_non_ipv4_answers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("2001:db8::7"))
        .mount(&server)
        .await;

    let lookup = HttpAddressLookup::with_url(server.uri());
    assert!(matches!(lookup.lookup().await, Err(AddressLookupError::Malformed(_))));

    let resolver = OutboundAddressResolver::new(lookup);
    assert_eq!(resolver.resolve().await, UNKNOWN_ADDRESS);
}

#[tokio::test]
async fn http_lookup_reports_error_statuses() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

    let result = HttpAddressLookup::with_url(server.uri()).lookup().await;

    assert!(matches!(result, Err(AddressLookupError::Status(503))));
}

#[tokio::test]
async fn slow_lookup_falls_back_to_unknown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(Ipv4Addr::new(198, 51, 100, 1).to_string())
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let resolver = OutboundAddressResolver::new(HttpAddressLookup::with_url(server.uri()))
        .with_timeout(Duration::from_millis(100));

    assert_eq!(resolver.resolve().await, UNKNOWN_ADDRESS);
}
