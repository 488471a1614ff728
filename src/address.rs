//! Outbound (egress) IPv4 address detection.
//!
//! The upstream meters per source address, so bucket keys carry the address
//! the upstream sees. Detection runs once per resolver; concurrent callers
//! wait on the same in-flight lookup. Any failure resolves to
//! [`UNKNOWN_ADDRESS`], which every such process then shares as one bucket.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Address used in bucket keys when detection fails.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Default IP echo service.
pub const DEFAULT_LOOKUP_URL: &str = "https://api.ipify.org";

const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Reasons detection can fail.
#[derive(thiserror::Error, Debug)]
pub enum AddressLookupError {
    #[error("address lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("address lookup request failed: {0}")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("address lookup answered with status {0}")]
    Status(u16),
    #[error("address lookup answered `{0}`, not an IPv4 address")]
    Malformed(String),
}

/// Something that can tell us our public IPv4 address.
#[async_trait]
pub trait AddressLookup: Send + Sync + std::fmt::Debug {
    async fn lookup(&self) -> Result<Ipv4Addr, AddressLookupError>;
}

#[async_trait]
impl<L: AddressLookup + ?Sized> AddressLookup for Arc<L> {
    async fn lookup(&self) -> Result<Ipv4Addr, AddressLookupError> {
        (**self).lookup().await
    }
}

/// Looks the address up with an IP echo service that answers with the
/// caller's address as plain text.
///
/// The HTTP client is bound to the IPv4 unspecified address, so the lookup
/// only ever leaves over IPv4.
#[derive(Debug, Clone)]
pub struct HttpAddressLookup {
    url: String,
}

impl Default for HttpAddressLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpAddressLookup {
    pub fn new() -> Self {
        Self::with_url(DEFAULT_LOOKUP_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AddressLookup for HttpAddressLookup {
    async fn lookup(&self) -> Result<Ipv4Addr, AddressLookupError> {
        // Built per lookup: a resolver looks up at most once.
        let client = reqwest::Client::builder()
            .local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .build()
            .map_err(|e| AddressLookupError::Request(Box::new(e)))?;
        let response = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| AddressLookupError::Request(Box::new(e)))?;
        if !response.status().is_success() {
            return Err(AddressLookupError::Status(response.status().as_u16()));
        }
        let body = response.text().await.map_err(|e| AddressLookupError::Request(Box::new(e)))?;
        parse_ipv4(&body)
    }
}

fn parse_ipv4(body: &str) -> Result<Ipv4Addr, AddressLookupError> {
    let trimmed = body.trim();
    trimmed.parse().map_err(|_| AddressLookupError::Malformed(trimmed.chars().take(64).collect()))
}

/// Memoizing front of an [`AddressLookup`].
#[derive(Debug)]
pub struct OutboundAddressResolver {
    cell: OnceCell<String>,
    lookup: Option<Arc<dyn AddressLookup>>,
    timeout: Duration,
}

impl Default for OutboundAddressResolver {
    fn default() -> Self {
        Self::new(HttpAddressLookup::new())
    }
}

impl OutboundAddressResolver {
    pub fn new<L: AddressLookup + 'static>(lookup: L) -> Self {
        Self { cell: OnceCell::new(), lookup: Some(Arc::new(lookup)), timeout: DEFAULT_LOOKUP_TIMEOUT }
    }

    /// A resolver that always answers `address` without any lookup.
    pub fn fixed(address: impl Into<String>) -> Self {
        Self { cell: OnceCell::from(address.into()), lookup: None, timeout: DEFAULT_LOOKUP_TIMEOUT }
    }

    /// Bound on a single lookup.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Outbound address, or [`UNKNOWN_ADDRESS`] when detection failed.
    pub async fn resolve(&self) -> &str {
        self.cell.get_or_init(|| self.detect()).await.as_str()
    }

    /// Address resolved so far, without triggering detection.
    pub fn resolved(&self) -> Option<&str> {
        self.cell.get().map(String::as_str)
    }

    async fn detect(&self) -> String {
        let Some(lookup) = &self.lookup else {
            return UNKNOWN_ADDRESS.to_string();
        };
        let outcome = match tokio::time::timeout(self.timeout, lookup.lookup()).await {
            Ok(result) => result,
            Err(_) => Err(AddressLookupError::Timeout(self.timeout)),
        };
        match outcome {
            Ok(address) => {
                tracing::info!(address = %address, "detected outbound address");
                address.to_string()
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    fallback = UNKNOWN_ADDRESS,
                    "outbound address detection failed; sharing the fallback bucket"
                );
                UNKNOWN_ADDRESS.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingLookup {
        calls: AtomicUsize,
        answer: Option<Ipv4Addr>,
    }

    #[async_trait]
    impl AddressLookup for CountingLookup {
        async fn lookup(&self) -> Result<Ipv4Addr, AddressLookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.answer.ok_or_else(|| AddressLookupError::Malformed("<html>".into()))
        }
    }

    #[derive(Debug)]
    struct HangingLookup;

    #[async_trait]
    impl AddressLookup for HangingLookup {
        async fn lookup(&self) -> Result<Ipv4Addr, AddressLookupError> {
            std::future::pending().await
        }
    }

    #[test]
    fn parses_only_dotted_quads() {
        assert_eq!(parse_ipv4(" 203.0.113.7\n").unwrap(), Ipv4Addr::new(203, 0, 113, 7));
        assert!(matches!(parse_ipv4("2001:db8::1"), Err(AddressLookupError::Malformed(_))));
        assert!(parse_ipv4("256.1.1.1").is_err());
        assert!(parse_ipv4("").is_err());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_lookup() {
        let lookup = Arc::new(CountingLookup {
            calls: AtomicUsize::new(0),
            answer: Some(Ipv4Addr::new(198, 51, 100, 4)),
        });
        let resolver = OutboundAddressResolver::new(lookup.clone());

        let (a, b, c) = tokio::join!(resolver.resolve(), resolver.resolve(), resolver.resolve());

        assert_eq!((a, b, c), ("198.51.100.4", "198.51.100.4", "198.51.100.4"));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_degrades_to_unknown_and_is_memoized() {
        let lookup = Arc::new(CountingLookup::default());
        let resolver = OutboundAddressResolver::new(lookup.clone());

        assert_eq!(resolver.resolve().await, UNKNOWN_ADDRESS);
        assert_eq!(resolver.resolve().await, UNKNOWN_ADDRESS);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_is_bounded_by_timeout() {
        let resolver =
            OutboundAddressResolver::new(HangingLookup).with_timeout(Duration::from_secs(5));
        assert_eq!(resolver.resolve().await, UNKNOWN_ADDRESS);
    }

    #[tokio::test]
    async fn fixed_skips_detection() {
        let resolver = OutboundAddressResolver::fixed("10.0.0.1");
        assert_eq!(resolver.resolved(), Some("10.0.0.1"));
        assert_eq!(resolver.resolve().await, "10.0.0.1");
    }
}
