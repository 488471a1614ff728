#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # esi-throttle
//!
//! Client-side rate limiting for the EVE Swagger Interface (ESI), shared
//! between every process calling it from one outbound address.
//!
//! ## Features
//!
//! - **Path classification** into the upstream's rate-limit groups
//! - **Floating-window token buckets** stored in a shared key-value store,
//!   keyed by outbound address and group
//! - **Adaptive backpressure**: random pacing delays that grow with usage
//! - **Transparent 429 handling** honoring `retry-after`
//! - **Legacy error budget** breaker driven by the `x-esi-error-limit-*` headers
//! - **FIFO dispatch** with fixed spacing per client
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use esi_throttle::{EsiClient, FetchOptions, InMemoryStore, ReqwestTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = ReqwestTransport::builder()
//!         .user_agent("my-app/1.0 (admin@example.com)")
//!         .build()?;
//!     // Use a shared store (e.g. `esi-throttle-redis`) across processes.
//!     let client = EsiClient::new(transport, InMemoryStore::new());
//!
//!     let response = client.fetch("/killmails/123/abcdef/", FetchOptions::new()).await?;
//!     println!("{} {}", response.status(), response.text());
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod bucket;
pub mod client;
pub mod clock;
pub mod config;
pub mod cost;
pub mod error;
pub mod error_budget;
pub mod groups;
pub mod headers;
pub mod limiter;
pub mod prelude;
pub mod sleeper;
pub mod stats;
pub mod store;
pub mod transport;

// Re-exports
pub use address::{AddressLookup, AddressLookupError, HttpAddressLookup, OutboundAddressResolver};
pub use bucket::TokenBucketState;
pub use client::{EsiClient, EsiClientBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClientConfig, ClientConfigBuilder, ConfigError, StoreFailurePolicy};
pub use cost::token_cost;
pub use error::FetchError;
pub use error_budget::{ErrorBudgetConfig, LegacyErrorBudget};
pub use groups::{classify, group_config, RateLimitGroupConfig};
pub use limiter::{BlockReason, Gate, RateLimiter};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use stats::ClientStats;
pub use store::{InMemoryStore, KeyValueStore, SharedBucketStore, StoreError};
pub use transport::{
    ApiRequest, ApiResponse, FetchOptions, ReqwestTransport, ReqwestTransportBuilder, Transport,
    TransportError,
};
