//! Convenient re-exports for common esi-throttle types.
pub use crate::{
    address::OutboundAddressResolver,
    client::EsiClient,
    config::{ClientConfig, StoreFailurePolicy},
    error::FetchError,
    store::{InMemoryStore, KeyValueStore},
    transport::{ApiRequest, ApiResponse, FetchOptions, ReqwestTransport, Transport},
};
