#![allow(dead_code)]

use async_trait::async_trait;
use esi_throttle::{
    ApiRequest, ApiResponse, ClientConfig, EsiClient, InMemoryStore, ManualClock,
    OutboundAddressResolver, Transport, TransportError, TrackingSleeper,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const ADDRESS: &str = "192.0.2.10";
pub const START: u64 = 1_700_000_000_000;

/// Transport that replays queued responses and then answers 200.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<ApiResponse, TransportError>>>,
    requests: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, status: u16, headers: &[(&str, &str)]) {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        self.responses.lock().unwrap().push_back(Ok(ApiResponse::new(status, map, "{}")));
    }

    pub fn fail(&self, error: TransportError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.requests.lock().unwrap().push(request.path.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ApiResponse::new(200, HeaderMap::new(), "{}")))
    }
}

pub type TestClient = EsiClient<InMemoryStore, Arc<ScriptedTransport>>;

pub struct Harness {
    pub client: TestClient,
    pub transport: Arc<ScriptedTransport>,
    pub store: InMemoryStore,
    pub sleeper: TrackingSleeper,
    pub clock: ManualClock,
}

pub fn harness() -> Harness {
    harness_with(ClientConfig::default())
}

/// Client on a manual clock whose sleeps advance that clock.
pub fn harness_with(config: ClientConfig) -> Harness {
    let clock = ManualClock::new(START);
    let sleeper = TrackingSleeper::with_clock(clock.clone());
    let store = InMemoryStore::new().with_clock(clock.clone());
    let transport = ScriptedTransport::new();
    let client = EsiClient::builder(transport.clone(), store.clone())
        .config(config)
        .clock(clock.clone())
        .sleeper(sleeper.clone())
        .address_resolver(OutboundAddressResolver::fixed(ADDRESS))
        .build();
    Harness { client, transport, store, sleeper, clock }
}
