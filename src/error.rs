//! Errors returned to callers of the client.
//!
//! Everything except a 429 reaches the caller: upstream 4xx/5xx responses are
//! returned as ordinary [`ApiResponse`](crate::transport::ApiResponse)s, and
//! only the absence of a response, or an opted-in retry ceiling, is an error.
use crate::transport::TransportError;
use std::fmt;

/// Failure of [`EsiClient::fetch`](crate::client::EsiClient::fetch).
#[derive(Debug)]
pub enum FetchError {
    /// No response was obtained; no tokens were charged.
    Transport(TransportError),
    /// The upstream kept answering 429 past the configured retry ceiling.
    RateLimitRetriesExhausted { group: &'static str, attempts: u32 },
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{}", e),
            Self::RateLimitRetriesExhausted { group, attempts } => {
                write!(f, "rate limited {} times in group `{}`; giving up", attempts, group)
            }
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::RateLimitRetriesExhausted { .. } => None,
        }
    }
}

impl From<TransportError> for FetchError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl FetchError {
    /// Check if no response was obtained
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Check if the 429 retry ceiling was hit
    pub fn is_rate_limit_exhausted(&self) -> bool {
        matches!(self, Self::RateLimitRetriesExhausted { .. })
    }

    /// Borrow the transport error if present.
    pub fn as_transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }

    /// Get the transport error if this is a Transport variant
    pub fn into_transport(self) -> Option<TransportError> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }

    /// Rate-limit group of an exhausted request.
    pub fn group(&self) -> Option<&'static str> {
        match self {
            Self::RateLimitRetriesExhausted { group, .. } => Some(group),
            _ => None,
        }
    }
}
