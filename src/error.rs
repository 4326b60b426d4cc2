//! Error taxonomy for logical calls.

use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::response::AccumulatedResult;

/// Failures raised by a transport before a response was received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Could not establish or keep the connection (DNS, refused, reset).
    #[error("connection failed: {0}")]
    Connect(String),
    /// The round trip exceeded the configured timeout.
    #[error("request timed out: {0}")]
    Timeout(String),
    /// The runtime backing the transport went away underneath the client.
    #[error("transport context torn down: {0}")]
    ContextTornDown(String),
    /// Anything else (invalid request, body errors).
    #[error("transport error: {0}")]
    Other(String),
}

/// Errors surfaced to the caller of a logical call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{source} (after {attempts} attempt(s))")]
    Transport {
        #[source]
        source: TransportError,
        attempts: u32,
    },

    /// Refresh failed, credentials cannot be refreshed, or a refreshed
    /// credential was rejected again.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited (HTTP 429) after {attempts} attempt(s)")]
    RateLimit {
        attempts: u32,
        retry_after: Option<Duration>,
    },

    /// Non-retryable 4xx.
    #[error("request rejected with HTTP {status}")]
    Client { status: StatusCode, body: String },

    #[error("server error HTTP {status} after {attempts} attempt(s)")]
    Server { status: StatusCode, attempts: u32 },

    /// Page metadata could not be interpreted. `partial` holds the pages
    /// accumulated before the malformed one.
    #[error("malformed pagination metadata: {message}")]
    Pagination {
        message: String,
        partial: Option<Box<AccumulatedResult>>,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    pub(crate) fn pagination(message: impl Into<String>) -> Self {
        ApiError::Pagination {
            message: message.into(),
            partial: None,
        }
    }

    /// HTTP status observed last, when the failure came from a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::RateLimit { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            ApiError::Client { status, .. } | ApiError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Results gathered before a pagination failure, if any.
    pub fn partial(&self) -> Option<&AccumulatedResult> {
        match self {
            ApiError::Pagination { partial, .. } => partial.as_deref(),
            _ => None,
        }
    }
}
