//! Error types for the relay and its provider seam.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failures raised by a completion provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The provider rejected the credential (HTTP 401).
    #[error("invalid API key")]
    InvalidApiKey,

    /// The provider throttled the request (HTTP 429).
    #[error("rate limit exceeded")]
    RateLimited,

    /// Any other non-success HTTP status.
    #[error("provider error: HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Network-level failure while talking to the provider.
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The provider reported an error inside an already-open stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// The provider sent something we could not understand.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ProviderError {
    /// Classifies a non-success HTTP status returned by a provider.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => Self::InvalidApiKey,
            429 => Self::RateLimited,
            _ => Self::Http { status, body },
        }
    }
}

/// Failures of one logical chat request.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The provider failed before a segment could be started.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The active segment failed before producing its result.
    #[error("segment source failed: {0}")]
    SourceTransport(String),

    /// Every allowed segment was truncated by the token budget.
    #[error("Cannot continue message: Maximum segments reached ({max})")]
    SegmentBoundExceeded { max: usize },

    /// A source was attached to an output stream after `close()`.
    #[error("output stream is already closed")]
    AlreadyClosed,

    /// The consumer went away before the response finished.
    #[error("consumer disconnected")]
    Cancelled,
}

impl RelayError {
    /// Turns a provider failure observed mid-stream into a transport error.
    pub fn source(err: &ProviderError) -> Self {
        Self::SourceTransport(err.to_string())
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Provider(ProviderError::InvalidApiKey) => {
                (StatusCode::UNAUTHORIZED, "INVALID_API_KEY")
            }
            Self::Provider(ProviderError::RateLimited) => {
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED")
            }
            Self::Provider(_) => (StatusCode::INTERNAL_SERVER_ERROR, "PROVIDER_ERROR"),
            Self::SourceTransport(_) => (StatusCode::INTERNAL_SERVER_ERROR, "SOURCE_ERROR"),
            Self::SegmentBoundExceeded { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "MAX_SEGMENTS_REACHED")
            }
            Self::AlreadyClosed | Self::Cancelled => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        }
    }
}

/// Error response body for HTTP endpoints.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code, "chat request failed");
        } else {
            tracing::warn!(error = %self, code, "chat request rejected by provider");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// A usage snapshot failed validation and was discarded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid usage header {header}: {reason}")]
pub struct UsageRejected {
    pub header: &'static str,
    pub reason: String,
}
