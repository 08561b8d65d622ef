//! HTTP error types.
//!
//! Callers need to tell three outcomes apart: a transport failure worth
//! retrying later, an authoritative rejection, and a rate limit carrying the
//! server's back-off. Each is its own variant.

use thiserror::Error;

/// Errors that can occur during REST operations.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Request never completed (DNS, TCP, TLS, timeout). Retryable.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Rate limited; retry after the given number of seconds.
    #[error("rate limited, retry after {retry_after}s")]
    RateLimited {
        /// Seconds until the limit expires, as sent by the server.
        retry_after: f64,
    },

    /// The server answered with a non-success status. Not retryable.
    #[error("request rejected with status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// Response body failed to parse.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Settings blob or catalog payload failed to decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// Local file I/O failed (catalog persistence).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Proxy URL could not be understood.
    #[error("invalid proxy: {0}")]
    InvalidProxy(String),

    /// A header value was not representable.
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),
}

impl HttpError {
    /// Whether the failure is transient and the operation may simply be
    /// retried on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, HttpError::Transport(_) | HttpError::Io(_))
    }
}
