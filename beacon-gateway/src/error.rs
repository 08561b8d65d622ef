//! Gateway error types.

use thiserror::Error;

/// Errors that can occur during gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// WebSocket connection or protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Failed to parse a gateway payload.
    #[error("JSON decode error: {0}")]
    JsonDecode(String),

    /// Connection was closed by the server.
    #[error("connection closed: code={code}, reason={reason}")]
    Closed {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },

    /// The token was rejected (close code 4004). Terminal.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// READY was not processed within the allowed window, which happens when
    /// the account is in far more guilds than this client is built for.
    #[error("READY event could not be processed in time")]
    ReadyTimeout,

    /// The gateway URL could not be fetched (usually no network).
    #[error("no internet connection")]
    NoInternet,

    /// REST call backing a gateway operation failed.
    #[error("REST error: {0}")]
    Http(#[from] beacon_http::HttpError),

    /// I/O error from the dialer or the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation requires a connection that does not exist.
    #[error("not connected")]
    NotConnected,
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::JsonDecode(err.to_string())
    }
}

/// Close codes with special handling. Everything else reconnects without
/// resuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Session can be resumed (codes 4000 and 4009).
    Resume,
    /// Token rejected; stop for good (code 4004).
    Fatal,
    /// Reconnect with a fresh identify.
    Reidentify,
}

impl CloseDisposition {
    pub fn from_code(code: u16) -> Self {
        match code {
            4000 | 4009 => CloseDisposition::Resume,
            4004 => CloseDisposition::Fatal,
            _ => CloseDisposition::Reidentify,
        }
    }
}
