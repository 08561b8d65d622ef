//! IPC server error types.

use thiserror::Error;

/// Errors that can occur in the rich-presence server.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Socket or pipe I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame violated the wire format.
    #[error("framing error: {0}")]
    Frame(String),

    /// Frame payload was not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No usable endpoint location on this system.
    #[error("no runtime directory for the IPC endpoint")]
    NoEndpoint,
}
