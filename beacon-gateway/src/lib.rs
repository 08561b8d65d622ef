//! Beacon gateway session.
//!
//! A persistent WebSocket client for the platform's real-time gateway:
//! zlib-stream decompression, jittered heartbeating, sequence tracking,
//! resume-versus-reidentify reconnection, and a thread-safe surface the
//! orchestrator polls for presence publication and account-state changes.

mod compression;
pub mod error;
mod opcode;
mod payload;
mod session;
mod signal;

pub use compression::ZlibInflater;
pub use error::GatewayError;
pub use opcode::OpCode;
pub use payload::{HelloData, IdentifyData, ResumeData, DEFAULT_CAPABILITIES, DEFAULT_INTENTS};
pub use session::{Gateway, GatewayConfig, SessionState};
pub use signal::Latest;

/// Gateway protocol version spoken by this client.
pub const GATEWAY_VERSION: u8 = 9;
