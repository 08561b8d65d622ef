//! Beacon rich-presence IPC server.
//!
//! Speaks the rich-presence wire protocol on the platform's well-known local
//! endpoint (a Unix socket on POSIX, a named pipe on Windows) so third-party
//! applications can publish activities. Each connected client gets its own
//! dialogue task; their activities fold into a process-wide table the
//! orchestrator merges into the account's presence.

mod directory;
pub mod error;
mod framing;
mod normalize;
mod server;
mod session;

pub use directory::AppDirectory;
pub use error::RpcError;
pub use framing::{Frame, IpcCodec, OP_FRAME, OP_HANDSHAKE};
pub use normalize::normalize_activity;
pub use server::RpcServer;
