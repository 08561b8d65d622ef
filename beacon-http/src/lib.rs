//! Beacon REST surface.
//!
//! Single-shot HTTPS requests against the platform's REST API, optional
//! HTTP-CONNECT/SOCKS5 proxying shared with the gateway's WebSocket dialer,
//! and the on-disk detectable-applications catalog.

mod catalog;
mod client;
pub mod error;
mod proxy;

pub use catalog::{
    os_eligible, CatalogFetch, CatalogFile, CatalogHit, CatalogStore, OS_LINUX, OS_MACOS,
    OS_WINDOWS,
};
pub use client::{ExternalAsset, RestClient, RpcApp, RpcAsset, SettingsSlot};
pub use error::HttpError;
pub use proxy::{dial, ProxyConfig, ProxyScheme};
