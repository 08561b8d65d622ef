//! Beacon: a headless presence bridge.
//!
//! Maintains an authenticated gateway session, serves the local
//! rich-presence endpoint for third-party applications, detects running
//! games from the server-provided catalog, and continuously publishes the
//! composed activity set as the account's presence.

mod config;
mod orchestrator;
mod properties;

use beacon_gateway::{Gateway, GatewayConfig};
use beacon_http::{ProxyConfig, RestClient};
use config::Config;
use properties::ClientProperties;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config_dir = config::config_dir()?;
    let config = Config::load_or_init(&config_dir)?;
    if config.token.is_empty() {
        anyhow::bail!(
            "token not specified in config: {}",
            Config::path(&config_dir).display()
        );
    }
    info!(config = %Config::path(&config_dir).display(), "configuration loaded");

    let mut client_properties = match config.client_properties.to_lowercase().as_str() {
        "anonymous" => ClientProperties::anonymous(),
        _ => ClientProperties::default_mode(),
    };
    if let Some(user_agent) = config.custom_user_agent.as_deref() {
        client_properties = client_properties.with_user_agent(user_agent);
    }

    let proxy = match config.proxy.as_deref() {
        Some(raw) => match ProxyConfig::parse(raw) {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                warn!(error = %e, "invalid proxy, continuing without proxy");
                None
            }
        },
        None => None,
    };

    let rest = Arc::new(RestClient::new(
        &config.token,
        config.custom_host.as_deref(),
        Some(&client_properties.encoded()),
        Some(&client_properties.user_agent),
        proxy.as_ref(),
    )?);

    let gateway = Arc::new(Gateway::new(
        GatewayConfig {
            token: config.token.clone(),
            capabilities: None,
            properties: client_properties.gateway_value(),
            user_agent: client_properties.user_agent.clone(),
            launch_id: client_properties.launch_id(),
            heartbeat_session_id: client_properties.heartbeat_session_id(),
            proxy,
            legacy_host: config.legacy_host,
        },
        Arc::clone(&rest),
    ));

    info!("connecting to gateway");
    gateway.connect().await?;

    tokio::select! {
        result = orchestrator::run(Arc::clone(&gateway), rest, config, config_dir) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            gateway.disconnect(1000).await;
            Ok(())
        }
    }
}
