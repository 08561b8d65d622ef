//! The orchestrator loop.
//!
//! Composes activities from the rich-presence server and the game-detection
//! service, derives status and custom status from the account settings, and
//! pushes the merged presence through the gateway. Also persists tokens the
//! server refreshes. Everything below it retries its own transient failures;
//! this loop only exits on a fatal gateway error or shutdown.

use crate::config::{self, Config};
use beacon_detect::GameDetection;
use beacon_gateway::{Gateway, SessionState};
use beacon_http::RestClient;
use beacon_model::{Activity, CustomStatusEmoji, Status};
use beacon_rpc::RpcServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Loop cadence.
const TICK: Duration = Duration::from_millis(100);

/// Wait for READY, wire up the activity producers, then run the main loop.
pub async fn run(
    gateway: Arc<Gateway>,
    rest: Arc<RestClient>,
    mut config: Config,
    config_dir: PathBuf,
) -> anyhow::Result<()> {
    while !gateway.is_ready() {
        if let Some(fatal) = gateway.fatal_error() {
            anyhow::bail!("gateway error: {fatal}");
        }
        if !gateway.is_running() {
            anyhow::bail!("gateway stopped before becoming ready");
        }
        sleep(Duration::from_millis(200)).await;
    }

    // Settings usually arrive inside READY; fall back to a REST fetch when
    // the blob lacked a status subtree.
    let mut settings = gateway.take_settings().unwrap_or_default();
    if !settings.has_status() {
        match rest.get_preloaded_settings().await {
            Ok(fetched) => settings = fetched,
            Err(e) => warn!(error = %e, "failed to fetch settings, assuming defaults"),
        }
    }
    let (mut status, mut custom_status, mut custom_emoji): (
        Status,
        Option<String>,
        Option<CustomStatusEmoji>,
    ) = settings.presence_parts();
    gateway
        .update_presence(
            status,
            custom_status.as_deref(),
            custom_emoji.as_ref(),
            Vec::new(),
            false,
        )
        .await;

    let user = gateway.take_user().unwrap_or_default();

    let rpc = if user.bot {
        warn!("rich-presence server cannot be started for bot accounts");
        None
    } else {
        let server = Arc::new(RpcServer::new(
            Arc::clone(&rest),
            &user,
            config.rpc_external_assets,
        ));
        let runner = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                warn!(error = %e, "rich-presence server stopped");
            }
        });
        Some(server)
    };

    let detection = if config.game_detection {
        let service = GameDetection::new(
            Arc::clone(&gateway),
            Arc::clone(&rest),
            config.games_blacklist.clone(),
            &config_dir,
            config.game_list_download_delay,
        );
        let runner = Arc::clone(&service);
        tokio::spawn(async move { runner.run().await });
        Some(service)
    } else {
        None
    };

    if let Some(token) = gateway.take_token_update() {
        persist_token(&mut config, &config_dir, token);
    }

    let mut my_activities: Vec<Activity> = Vec::new();
    loop {
        let connected = gateway.state() == SessionState::Connected;

        // Own-status snapshots only feed introspection; consume the register
        // so each change is observed once.
        let _ = gateway.take_status();

        if let Some(new_settings) = gateway.take_settings() {
            (status, custom_status, custom_emoji) = new_settings.presence_parts();
            gateway
                .update_presence(
                    status,
                    custom_status.as_deref(),
                    custom_emoji.as_ref(),
                    my_activities.clone(),
                    false,
                )
                .await;
        }

        if let Some(new_user) = gateway.take_user() {
            if let Some(rpc_server) = rpc.as_ref() {
                rpc_server.update_user(&new_user);
            }
        }

        // Fresh rich-presence activities: merge with a forced detection
        // snapshot, rich presence winning on application-id collisions.
        if let Some(rpc_server) = rpc.as_ref() {
            if let Some(rpc_activities) = rpc_server.take_activities(false) {
                if connected {
                    let detected = detection
                        .as_ref()
                        .and_then(|service| service.take_activities(true))
                        .unwrap_or_default();
                    my_activities = merge_activities(rpc_activities, detected);
                    gateway
                        .update_presence(
                            status,
                            custom_status.as_deref(),
                            custom_emoji.as_ref(),
                            my_activities.clone(),
                            // Keeps notifications flowing to other clients.
                            true,
                        )
                        .await;
                }
            }
        }

        // Symmetrically for fresh detection activities.
        if let Some(service) = detection.as_ref() {
            if let Some(detected) = service.take_activities(false) {
                if connected {
                    let rpc_activities = rpc
                        .as_ref()
                        .and_then(|server| server.take_activities(true))
                        .unwrap_or_default();
                    my_activities = merge_activities(rpc_activities, detected);
                    gateway
                        .update_presence(
                            status,
                            custom_status.as_deref(),
                            custom_emoji.as_ref(),
                            my_activities.clone(),
                            true,
                        )
                        .await;
                }
            }
        }

        if let Some(token) = gateway.take_token_update() {
            persist_token(&mut config, &config_dir, token);
        }

        if let Some(fatal) = gateway.fatal_error() {
            if let Some(service) = detection.as_ref() {
                service.stop();
            }
            anyhow::bail!("gateway error: {fatal}");
        }
        if !gateway.is_running() {
            if let Some(service) = detection.as_ref() {
                service.stop();
            }
            return Ok(());
        }

        sleep(TICK).await;
    }
}

/// Rich-presence activities first, then detection activities whose
/// application id is not already taken.
fn merge_activities(primary: Vec<Activity>, secondary: Vec<Activity>) -> Vec<Activity> {
    let mut merged = primary;
    let taken: Vec<Option<String>> = merged
        .iter()
        .map(|activity| activity.application_id.clone())
        .collect();
    for activity in secondary {
        if !taken.contains(&activity.application_id) {
            merged.push(activity);
        }
    }
    merged
}

fn persist_token(config: &mut Config, config_dir: &std::path::Path, token: String) {
    info!("persisting refreshed token");
    config.token = token;
    if let Err(e) = config.save(config_dir) {
        warn!(error = %e, path = %config::Config::path(config_dir).display(), "failed to persist refreshed token");
    }
}
