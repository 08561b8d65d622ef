//! Per-client dialogue.
//!
//! After the handshake the server resolves the application's metadata and
//! asset list, answers with the READY dispatch, then loops on commands.
//! `SET_ACTIVITY` is acted upon; anything else is echoed back so naive
//! clients keep running with rich presence only.

use crate::framing::{Frame, IpcCodec, OP_FRAME};
use crate::normalize::normalize_activity;
use crate::AppDirectory;
use beacon_model::{Activity, ActivityTable};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Minimum gap between published updates from one client.
const PUBLISH_GAP: Duration = Duration::from_secs(5);

/// Minimum gap when the payload repeats the previous one.
const PUBLISH_GAP_SAME: Duration = Duration::from_secs(60);

/// State shared between the accept loop and every dialogue.
pub(crate) struct SharedState {
    pub activities: Arc<ActivityTable>,
    /// READY dispatch envelope, rebuilt when the account identity changes.
    pub dispatch: RwLock<Value>,
    pub external_assets: bool,
}

/// Drive one client connection to completion.
pub(crate) async fn run_client<S, D>(io: S, directory: Arc<D>, state: Arc<SharedState>)
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: AppDirectory + ?Sized,
{
    let mut framed = Framed::new(io, IpcCodec);

    let Some(Ok(handshake)) = framed.next().await else {
        return;
    };
    // The official client probes the endpoint with a bare string; close.
    if handshake.payload.is_string() {
        debug!("ignoring string handshake probe");
        return;
    }
    let Some(app_id) = handshake
        .payload
        .get("client_id")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        warn!("handshake without client_id");
        return;
    };
    debug!(app_id = %app_id, "rich-presence handshake");

    let app = match directory.rpc_app(&app_id).await {
        Ok(app) => app,
        Err(e) => {
            warn!(app_id = %app_id, error = %e, "failed to fetch application data");
            return;
        }
    };
    let declared_assets = match directory.rpc_assets(&app_id).await {
        Ok(assets) => assets,
        Err(e) => {
            warn!(app_id = %app_id, error = %e, "failed to fetch application assets");
            return;
        }
    };
    info!(app = %app.name, "rich-presence client connected");

    let ready = Frame {
        op: OP_FRAME,
        payload: state.dispatch.read().clone(),
    };
    if framed.send(ready).await.is_err() {
        return;
    }

    let mut prev_activity: Option<Value> = None;
    let mut last_sent: Option<Instant> = None;

    while let Some(Ok(frame)) = framed.next().await {
        let command = frame
            .payload
            .get("cmd")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let nonce = frame.payload.get("nonce").cloned().unwrap_or(Value::Null);

        if command == "SET_ACTIVITY" {
            let raw_activity = frame.payload["args"]["activity"].clone();

            // Identical payloads may repeat once a minute, fresh ones every
            // five seconds. Inside the window: echo, remember, drop.
            let gap = if prev_activity.as_ref() == Some(&raw_activity) {
                PUBLISH_GAP_SAME
            } else {
                PUBLISH_GAP
            };
            if last_sent.is_some_and(|at| at.elapsed() < gap) {
                let echo = Frame {
                    op: frame.op,
                    payload: json!({
                        "cmd": command, "data": raw_activity, "evt": null, "nonce": nonce,
                    }),
                };
                let _ = framed.send(echo).await;
                prev_activity = Some(frame.payload["args"]["activity"].clone());
                last_sent = Some(Instant::now());
                continue;
            }

            if !raw_activity.is_object() {
                continue;
            }
            let Ok(mut activity) = serde_json::from_value::<Activity>(raw_activity.clone()) else {
                continue;
            };
            normalize_activity(
                &mut activity,
                &app_id,
                &app.name,
                &declared_assets,
                directory.as_ref(),
                state.external_assets,
            )
            .await;
            state.activities.publish(&app_id, activity.clone());
            prev_activity = Some(raw_activity);
            last_sent = Some(Instant::now());

            let data = serde_json::to_value(&activity).unwrap_or(Value::Null);
            let response = Frame {
                op: frame.op,
                payload: json!({"cmd": command, "data": data, "evt": null, "nonce": nonce}),
            };
            if framed.send(response).await.is_err() {
                break;
            }
        } else {
            // Unimplemented command; echo a minimal shape.
            let evt = frame.payload.get("evt").cloned().unwrap_or(Value::Null);
            let response = Frame {
                op: frame.op,
                payload: json!({"cmd": command, "data": {"evt": evt}, "evt": null, "nonce": nonce}),
            };
            if framed.send(response).await.is_err() {
                break;
            }
        }
    }

    state.activities.remove(&app_id);
    info!(app = %app.name, "rich-presence client disconnected");
}
