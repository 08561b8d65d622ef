//! Endpoint listener.
//!
//! Binds the platform's well-known rich-presence endpoint and spawns one
//! dialogue task per connection. On POSIX this is a Unix socket in the
//! runtime directory; on Windows a duplex message-mode named pipe.

use crate::session::{run_client, SharedState};
use crate::RpcError;
use beacon_http::RestClient;
use beacon_model::{Activity, ActivityTable, OwnUser};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// Endpoint name shared with the official client.
const ENDPOINT_NAME: &str = "discord-ipc-0";

/// Rich-presence server handle.
pub struct RpcServer {
    state: Arc<SharedState>,
    rest: Arc<RestClient>,
}

impl RpcServer {
    pub fn new(rest: Arc<RestClient>, user: &OwnUser, external_assets: bool) -> Self {
        Self {
            state: Arc::new(SharedState {
                activities: Arc::new(ActivityTable::new()),
                dispatch: RwLock::new(build_dispatch(user)),
                external_assets,
            }),
            rest,
        }
    }

    /// The table connected applications publish into.
    pub fn activities(&self) -> Arc<ActivityTable> {
        Arc::clone(&self.state.activities)
    }

    /// Changed-only snapshot of the published activities.
    pub fn take_activities(&self, force: bool) -> Option<Vec<Activity>> {
        self.state.activities.take(force)
    }

    /// Rebuild the READY dispatch after a USER_UPDATE.
    pub fn update_user(&self, user: &OwnUser) {
        *self.state.dispatch.write() = build_dispatch(user);
    }

    /// Accept connections forever.
    #[cfg(unix)]
    pub async fn run(&self) -> Result<(), RpcError> {
        use tokio::net::UnixListener;

        let path = socket_path()?;
        // A stale node from a previous run blocks the bind.
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "rich-presence server listening");

        loop {
            let (stream, _addr) = listener.accept().await?;
            let directory = Arc::clone(&self.rest);
            let state = Arc::clone(&self.state);
            tokio::spawn(run_client(stream, directory, state));
        }
    }

    /// Accept connections forever.
    #[cfg(windows)]
    pub async fn run(&self) -> Result<(), RpcError> {
        use tokio::net::windows::named_pipe::{PipeMode, ServerOptions};

        let pipe_name = format!(r"\\.\pipe\{ENDPOINT_NAME}");
        let mut instance = ServerOptions::new()
            .pipe_mode(PipeMode::Message)
            .in_buffer_size(64 * 1024)
            .out_buffer_size(64 * 1024)
            .first_pipe_instance(true)
            .create(&pipe_name)?;
        info!(pipe = %pipe_name, "rich-presence server listening");

        loop {
            instance.connect().await?;
            let connected = instance;
            instance = ServerOptions::new()
                .pipe_mode(PipeMode::Message)
                .in_buffer_size(64 * 1024)
                .out_buffer_size(64 * 1024)
                .create(&pipe_name)?;
            let directory = Arc::clone(&self.rest);
            let state = Arc::clone(&self.state);
            tokio::spawn(run_client(connected, directory, state));
        }
    }
}

/// READY dispatch envelope for the canonical user shape.
fn build_dispatch(user: &OwnUser) -> Value {
    json!({
        "cmd": "DISPATCH",
        "data": {
            "v": 1,
            "config": {
                "cdn_host": "cdn.discordapp.com",
                "api_endpoint": "//discord.com/api",
                "environment": "production",
            },
            "user": {
                "id": user.id,
                "username": user.username,
                "discriminator": user.discriminator,
                "global_name": user.global_name,
                "avatar": user.avatar,
                "avatar_decoration_data": user.avatar_decoration_data,
                "bot": false,
                "flags": 32,
                "premium_type": user.premium_type,
            },
        },
        "evt": "READY",
        "nonce": null,
    })
}

/// Endpoint path: `$XDG_RUNTIME_DIR/discord-ipc-0`, falling back to
/// `/run/user/<uid>`.
#[cfg(unix)]
fn socket_path() -> Result<std::path::PathBuf, RpcError> {
    use std::os::unix::fs::MetadataExt;
    use std::path::PathBuf;

    if let Some(base) = directories::BaseDirs::new() {
        if let Some(runtime) = base.runtime_dir() {
            return Ok(runtime.join(ENDPOINT_NAME));
        }
    }
    let uid = std::fs::metadata("/proc/self")
        .map(|meta| meta.uid())
        .map_err(|_| RpcError::NoEndpoint)?;
    let dir = PathBuf::from(format!("/run/user/{uid}"));
    if dir.is_dir() {
        Ok(dir.join(ENDPOINT_NAME))
    } else {
        Err(RpcError::NoEndpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> OwnUser {
        OwnUser {
            id: "42".to_string(),
            username: "someone".to_string(),
            discriminator: Some("0".to_string()),
            global_name: Some("Someone".to_string()),
            avatar: Some("abc".to_string()),
            premium_type: Some(2),
            ..OwnUser::default()
        }
    }

    #[test]
    fn test_dispatch_shape() {
        let dispatch = build_dispatch(&sample_user());
        assert_eq!(dispatch["cmd"], "DISPATCH");
        assert_eq!(dispatch["evt"], "READY");
        assert_eq!(dispatch["nonce"], Value::Null);
        assert_eq!(dispatch["data"]["v"], 1);
        assert_eq!(dispatch["data"]["config"]["cdn_host"], "cdn.discordapp.com");
        let user = &dispatch["data"]["user"];
        assert_eq!(user["id"], "42");
        assert_eq!(user["bot"], false);
        assert_eq!(user["flags"], 32);
        assert_eq!(user["premium_type"], 2);
    }

    #[test]
    fn test_update_user_rebuilds_dispatch() {
        let rest = Arc::new(RestClient::new("tok", None, None, None, None).unwrap());
        let server = RpcServer::new(rest, &sample_user(), true);
        let mut renamed = sample_user();
        renamed.username = "renamed".to_string();
        server.update_user(&renamed);
        assert_eq!(server.state.dispatch.read()["data"]["user"]["username"], "renamed");
    }
}
