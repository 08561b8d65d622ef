//! REST client.
//!
//! Every operation is a single short-lived request; the underlying pool is
//! reqwest's. Callers receive [`HttpError`] variants that distinguish
//! transient transport failures from authoritative rejections and from rate
//! limits (see [`crate::error`]).

use crate::{HttpError, ProxyConfig};
use base64::Engine;
use beacon_model::UserSettings;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

/// Default platform host.
const DEFAULT_HOST: &str = "discord.com";

/// REST request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect (and proxy handshake) timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Rich-presence application metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcApp {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// One declared application asset.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcAsset {
    pub id: String,
    pub name: String,
}

/// A resolved external asset.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalAsset {
    pub external_asset_path: String,
}

/// Settings-blob slots exposed by the settings-proto endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsSlot {
    /// General user settings.
    Preloaded = 1,
    /// Frecency and favorites storage.
    Frecency = 2,
}

/// REST API client.
pub struct RestClient {
    http: Client,
    /// Origin including scheme, e.g. `https://discord.com`.
    origin: String,
    /// Bare hostname, used for legacy-host detection.
    host: String,
    bot: bool,
    /// Server-issued token threaded through activity-session updates.
    activity_token: Mutex<Option<String>>,
    /// Memoized raw settings blobs, one per slot.
    settings_blobs: Mutex<[Option<Vec<u8>>; 2]>,
}

impl RestClient {
    /// Create a REST client.
    ///
    /// `fingerprint` is the base64 client-properties blob; it and the user
    /// agent are attached for user tokens only.
    pub fn new(
        token: &str,
        custom_host: Option<&str>,
        fingerprint: Option<&str>,
        user_agent: Option<&str>,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Self, HttpError> {
        let (origin, host) = resolve_host(custom_host);
        let bot = token.starts_with("Bot");

        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("*/*"));
        headers.insert(AUTHORIZATION, HeaderValue::from_str(token)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("Priority", HeaderValue::from_static("u=1"));
        headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("empty"));
        headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("cors"));
        headers.insert("Sec-Fetch-Site", HeaderValue::from_static("cross-site"));
        if !bot {
            if let Some(agent) = user_agent {
                headers.insert(USER_AGENT, HeaderValue::from_str(agent)?);
            }
            if let Some(fingerprint) = fingerprint {
                headers.insert("X-Super-Properties", HeaderValue::from_str(fingerprint)?);
            }
        }

        let mut builder = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .min_tls_version(reqwest::tls::Version::TLS_1_2);
        if let Some(proxy_config) = proxy {
            builder = builder.proxy(proxy_config.reqwest_proxy()?);
        }

        Ok(Self {
            http: builder.build()?,
            origin,
            host,
            bot,
            activity_token: Mutex::new(None),
            settings_blobs: Mutex::new([None, None]),
        })
    }

    /// The bare hostname requests go to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether the configured token is a bot token.
    pub fn is_bot(&self) -> bool {
        self.bot
    }

    pub(crate) fn api_url(&self, route: &str) -> String {
        format!("{}/api/v9{route}", self.origin)
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// Fetch the gateway WebSocket URL.
    pub async fn get_gateway_url(&self) -> Result<String, HttpError> {
        #[derive(Deserialize)]
        struct Gateway {
            url: String,
        }
        let gateway: Gateway = self.get_json("/gateway").await?;
        Ok(gateway.url)
    }

    /// Fetch and memoize a raw settings blob.
    pub async fn get_settings_blob(&self, slot: SettingsSlot) -> Result<Vec<u8>, HttpError> {
        let index = slot as usize - 1;
        if let Some(blob) = self.settings_blobs.lock()[index].clone() {
            return Ok(blob);
        }

        #[derive(Deserialize)]
        struct SettingsEnvelope {
            settings: String,
        }
        let route = format!("/users/@me/settings-proto/{}", slot as usize);
        let envelope: SettingsEnvelope = self.get_json(&route).await?;
        let blob = base64::engine::general_purpose::STANDARD
            .decode(envelope.settings)
            .map_err(|e| HttpError::Decode(e.to_string()))?;
        self.settings_blobs.lock()[index] = Some(blob.clone());
        Ok(blob)
    }

    /// Fetch the general user settings, decoded to the projected tree.
    pub async fn get_preloaded_settings(&self) -> Result<UserSettings, HttpError> {
        let blob = self.get_settings_blob(SettingsSlot::Preloaded).await?;
        beacon_model::proto::decode_preloaded(&blob).map_err(|e| HttpError::Decode(e.to_string()))
    }

    /// Fetch rich-presence metadata for an application.
    pub async fn get_rpc_app(&self, app_id: &str) -> Result<RpcApp, HttpError> {
        self.get_json(&format!("/oauth2/applications/{app_id}/rpc"))
            .await
    }

    /// Fetch the declared asset list for an application.
    pub async fn get_rpc_app_assets(&self, app_id: &str) -> Result<Vec<RpcAsset>, HttpError> {
        self.get_json(&format!("/oauth2/applications/{app_id}/assets"))
            .await
    }

    /// Resolve an external asset URL to a proxied asset path.
    pub async fn get_rpc_app_external(
        &self,
        app_id: &str,
        asset_url: &str,
    ) -> Result<Vec<ExternalAsset>, HttpError> {
        self.post_json(
            &format!("/applications/{app_id}/external-assets"),
            &json!({ "urls": [asset_url] }),
        )
        .await
    }

    /// Report a detected-game session opening or closing.
    ///
    /// The first response carries an opaque token echoed in every later call.
    pub async fn send_update_activity_session(
        &self,
        app_id: &str,
        exe_path: Option<&str>,
        closed: bool,
        session_id: &str,
    ) -> Result<String, HttpError> {
        #[derive(Deserialize)]
        struct ActivitySession {
            token: String,
        }
        let body = json!({
            "token": self.activity_token.lock().clone(),
            "application_id": app_id,
            "share_activity": true,
            "exePath": exe_path,
            "voice_channel_id": null,
            "session_id": session_id,
            "media_session_id": null,
            "closed": closed,
        });
        let session: ActivitySession = self.post_json("/activities", &body).await?;
        *self.activity_token.lock() = Some(session.token.clone());
        Ok(session.token)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn get_json<T: DeserializeOwned>(&self, route: &str) -> Result<T, HttpError> {
        debug!(route, "GET");
        let response = self.http.get(self.api_url(route)).send().await?;
        self.handle_response(route, response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        route: &str,
        body: &Value,
    ) -> Result<T, HttpError> {
        debug!(route, "POST");
        let response = self.http.post(self.api_url(route)).json(body).send().await?;
        self.handle_response(route, response).await
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        route: &str,
        response: Response,
    ) -> Result<T, HttpError> {
        let status = response.status();
        match status {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::TOO_MANY_REQUESTS => {
                let body: Value = response.json().await.unwrap_or(Value::Null);
                let retry_after = body
                    .get("retry_after")
                    .and_then(Value::as_f64)
                    .unwrap_or(5.0);
                error!(route, retry_after, "rate limited");
                Err(HttpError::RateLimited { retry_after })
            }
            _ => {
                error!(route, status = status.as_u16(), "request rejected");
                Err(HttpError::Status {
                    status: status.as_u16(),
                })
            }
        }
    }
}

/// Split an optional custom host into `(origin, hostname)`.
///
/// A bare hostname gets `https://`; a full URL keeps its scheme and port so
/// self-hosted servers (and tests) can run without TLS.
fn resolve_host(custom_host: Option<&str>) -> (String, String) {
    let Some(raw) = custom_host.map(str::trim).filter(|h| !h.is_empty()) else {
        return (format!("https://{DEFAULT_HOST}"), DEFAULT_HOST.to_string());
    };
    if let Ok(url) = Url::parse(raw) {
        if let Some(host) = url.host_str() {
            let origin = match url.port() {
                Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
                None => format!("{}://{}", url.scheme(), host),
            };
            return (origin, host.to_string());
        }
    }
    let bare = raw.trim_matches('/').to_string();
    (format!("https://{bare}"), bare)
}
