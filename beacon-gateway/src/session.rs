//! Gateway session lifecycle.
//!
//! One [`Gateway`] owns the WebSocket connection and three long-lived tasks:
//! the *receiver* (blocks on socket reads, dispatches payloads), the
//! *heartbeater* (jittered keep-alive beats plus the half-hourly time-spent
//! event), and the *guard* (polls the reconnect flag and spawns the
//! reconnect task when nobody else is already reconnecting). Reconnection
//! cancels and joins the receiver and heartbeater before it touches the
//! socket, so at most one generation of workers exists at a time.
//!
//! Writes to the socket go through a single async mutex; heartbeats,
//! presence updates and time-spent events never interleave on the wire.

use crate::compression::ZlibInflater;
use crate::error::{CloseDisposition, GatewayError};
use crate::opcode::OpCode;
use crate::payload::{self, GatewayPayload, HelloData, IdentifyData, RawPayload, ResumeData};
use crate::signal::Latest;
use crate::GATEWAY_VERSION;
use base64::Engine;
use beacon_http::{dial, ProxyConfig, RestClient};
use beacon_model::{
    Activity, CustomStatusEmoji, OwnUser, PresenceUpdate, Status, StatusActivity, UserSettings,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{client_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How often the guard checks the reconnect flag.
const GUARD_INTERVAL: Duration = Duration::from_millis(500);

/// How often the offline waiter retriggers a reconnect attempt.
const OFFLINE_RETRY: Duration = Duration::from_secs(5);

/// Grace period for a clean close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Time-spent event cadence, and the delay before the first one.
const TIME_SPENT_INTERVAL: Duration = Duration::from_secs(1800);
const TIME_SPENT_INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Gateway connection state as surfaced to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connected = 1,
    Reconnecting = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Connected,
            2 => SessionState::Reconnecting,
            _ => SessionState::Disconnected,
        }
    }
}

/// Gateway session configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Account token, verbatim (bot tokens keep their `Bot ` prefix).
    pub token: String,
    /// Capabilities mask (user tokens) or intents mask (bot tokens). `None`
    /// applies the protocol defaults.
    pub capabilities: Option<u64>,
    /// Client-identity properties embedded in identify.
    pub properties: Value,
    /// User agent for the WebSocket handshake.
    pub user_agent: String,
    /// `client_launch_id` from the identity fingerprint.
    pub launch_id: String,
    /// `client_heartbeat_session_id` from the identity fingerprint.
    pub heartbeat_session_id: String,
    /// Optional proxy for the WebSocket dial.
    pub proxy: Option<ProxyConfig>,
    /// Force legacy-host behavior on or off; `None` falls back to the
    /// hostname heuristic.
    pub legacy_host: Option<bool>,
}

/// Why the receiver loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiverExit {
    /// Cancelled by the reconnect path or shutdown; no follow-up.
    Cancelled,
    /// Connection lost or server asked us to move; reconnect.
    Lost,
    /// Close code 4004; the token is bad and the session is over.
    Fatal,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Workers {
    receiver: Option<Worker>,
    heartbeater: Option<Worker>,
    reconnect: Option<JoinHandle<()>>,
    guard: Option<JoinHandle<()>>,
    waiter: Option<JoinHandle<()>>,
}

struct SessionInner {
    config: GatewayConfig,
    rest: Arc<RestClient>,
    /// Process start, epoch milliseconds (time-spent events echo it).
    init_time_ms: f64,

    state: AtomicU8,
    run: AtomicBool,
    /// Offline poll mode: the network is gone and a waiter task retries.
    wait: AtomicBool,
    ready: AtomicBool,
    resumable: AtomicBool,
    reconnect_requested: AtomicBool,
    heartbeat_received: AtomicBool,
    legacy: AtomicBool,

    heartbeat_interval_ms: AtomicU64,
    /// Last seen dispatch sequence; zero means none yet.
    sequence: AtomicU64,

    gateway_url: Mutex<String>,
    resume_gateway_url: Mutex<String>,
    session_id: Mutex<String>,

    sink: tokio::sync::Mutex<Option<WsSink>>,
    workers: Mutex<Workers>,

    my_status: Latest<Vec<StatusActivity>>,
    settings: Latest<UserSettings>,
    user: Latest<OwnUser>,
    token_update: Latest<String>,
    fatal: Mutex<Option<String>>,
}

/// Handle to a gateway session.
pub struct Gateway {
    inner: Arc<SessionInner>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, rest: Arc<RestClient>) -> Self {
        let legacy = config
            .legacy_host
            .unwrap_or_else(|| rest.host().contains("spacebar"));
        let init_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as f64;
        Self {
            inner: Arc::new(SessionInner {
                config,
                rest,
                init_time_ms,
                state: AtomicU8::new(SessionState::Disconnected as u8),
                run: AtomicBool::new(true),
                wait: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                resumable: AtomicBool::new(false),
                reconnect_requested: AtomicBool::new(false),
                heartbeat_received: AtomicBool::new(true),
                legacy: AtomicBool::new(legacy),
                heartbeat_interval_ms: AtomicU64::new(41_250),
                sequence: AtomicU64::new(0),
                gateway_url: Mutex::new(String::new()),
                resume_gateway_url: Mutex::new(String::new()),
                session_id: Mutex::new(String::new()),
                sink: tokio::sync::Mutex::new(None),
                workers: Mutex::new(Workers::default()),
                my_status: Latest::new(),
                settings: Latest::new(),
                user: Latest::new(),
                token_update: Latest::new(),
                fatal: Mutex::new(None),
            }),
        }
    }

    /// Create the initial connection: fetch the gateway URL, open the
    /// socket, start the workers, identify.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        let url = self.inner.rest.get_gateway_url().await.map_err(|e| {
            if e.is_transient() {
                GatewayError::NoInternet
            } else {
                GatewayError::Http(e)
            }
        })?;
        info!(url = %url, "connecting to gateway");
        *self.inner.gateway_url.lock() = url;

        self.inner.fresh_session().await?;
        self.inner
            .state
            .store(SessionState::Connected as u8, Ordering::SeqCst);

        let guard = tokio::spawn(guard_loop(Arc::clone(&self.inner)));
        self.inner.workers.lock().guard = Some(guard);
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Whether a full READY event has been ingested.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.run.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> String {
        self.inner.session_id.lock().clone()
    }

    /// Unrecoverable error text, if the session has died.
    pub fn fatal_error(&self) -> Option<String> {
        self.inner.fatal.lock().clone()
    }

    /// Publish a presence update (opcode 3). A no-op on legacy hosts, which
    /// reject the event.
    pub async fn update_presence(
        &self,
        status: Status,
        custom_status: Option<&str>,
        custom_status_emoji: Option<&CustomStatusEmoji>,
        activities: Vec<Activity>,
        afk: bool,
    ) {
        if self.inner.legacy.load(Ordering::SeqCst) {
            return;
        }
        let update =
            PresenceUpdate::new(status, custom_status, custom_status_emoji, activities, afk);
        let payload = GatewayPayload::new(OpCode::PresenceUpdate, update);
        match serde_json::to_string(&payload) {
            Ok(text) => {
                self.inner.send_text(text).await;
                debug!("updated presence");
            }
            Err(e) => warn!(error = %e, "failed to serialize presence update"),
        }
    }

    /// Own-status snapshot from SESSIONS_REPLACE; yielded once per change.
    pub fn take_status(&self) -> Option<Vec<StatusActivity>> {
        self.inner.my_status.take()
    }

    /// Latest decoded settings blob; yielded once per change.
    pub fn take_settings(&self) -> Option<UserSettings> {
        self.inner.settings.take()
    }

    /// Identity refresh from READY/USER_UPDATE; yielded once per change.
    pub fn take_user(&self) -> Option<OwnUser> {
        self.inner.user.take()
    }

    /// Server-refreshed token; yielded once.
    pub fn take_token_update(&self) -> Option<String> {
        self.inner.token_update.take()
    }

    /// Reset transient presence state by forcing a reconnect.
    pub fn set_offline(&self) {
        self.inner.reconnect_requested.store(true, Ordering::SeqCst);
    }

    /// Terminal close: stop every worker and close the socket.
    pub async fn disconnect(&self, code: u16) {
        self.inner.run.store(false, Ordering::SeqCst);
        let (reconnect, guard, waiter) = {
            let mut workers = self.inner.workers.lock();
            (
                workers.reconnect.take(),
                workers.guard.take(),
                workers.waiter.take(),
            )
        };
        for handle in [reconnect, guard, waiter].into_iter().flatten() {
            handle.abort();
        }
        self.inner.stop_workers().await;
        self.inner.close_ws(code).await;
        self.inner
            .state
            .store(SessionState::Disconnected as u8, Ordering::SeqCst);
        info!(code, "gateway disconnected");
    }
}

impl SessionInner {
    fn sequence(&self) -> Option<u64> {
        match self.sequence.load(Ordering::SeqCst) {
            0 => None,
            seq => Some(seq),
        }
    }

    fn set_fatal(&self, message: &str) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(message.to_string());
        }
    }

    /// Serialize a text payload onto the socket. Failures flag a reconnect
    /// instead of propagating; the protocol recovers via resume.
    async fn send_text(&self, payload: String) {
        self.send_message(Message::Text(payload.into())).await;
    }

    async fn send_message(&self, message: Message) {
        let mut sink = self.sink.lock().await;
        let result = match sink.as_mut() {
            Some(sink) => sink.send(message).await,
            None => Err(WsError::ConnectionClosed),
        };
        drop(sink);
        if result.is_err() {
            self.reconnect_requested.store(true, Ordering::SeqCst);
        }
    }

    /// Close and drop the current socket, bounded by [`CLOSE_TIMEOUT`].
    async fn close_ws(&self, code: u16) {
        let taken = self.sink.lock().await.take();
        if let Some(mut sink) = taken {
            let frame = CloseFrame {
                code: code.into(),
                reason: "".into(),
            };
            let _ = timeout(CLOSE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await;
            let _ = timeout(CLOSE_TIMEOUT, sink.close()).await;
        }
    }

    /// Open a WebSocket to `base_url` (dialing through the proxy when one is
    /// configured) and consume the hello frame. Returns the split socket, the
    /// connection's inflater, and the hello heartbeat interval.
    async fn open_ws(
        &self,
        base_url: &str,
    ) -> Result<(WsSink, WsSource, ZlibInflater, u64), GatewayError> {
        let full_url =
            format!("{base_url}/?v={GATEWAY_VERSION}&encoding=json&compress=zlib-stream");
        let url = Url::parse(&full_url).map_err(|e| invalid_input(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| invalid_input("gateway URL has no host".to_string()))?
            .to_string();
        let port = url.port().unwrap_or(443);

        let tcp = dial(self.config.proxy.as_ref(), &host, port).await?;

        let mut request = full_url
            .as_str()
            .into_client_request()
            .map_err(GatewayError::WebSocket)?;
        let headers = request.headers_mut();
        headers.insert(
            "Sec-WebSocket-Extensions",
            HeaderValue::from_static("permessage-deflate"),
        );
        if let Ok(agent) = HeaderValue::from_str(&self.config.user_agent) {
            headers.insert("User-Agent", agent);
        }

        let (ws, _response) = client_async_tls_with_config(request, tcp, None, None).await?;
        let (sink, mut stream) = ws.split();

        let mut inflater = ZlibInflater::new();
        let hello = read_payload(&mut stream, &mut inflater).await?.ok_or(
            GatewayError::Closed {
                code: 0,
                reason: "connection closed before hello".to_string(),
            },
        )?;
        let interval = serde_json::from_value::<HelloData>(hello.d)?.heartbeat_interval;
        debug!(interval_ms = interval, "received hello");
        Ok((sink, stream, inflater, interval))
    }

    /// Open a fresh socket on the base gateway URL, restart the workers and
    /// identify.
    async fn fresh_session(self: &Arc<Self>) -> Result<(), GatewayError> {
        self.close_ws(1000).await;
        self.ready.store(false, Ordering::SeqCst);

        let url = self.gateway_url.lock().clone();
        let (sink, stream, inflater, interval) = self.open_ws(&url).await?;
        self.heartbeat_interval_ms.store(interval, Ordering::SeqCst);
        *self.sink.lock().await = Some(sink);
        self.spawn_receiver(stream, inflater);
        self.spawn_heartbeater();
        self.authenticate().await?;
        Ok(())
    }

    /// Send identify (opcode 2).
    async fn authenticate(&self) -> Result<(), GatewayError> {
        let identify = IdentifyData::new(
            &self.config.token,
            self.config.capabilities,
            &self.config.properties,
        );
        let payload = GatewayPayload::new(OpCode::Identify, identify);
        let text = serde_json::to_string(&payload)?;
        self.send_text(text).await;
        debug!("sent identify");
        Ok(())
    }

    /// Attempt to resume the session on `resume_gateway_url`.
    ///
    /// Returns the new socket halves when the server accepted the resume, or
    /// `None` when it answered with an invalid-session (or anything
    /// unparseable) and the caller must identify from scratch. Transport
    /// errors propagate so the caller can enter offline polling.
    async fn try_resume(&self) -> Result<Option<(WsSink, WsSource, ZlibInflater)>, GatewayError> {
        self.close_ws(1000).await;
        let resume_url = self.resume_gateway_url.lock().clone();
        if resume_url.is_empty() {
            return Ok(None);
        }

        let (mut sink, mut stream, mut inflater, interval) = match self.open_ws(&resume_url).await
        {
            Ok(parts) => parts,
            // A rejected handshake means the resume endpoint is gone.
            Err(GatewayError::WebSocket(WsError::Http(_))) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.heartbeat_interval_ms.store(interval, Ordering::SeqCst);

        let session_id = self.session_id.lock().clone();
        let resume = GatewayPayload::new(
            OpCode::Resume,
            ResumeData {
                token: &self.config.token,
                session_id: &session_id,
                seq: self.sequence(),
            },
        );
        sink.send(Message::Text(serde_json::to_string(&resume)?.into()))
            .await?;

        let Ok(Some(raw)) = read_payload(&mut stream, &mut inflater).await else {
            info!("failed to resume connection");
            return Ok(None);
        };
        if raw.op == OpCode::InvalidSession as u8 {
            info!("resume rejected by server");
            return Ok(None);
        }
        debug!(op = raw.op, "connection resumed");
        Ok(Some((sink, stream, inflater)))
    }

    /// Resume if eligible, otherwise rebuild the session with a fresh
    /// identify.
    async fn reestablish(self: &Arc<Self>) -> Result<(), GatewayError> {
        if self.resumable.swap(false, Ordering::SeqCst) {
            if let Some((sink, stream, inflater)) = self.try_resume().await? {
                *self.sink.lock().await = Some(sink);
                self.spawn_receiver(stream, inflater);
                self.spawn_heartbeater();
                return Ok(());
            }
            debug!("restarting connection with a fresh identify");
        }
        self.fresh_session().await
    }

    /// Cancel and join the receiver and heartbeater.
    async fn stop_workers(&self) {
        let (receiver, heartbeater) = {
            let mut workers = self.workers.lock();
            (workers.receiver.take(), workers.heartbeater.take())
        };
        for worker in [receiver, heartbeater].into_iter().flatten() {
            worker.cancel.cancel();
            let _ = worker.handle.await;
        }
    }

    fn spawn_receiver(self: &Arc<Self>, stream: WsSource, inflater: ZlibInflater) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(receiver_loop(
            Arc::clone(self),
            stream,
            inflater,
            cancel.clone(),
        ));
        self.workers.lock().receiver = Some(Worker { cancel, handle });
    }

    fn spawn_heartbeater(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(heartbeater_loop(Arc::clone(self), cancel.clone()));
        self.workers.lock().heartbeater = Some(Worker { cancel, handle });
    }

    // =========================================================================
    // Payload handling
    // =========================================================================

    /// Act on one parsed payload. Returns the exit reason when the receiver
    /// should stop.
    async fn process_payload(&self, raw: RawPayload) -> Option<ReceiverExit> {
        match OpCode::from_u8(raw.op) {
            Some(OpCode::HeartbeatAck) => {
                self.heartbeat_received.store(true, Ordering::SeqCst);
            }
            Some(OpCode::Hello) => {
                if let Ok(hello) = serde_json::from_value::<HelloData>(raw.d) {
                    self.heartbeat_interval_ms
                        .store(hello.heartbeat_interval, Ordering::SeqCst);
                }
            }
            Some(OpCode::Heartbeat) => {
                // Server-requested beat; echo the current sequence.
                self.send_text(payload::heartbeat(self.sequence())).await;
            }
            Some(OpCode::Dispatch) => {
                if let Some(seq) = raw.s {
                    self.sequence.fetch_max(seq, Ordering::SeqCst);
                }
                if let Some(event) = raw.t.as_deref() {
                    trace!(event, "dispatch");
                    self.handle_dispatch(event, raw.d);
                }
            }
            Some(OpCode::Reconnect) => {
                info!("host requested reconnect");
                self.resumable.store(true, Ordering::SeqCst);
                return Some(ReceiverExit::Lost);
            }
            Some(OpCode::InvalidSession) => {
                let resumable = raw.d.as_bool().unwrap_or(false);
                warn!(resumable, "session invalidated");
                self.resumable.store(resumable, Ordering::SeqCst);
                return Some(ReceiverExit::Lost);
            }
            _ => trace!(op = raw.op, "ignoring opcode"),
        }
        None
    }

    fn handle_dispatch(&self, event: &str, data: Value) {
        match event {
            "READY" => self.handle_ready(data),
            "SESSIONS_REPLACE" => self.handle_sessions_replace(&data),
            "USER_SETTINGS_PROTO_UPDATE" => self.handle_settings_update(&data),
            "USER_UPDATE" => match serde_json::from_value::<OwnUser>(data) {
                Ok(user) => self.user.set(user),
                Err(e) => warn!(error = %e, "unparseable USER_UPDATE"),
            },
            _ => {}
        }
    }

    fn handle_ready(&self, data: Value) {
        self.ready.store(false, Ordering::SeqCst);

        if let Some(url) = data["resume_gateway_url"].as_str() {
            *self.resume_gateway_url.lock() = url.to_string();
        }
        if let Some(session_id) = data["session_id"].as_str() {
            *self.session_id.lock() = session_id.to_string();
        }
        match serde_json::from_value::<OwnUser>(data["user"].clone()) {
            Ok(user) => self.user.set(user),
            Err(e) => warn!(error = %e, "unparseable READY user"),
        }
        if let Some(token) = data["auth_token"].as_str() {
            info!("token has been refreshed by the server");
            self.token_update.set(token.to_string());
        }

        let proto = data
            .get("user_settings_proto")
            .and_then(Value::as_str)
            .filter(|_| !self.legacy.load(Ordering::SeqCst));
        match proto {
            Some(blob) => match decode_settings_blob(blob) {
                Ok(settings) => self.settings.set(settings),
                Err(e) => warn!(error = %e, "failed to decode READY settings blob"),
            },
            None => {
                // Legacy hosts embed flat JSON settings instead.
                self.legacy.store(true, Ordering::SeqCst);
                self.settings
                    .set(UserSettings::from_legacy(&data["user_settings"]));
            }
        }

        // READY is large; `data` is dropped here rather than retained.
        self.ready.store(true, Ordering::SeqCst);
        info!(session_id = %self.session_id.lock(), "gateway session ready");
    }

    fn handle_sessions_replace(&self, data: &Value) {
        let Some(first) = data.get(0) else { return };
        let activities = first
            .get("activities")
            .and_then(Value::as_array)
            .map(|raw| {
                raw.iter()
                    .filter_map(|activity| {
                        let kind = activity.get("type").and_then(Value::as_u64)?;
                        // Only playing and listening are part of the status.
                        if kind != 0 && kind != 2 {
                            return None;
                        }
                        Some(StatusActivity {
                            kind: kind as u8,
                            name: activity.get("name")?.as_str()?.to_string(),
                            state: activity
                                .get("state")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            details: activity
                                .get("details")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            small_text: activity["assets"]["small_text"]
                                .as_str()
                                .map(str::to_string),
                            large_text: activity["assets"]["large_text"]
                                .as_str()
                                .map(str::to_string),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.my_status.set(activities);
    }

    fn handle_settings_update(&self, data: &Value) {
        let partial = data["partial"].as_bool().unwrap_or(false);
        let kind = data["settings"]["type"].as_u64().unwrap_or(0);
        if partial || kind != 1 {
            return;
        }
        let Some(blob) = data["settings"]["proto"].as_str() else {
            return;
        };
        match decode_settings_blob(blob) {
            Ok(settings) => self.settings.set(settings),
            Err(e) => warn!(error = %e, "failed to decode settings update"),
        }
    }
}

/// Decode a base64 settings blob into the projected settings tree.
fn decode_settings_blob(blob: &str) -> Result<UserSettings, GatewayError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(blob)
        .map_err(|e| GatewayError::JsonDecode(e.to_string()))?;
    beacon_model::proto::decode_preloaded(&bytes)
        .map_err(|e| GatewayError::JsonDecode(e.to_string()))
}

fn invalid_input(message: String) -> GatewayError {
    GatewayError::Io(io::Error::new(io::ErrorKind::InvalidInput, message))
}

/// Read frames until one complete payload parses. `Ok(None)` means the
/// stream ended or delivered a close/unparseable frame.
async fn read_payload(
    stream: &mut WsSource,
    inflater: &mut ZlibInflater,
) -> Result<Option<RawPayload>, GatewayError> {
    loop {
        let Some(frame) = stream.next().await else {
            return Ok(None);
        };
        match frame? {
            Message::Binary(data) => {
                if let Some(bytes) = inflater.push(&data)? {
                    return Ok(serde_json::from_slice(bytes).ok());
                }
            }
            Message::Text(text) => return Ok(serde_json::from_str(text.as_str()).ok()),
            Message::Close(_) => return Ok(None),
            _ => continue,
        }
    }
}

/// Heartbeat period: a uniformly random 20-80% of the nominal interval.
fn randomized_period(interval_ms: u64) -> Duration {
    let factor = 0.8 - 0.6 * rand::random::<f64>();
    Duration::from_secs_f64(interval_ms as f64 * factor / 1000.0)
}

// =============================================================================
// Worker loops
// =============================================================================

async fn receiver_loop(
    inner: Arc<SessionInner>,
    mut stream: WsSource,
    mut inflater: ZlibInflater,
    cancel: CancellationToken,
) {
    debug!("receiver started");
    inner.resumable.store(false, Ordering::SeqCst);

    let exit = 'recv: loop {
        if !inner.run.load(Ordering::SeqCst) {
            break ReceiverExit::Cancelled;
        }
        let frame = tokio::select! {
            _ = cancel.cancelled() => break ReceiverExit::Cancelled,
            frame = stream.next() => frame,
        };
        let message = match frame {
            None => {
                inner.resumable.store(true, Ordering::SeqCst);
                break ReceiverExit::Lost;
            }
            Some(Err(e)) => {
                debug!(error = %e, "socket read failed");
                inner.resumable.store(true, Ordering::SeqCst);
                break ReceiverExit::Lost;
            }
            Some(Ok(message)) => message,
        };
        match message {
            Message::Binary(data) => match inflater.push(&data) {
                Ok(Some(bytes)) => match serde_json::from_slice::<RawPayload>(bytes) {
                    Ok(raw) => {
                        if let Some(exit) = inner.process_payload(raw).await {
                            break exit;
                        }
                    }
                    Err(e) => warn!(error = %e, "unparseable gateway payload"),
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "decompression failed");
                    inner.resumable.store(true, Ordering::SeqCst);
                    break ReceiverExit::Lost;
                }
            },
            Message::Text(text) => match serde_json::from_str::<RawPayload>(text.as_str()) {
                Ok(raw) => {
                    if let Some(exit) = inner.process_payload(raw).await {
                        break exit;
                    }
                }
                Err(e) => warn!(error = %e, "unparseable gateway payload"),
            },
            Message::Ping(data) => inner.send_message(Message::Pong(data)).await,
            Message::Pong(_) | Message::Frame(_) => {}
            Message::Close(frame) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((0, String::new()));
                if code == 1000 || code == 1001 {
                    info!(code, "gateway closed");
                } else {
                    warn!(code, reason = %reason, "gateway closed");
                }
                match CloseDisposition::from_code(code) {
                    CloseDisposition::Fatal => break 'recv ReceiverExit::Fatal,
                    CloseDisposition::Resume => {
                        inner.resumable.store(true, Ordering::SeqCst);
                        break ReceiverExit::Lost;
                    }
                    CloseDisposition::Reidentify => {
                        inner.resumable.store(false, Ordering::SeqCst);
                        break ReceiverExit::Lost;
                    }
                }
            }
        }
    };

    debug!("receiver stopped");
    match exit {
        ReceiverExit::Cancelled => {}
        ReceiverExit::Lost => {
            inner
                .state
                .store(SessionState::Disconnected as u8, Ordering::SeqCst);
            inner.reconnect_requested.store(true, Ordering::SeqCst);
        }
        ReceiverExit::Fatal => {
            inner.set_fatal("authentication failed (close code 4004)");
            inner.run.store(false, Ordering::SeqCst);
            inner
                .state
                .store(SessionState::Disconnected as u8, Ordering::SeqCst);
        }
    }
}

async fn heartbeater_loop(inner: Arc<SessionInner>, cancel: CancellationToken) {
    let interval_ms = inner.heartbeat_interval_ms.load(Ordering::SeqCst);
    debug!(interval_ms, "heartbeater started");
    inner.heartbeat_received.store(true, Ordering::SeqCst);

    // Hold real beats until READY has been ingested; an account too large to
    // process in one interval is not supportable.
    let ready_deadline = Instant::now() + Duration::from_millis(interval_ms);
    while !inner.ready.load(Ordering::SeqCst) {
        if Instant::now() >= ready_deadline {
            inner.set_fatal(
                "READY event could not be processed in time, probably because of too many guilds",
            );
            inner.run.store(false, Ordering::SeqCst);
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(Duration::from_millis(500)) => {}
        }
    }

    let mut period = randomized_period(interval_ms);
    let mut last_beat = Instant::now();
    let mut next_time_spent = Instant::now() + TIME_SPENT_INITIAL_DELAY;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("heartbeater stopped");
                return;
            }
            _ = sleep(Duration::from_secs(1)) => {}
        }
        if !inner.run.load(Ordering::SeqCst) {
            return;
        }

        let legacy = inner.legacy.load(Ordering::SeqCst);
        let send_time_spent = !legacy && Instant::now() >= next_time_spent;
        if send_time_spent {
            inner
                .send_text(payload::time_spent(
                    inner.init_time_ms,
                    &inner.config.heartbeat_session_id,
                    &inner.config.launch_id,
                ))
                .await;
            next_time_spent = Instant::now() + TIME_SPENT_INTERVAL;
            debug!("sent time-spent event");
        }

        if last_beat.elapsed() >= period || send_time_spent {
            let seq = inner.sequence();
            let beat = if legacy {
                payload::heartbeat(seq)
            } else {
                payload::heartbeat_qos(seq)
            };
            inner.send_text(beat).await;
            last_beat = Instant::now();
            trace!(seq, "sent heartbeat");

            // The previous beat must have been acknowledged by now.
            if !inner.heartbeat_received.swap(false, Ordering::SeqCst) {
                warn!("heartbeat reply not received");
                inner.resumable.store(true, Ordering::SeqCst);
                break;
            }
            period = randomized_period(inner.heartbeat_interval_ms.load(Ordering::SeqCst));
        }
    }

    debug!("heartbeater stopped");
    inner
        .state
        .store(SessionState::Disconnected as u8, Ordering::SeqCst);
    inner.reconnect_requested.store(true, Ordering::SeqCst);
}

/// Poll the reconnect flag; spawn the reconnect task when it is set and no
/// reconnect is already in flight.
async fn guard_loop(inner: Arc<SessionInner>) {
    loop {
        sleep(GUARD_INTERVAL).await;
        if !inner.run.load(Ordering::SeqCst) {
            return;
        }
        if inner.reconnect_requested.swap(false, Ordering::SeqCst) {
            let mut workers = inner.workers.lock();
            let in_flight = workers
                .reconnect
                .as_ref()
                .is_some_and(|handle| !handle.is_finished());
            if !in_flight {
                workers.reconnect = Some(tokio::spawn(reconnect(Arc::clone(&inner))));
            }
        }
    }
}

async fn reconnect(inner: Arc<SessionInner>) {
    if !inner.wait.load(Ordering::SeqCst) {
        inner
            .state
            .store(SessionState::Reconnecting as u8, Ordering::SeqCst);
        info!("trying to reconnect");
    }
    inner.stop_workers().await;

    match inner.reestablish().await {
        Ok(()) => {
            inner.wait.store(false, Ordering::SeqCst);
            inner
                .state
                .store(SessionState::Connected as u8, Ordering::SeqCst);
            info!("connection established");
        }
        Err(e) => {
            if inner.run.load(Ordering::SeqCst) && !inner.wait.load(Ordering::SeqCst) {
                warn!(error = %e, "no internet connection");
                inner.close_ws(1000).await;
                let waiter = tokio::spawn(wait_online(Arc::clone(&inner)));
                inner.workers.lock().waiter = Some(waiter);
            }
        }
    }
}

/// Offline mode: retrigger a reconnect attempt every few seconds until the
/// network returns.
async fn wait_online(inner: Arc<SessionInner>) {
    inner.wait.store(true, Ordering::SeqCst);
    while inner.run.load(Ordering::SeqCst) && inner.wait.load(Ordering::SeqCst) {
        inner.reconnect_requested.store(true, Ordering::SeqCst);
        sleep(OFFLINE_RETRY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn test_gateway(legacy: Option<bool>) -> Gateway {
        let rest = Arc::new(RestClient::new("tok", None, None, None, None).unwrap());
        Gateway::new(
            GatewayConfig {
                token: "tok".to_string(),
                capabilities: None,
                properties: json!({"os": "Linux"}),
                user_agent: "agent/1.0".to_string(),
                launch_id: "launch".to_string(),
                heartbeat_session_id: "hb-session".to_string(),
                proxy: None,
                legacy_host: legacy,
            },
            rest,
        )
    }

    fn dispatch(event: &str, seq: u64, data: Value) -> RawPayload {
        serde_json::from_value(json!({"op": 0, "s": seq, "t": event, "d": data})).unwrap()
    }

    #[tokio::test]
    async fn test_ready_populates_session() {
        let gateway = test_gateway(Some(false));
        let inner = &gateway.inner;
        let ready = dispatch(
            "READY",
            1,
            json!({
                "resume_gateway_url": "wss://resume.example",
                "session_id": "sess-1",
                "user": {"id": "42", "username": "me", "flags": 32},
                "auth_token": "fresh-token",
                "user_settings_proto": "",
            }),
        );
        assert_eq!(inner.process_payload(ready).await, None);
        assert!(gateway.is_ready());
        assert_eq!(gateway.session_id(), "sess-1");
        assert_eq!(*inner.resume_gateway_url.lock(), "wss://resume.example");
        assert_eq!(gateway.take_user().unwrap().id, "42");
        assert_eq!(gateway.take_token_update().as_deref(), Some("fresh-token"));
        // Empty blob decodes to empty settings.
        assert!(!gateway.take_settings().unwrap().has_status());
        assert!(gateway.take_token_update().is_none());
    }

    #[tokio::test]
    async fn test_ready_legacy_synthesizes_settings() {
        let gateway = test_gateway(None);
        let inner = &gateway.inner;
        assert!(!inner.legacy.load(Ordering::SeqCst));
        let ready = dispatch(
            "READY",
            1,
            json!({
                "resume_gateway_url": "wss://resume.example",
                "session_id": "sess-1",
                "user": {"id": "42", "username": "me"},
                "user_settings": {"status": "dnd", "custom_status": {"text": "shh"}},
            }),
        );
        inner.process_payload(ready).await;
        // No proto blob flips the session into legacy mode.
        assert!(inner.legacy.load(Ordering::SeqCst));
        let settings = gateway.take_settings().unwrap();
        let (status, text, _) = settings.presence_parts();
        assert_eq!(status, Status::Dnd);
        assert_eq!(text.as_deref(), Some("shh"));
    }

    #[tokio::test]
    async fn test_sessions_replace_keeps_playing_and_listening() {
        let gateway = test_gateway(Some(false));
        let payload = dispatch(
            "SESSIONS_REPLACE",
            2,
            json!([{"activities": [
                {"type": 0, "name": "Game", "state": "menu",
                 "assets": {"large_text": "big"}},
                {"type": 4, "name": "Custom Status", "state": "hi"},
                {"type": 2, "name": "Music"}
            ]}]),
        );
        gateway.inner.process_payload(payload).await;
        let status = gateway.take_status().unwrap();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].name, "Game");
        assert_eq!(status[0].large_text.as_deref(), Some("big"));
        assert_eq!(status[1].kind, 2);
        // Read clears.
        assert!(gateway.take_status().is_none());
    }

    #[tokio::test]
    async fn test_settings_update_skips_partial_and_foreign_types() {
        let gateway = test_gateway(Some(false));
        let inner = &gateway.inner;
        inner
            .process_payload(dispatch(
                "USER_SETTINGS_PROTO_UPDATE",
                3,
                json!({"partial": true, "settings": {"type": 1, "proto": ""}}),
            ))
            .await;
        assert!(gateway.take_settings().is_none());

        inner
            .process_payload(dispatch(
                "USER_SETTINGS_PROTO_UPDATE",
                4,
                json!({"partial": false, "settings": {"type": 2, "proto": ""}}),
            ))
            .await;
        assert!(gateway.take_settings().is_none());

        inner
            .process_payload(dispatch(
                "USER_SETTINGS_PROTO_UPDATE",
                5,
                json!({"partial": false, "settings": {"type": 1, "proto": ""}}),
            ))
            .await;
        assert!(gateway.take_settings().is_some());
    }

    #[tokio::test]
    async fn test_reconnect_request_marks_resumable() {
        let gateway = test_gateway(Some(false));
        let raw: RawPayload = serde_json::from_value(json!({"op": 7, "d": null})).unwrap();
        let exit = gateway.inner.process_payload(raw).await;
        assert_eq!(exit, Some(ReceiverExit::Lost));
        assert!(gateway.inner.resumable.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_invalid_session_resumable_follows_payload() {
        let gateway = test_gateway(Some(false));
        let raw: RawPayload = serde_json::from_value(json!({"op": 9, "d": false})).unwrap();
        assert_eq!(
            gateway.inner.process_payload(raw).await,
            Some(ReceiverExit::Lost)
        );
        assert!(!gateway.inner.resumable.load(Ordering::SeqCst));

        let raw: RawPayload = serde_json::from_value(json!({"op": 9, "d": true})).unwrap();
        gateway.inner.process_payload(raw).await;
        assert!(gateway.inner.resumable.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_heartbeat_ack_flag() {
        let gateway = test_gateway(Some(false));
        gateway
            .inner
            .heartbeat_received
            .store(false, Ordering::SeqCst);
        let raw: RawPayload = serde_json::from_value(json!({"op": 11})).unwrap();
        gateway.inner.process_payload(raw).await;
        assert!(gateway.inner.heartbeat_received.load(Ordering::SeqCst));
    }

    #[test]
    fn test_randomized_period_bounds() {
        for _ in 0..256 {
            let period = randomized_period(41_250);
            assert!(period >= Duration::from_secs_f64(41.25 * 0.2));
            assert!(period <= Duration::from_secs_f64(41.25 * 0.8));
        }
    }

    proptest! {
        /// The observed sequence is the running maximum of the dispatched
        /// sequence numbers: it never decreases within a session.
        #[test]
        fn prop_sequence_monotonic(seqs in proptest::collection::vec(1u64..10_000, 1..64)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            runtime.block_on(async {
                let gateway = test_gateway(Some(false));
                let mut observed = Vec::new();
                for seq in &seqs {
                    let raw = dispatch("UNKNOWN_EVENT", *seq, Value::Null);
                    gateway.inner.process_payload(raw).await;
                    observed.push(gateway.inner.sequence.load(Ordering::SeqCst));
                }
                for window in observed.windows(2) {
                    assert!(window[1] >= window[0]);
                }
                let max = seqs.iter().copied().max().unwrap();
                assert_eq!(*observed.last().unwrap(), max);
            });
        }
    }
}
