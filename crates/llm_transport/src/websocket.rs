//! WebSocket transport with a session-keyed connection pool.
//!
//! A pooled socket serves one request at a time. A second caller for a busy
//! session gets a dedicated socket that is closed after use. Idle pooled
//! sockets close themselves after the pool's TTL. Failed or aborted calls
//! never return their socket to the pool.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::cancel::{await_or_cancel, CancelSignal};
use crate::error::TransportError;
use crate::transport::{EventHandler, EventTransport, TransportRequest};

/// Idle pooled sockets are closed after this long.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(5 * 60);
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_ABORTED: u16 = 4000;

const COMPLETION_EVENTS: [&str; 2] = ["response.completed", "response.done"];

/// One inbound item from a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsIncoming {
    Text(String),
    Closed { code: Option<u16>, reason: String },
}

/// An established client socket.
#[async_trait]
pub trait WsConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next text frame or the close notification. Control frames are handled internally.
    async fn recv(&mut self) -> Result<WsIncoming, TransportError>;

    /// Best-effort close with the given code; errors are ignored.
    async fn close(&mut self, code: u16, reason: &str);

    fn is_open(&self) -> bool;
}

/// Opens client sockets.
#[async_trait]
pub trait WsConnector: Send + Sync {
    /// Fails with [`TransportError::WebSocketConnect`] when the handshake does not complete.
    async fn connect(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Box<dyn WsConnection>, TransportError>;
}

/// Connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl WsConnector for TungsteniteConnector {
    async fn connect(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Box<dyn WsConnection>, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|error| TransportError::InvalidRequest(format!("{url}: {error}")))?;
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| TransportError::InvalidRequest(format!("invalid header key: {key}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| TransportError::InvalidRequest(format!("invalid header value for {key}")))?;
            request.headers_mut().insert(name, value);
        }

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|error| TransportError::WebSocketConnect(error.to_string()))?;
        Ok(Box::new(TungsteniteConnection { socket, open: true }))
    }
}

struct TungsteniteConnection {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    open: bool,
}

#[async_trait]
impl WsConnection for TungsteniteConnection {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.socket.send(Message::Text(text)).await.map_err(|error| {
            self.open = false;
            TransportError::WebSocket(error.to_string())
        })
    }

    async fn recv(&mut self) -> Result<WsIncoming, TransportError> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => return Ok(WsIncoming::Text(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    if let Ok(text) = String::from_utf8(bytes) {
                        return Ok(WsIncoming::Text(text));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    self.open = false;
                    return Ok(WsIncoming::Closed {
                        code: frame.as_ref().map(|frame| u16::from(frame.code)),
                        reason: frame
                            .map(|frame| frame.reason.into_owned())
                            .unwrap_or_default(),
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    self.open = false;
                    return Err(TransportError::WebSocket(error.to_string()));
                }
                None => {
                    self.open = false;
                    return Ok(WsIncoming::Closed {
                        code: None,
                        reason: String::new(),
                    });
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if !self.open {
            return;
        }
        self.open = false;
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        let _ = self.socket.close(Some(frame)).await;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

struct PoolEntry {
    socket: Option<Box<dyn WsConnection>>,
    busy: bool,
    generation: u64,
    expiry: Option<JoinHandle<()>>,
}

type Entries = Arc<Mutex<HashMap<String, PoolEntry>>>;

/// Session-keyed socket cache. Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct WebSocketPool {
    connector: Arc<dyn WsConnector>,
    entries: Entries,
    idle_ttl: Duration,
    generations: Arc<AtomicU64>,
}

impl fmt::Debug for WebSocketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketPool")
            .field("sessions", &self.len())
            .field("idle_ttl", &self.idle_ttl)
            .finish_non_exhaustive()
    }
}

impl Default for WebSocketPool {
    fn default() -> Self {
        Self::new(Arc::new(TungsteniteConnector))
    }
}

impl WebSocketPool {
    pub fn new(connector: Arc<dyn WsConnector>) -> Self {
        Self {
            connector,
            entries: Arc::new(Mutex::new(HashMap::new())),
            idle_ttl: DEFAULT_IDLE_TTL,
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    /// Number of cached sessions, busy or idle.
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `Some(busy)` when a socket is cached for `session_id`.
    pub fn session_busy(&self, session_id: &str) -> Option<bool> {
        lock_unpoisoned(&self.entries)
            .get(session_id)
            .map(|entry| entry.busy)
    }

    /// Opens or reuses a socket. Without a session id the socket is never cached.
    pub async fn acquire(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        session_id: Option<&str>,
        cancel: Option<&CancelSignal>,
    ) -> Result<WsLease, TransportError> {
        let Some(session_id) = session_id else {
            let socket = self.connect(url, headers, cancel).await?;
            return Ok(WsLease::new(self.clone(), socket, None));
        };

        let mut stale = None;
        let mut busy = false;
        {
            let mut entries = lock_unpoisoned(&self.entries);
            if let Some(entry) = entries.get_mut(session_id) {
                if let Some(expiry) = entry.expiry.take() {
                    expiry.abort();
                }
                let reusable = entry.socket.as_ref().is_some_and(|socket| socket.is_open());
                if entry.busy {
                    busy = true;
                } else if reusable {
                    if let Some(socket) = entry.socket.take() {
                        entry.busy = true;
                        debug!(session_id, "reusing pooled websocket");
                        let slot = (session_id.to_owned(), entry.generation);
                        return Ok(WsLease::new(self.clone(), socket, Some(slot)));
                    }
                } else {
                    stale = entries.remove(session_id).and_then(|entry| entry.socket);
                }
            }
        }

        if let Some(mut stale) = stale {
            debug!(session_id, "evicting closed websocket");
            stale.close(CLOSE_NORMAL, "done").await;
        }

        let socket = self.connect(url, headers, cancel).await?;
        if busy {
            debug!(session_id, "pooled websocket busy, using a dedicated socket");
            return Ok(WsLease::new(self.clone(), socket, None));
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        {
            let mut entries = lock_unpoisoned(&self.entries);
            if entries.contains_key(session_id) {
                return Ok(WsLease::new(self.clone(), socket, None));
            }
            entries.insert(
                session_id.to_owned(),
                PoolEntry {
                    socket: None,
                    busy: true,
                    generation,
                    expiry: None,
                },
            );
        }
        debug!(session_id, "opened pooled websocket");
        Ok(WsLease::new(
            self.clone(),
            socket,
            Some((session_id.to_owned(), generation)),
        ))
    }

    /// Closes every idle socket and forgets all sessions.
    pub async fn close_all(&self) {
        let drained: Vec<PoolEntry> = lock_unpoisoned(&self.entries)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for mut entry in drained {
            if let Some(expiry) = entry.expiry.take() {
                expiry.abort();
            }
            if let Some(mut socket) = entry.socket.take() {
                socket.close(CLOSE_NORMAL, "done").await;
            }
        }
    }

    async fn connect(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        cancel: Option<&CancelSignal>,
    ) -> Result<Box<dyn WsConnection>, TransportError> {
        await_or_cancel(self.connector.connect(url, headers), cancel).await?
    }

    fn evict(&self, session_id: &str, generation: u64) {
        let mut entries = lock_unpoisoned(&self.entries);
        if entries
            .get(session_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            if let Some(expiry) = entries.remove(session_id).and_then(|entry| entry.expiry) {
                expiry.abort();
            }
            debug!(session_id, "evicted pooled websocket");
        }
    }

    /// Returns the socket to its entry, or hands it back when the entry is gone.
    fn check_in(
        &self,
        session_id: &str,
        generation: u64,
        socket: Box<dyn WsConnection>,
    ) -> Option<Box<dyn WsConnection>> {
        let mut entries = lock_unpoisoned(&self.entries);
        match entries.get_mut(session_id) {
            Some(entry) if entry.generation == generation => {
                entry.socket = Some(socket);
                entry.busy = false;
                entry.expiry = Some(self.schedule_expiry(session_id.to_owned(), generation));
                None
            }
            _ => Some(socket),
        }
    }

    fn schedule_expiry(&self, session_id: String, generation: u64) -> JoinHandle<()> {
        let entries = Arc::clone(&self.entries);
        let ttl = self.idle_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let socket = {
                let mut entries = lock_unpoisoned(&entries);
                let expired = entries
                    .get(&session_id)
                    .is_some_and(|entry| entry.generation == generation && !entry.busy);
                if expired {
                    entries.remove(&session_id).and_then(|entry| entry.socket)
                } else {
                    None
                }
            };
            if let Some(mut socket) = socket {
                debug!(session_id = %session_id, "closing idle websocket");
                socket.close(CLOSE_NORMAL, "idle_timeout").await;
            }
        })
    }
}

/// Exclusive use of one socket. Dropping a lease without releasing it evicts the socket.
pub struct WsLease {
    pool: WebSocketPool,
    socket: Option<Box<dyn WsConnection>>,
    slot: Option<(String, u64)>,
}

impl fmt::Debug for WsLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsLease")
            .field("slot", &self.slot)
            .field("released", &self.socket.is_none())
            .finish()
    }
}

impl WsLease {
    fn new(pool: WebSocketPool, socket: Box<dyn WsConnection>, slot: Option<(String, u64)>) -> Self {
        Self {
            pool,
            socket: Some(socket),
            slot,
        }
    }

    /// True when the socket belongs to the session cache.
    pub fn is_pooled(&self) -> bool {
        self.slot.is_some()
    }

    pub async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.socket_mut()?.send_text(text).await
    }

    pub async fn recv(&mut self) -> Result<WsIncoming, TransportError> {
        self.socket_mut()?.recv().await
    }

    /// Returns the socket to the pool when `keep` is set and it is still open; closes it otherwise.
    pub async fn release(mut self, keep: bool) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        match self.slot.take() {
            Some((session_id, generation)) if keep && socket.is_open() => {
                if let Some(mut orphan) = self.pool.check_in(&session_id, generation, socket) {
                    orphan.close(CLOSE_NORMAL, "done").await;
                }
            }
            Some((session_id, generation)) => {
                self.pool.evict(&session_id, generation);
                socket.close(CLOSE_NORMAL, "done").await;
            }
            None => socket.close(CLOSE_NORMAL, "done").await,
        }
    }

    /// Closes with the abort code and evicts the socket.
    pub async fn abort(mut self) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        if let Some((session_id, generation)) = self.slot.take() {
            self.pool.evict(&session_id, generation);
        }
        socket.close(CLOSE_ABORTED, "aborted").await;
    }

    fn socket_mut(&mut self) -> Result<&mut Box<dyn WsConnection>, TransportError> {
        self.socket
            .as_mut()
            .ok_or_else(|| TransportError::WebSocket("socket already released".to_owned()))
    }
}

impl Drop for WsLease {
    fn drop(&mut self) {
        if self.socket.take().is_none() {
            return;
        }
        if let Some((session_id, generation)) = self.slot.take() {
            warn!(session_id = %session_id, "websocket lease dropped without release");
            self.pool.evict(&session_id, generation);
        }
    }
}

/// Maps an HTTP(S) endpoint to its WebSocket equivalent.
pub fn websocket_url(url: &str) -> Result<String, TransportError> {
    let mut parsed = url::Url::parse(url)
        .map_err(|error| TransportError::InvalidRequest(format!("{url}: {error}")))?;
    let scheme = match parsed.scheme() {
        "https" => "wss",
        "http" => "ws",
        "wss" | "ws" => return Ok(parsed.to_string()),
        other => {
            return Err(TransportError::InvalidRequest(format!(
                "unsupported WebSocket scheme: {other}"
            )))
        }
    };
    parsed
        .set_scheme(scheme)
        .map_err(|()| TransportError::InvalidRequest(format!("cannot convert {url} to {scheme}")))?;
    Ok(parsed.to_string())
}

/// Streams `response.create` requests over pooled sockets.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    pool: WebSocketPool,
    header_overrides: BTreeMap<String, String>,
}

impl WebSocketTransport {
    pub fn new(pool: WebSocketPool) -> Self {
        Self {
            pool,
            header_overrides: BTreeMap::new(),
        }
    }

    /// Header that replaces any same-named request header (ASCII case-insensitive) on the handshake.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header_overrides.insert(key.into(), value.into());
        self
    }

    pub fn pool(&self) -> &WebSocketPool {
        &self.pool
    }

    fn handshake_headers(&self, request: &TransportRequest) -> BTreeMap<String, String> {
        let mut headers = request.headers.clone();
        for (key, value) in &self.header_overrides {
            headers.retain(|name, _| !name.eq_ignore_ascii_case(key));
            headers.insert(key.clone(), value.clone());
        }
        headers
    }
}

#[async_trait]
impl EventTransport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn stream(
        &self,
        request: &TransportRequest,
        cancel: Option<&CancelSignal>,
        on_event: &mut EventHandler<'_>,
    ) -> Result<(), TransportError> {
        let url = websocket_url(&request.url)?;
        let headers = self.handshake_headers(request);
        let mut lease = self
            .pool
            .acquire(&url, &headers, request.session_id.as_deref(), cancel)
            .await?;

        let result = exchange(&mut lease, &request.body, cancel, on_event).await;
        match &result {
            Ok(()) => lease.release(true).await,
            Err(TransportError::Cancelled) => lease.abort().await,
            Err(_) => lease.release(false).await,
        }
        result
    }
}

async fn exchange(
    lease: &mut WsLease,
    body: &Value,
    cancel: Option<&CancelSignal>,
    on_event: &mut EventHandler<'_>,
) -> Result<(), TransportError> {
    lease.send_text(create_payload(body).to_string()).await?;

    loop {
        match await_or_cancel(lease.recv(), cancel).await?? {
            WsIncoming::Text(text) => {
                let Ok(event) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                let completed = event
                    .get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|kind| COMPLETION_EVENTS.contains(&kind));
                on_event(event)?;
                if completed {
                    return Ok(());
                }
            }
            WsIncoming::Closed { code, reason } => {
                let detail = match code {
                    Some(code) if reason.is_empty() => format!(" (code {code})"),
                    Some(code) => format!(" (code {code}: {reason})"),
                    None => String::new(),
                };
                return Err(TransportError::WebSocketClosed(format!(
                    "WebSocket stream closed before response.completed{detail}"
                )));
            }
        }
    }
}

/// `{"type":"response.create", ...body}` unless the body already names its type.
fn create_payload(body: &Value) -> Value {
    match body {
        Value::Object(fields) if !fields.contains_key("type") => {
            let mut payload = serde_json::Map::with_capacity(fields.len() + 1);
            payload.insert("type".to_owned(), Value::String("response.create".to_owned()));
            payload.extend(fields.clone());
            Value::Object(payload)
        }
        other => other.clone(),
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
