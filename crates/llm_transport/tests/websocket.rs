use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use llm_transport::websocket::{CLOSE_ABORTED, CLOSE_NORMAL, DEFAULT_IDLE_TTL};
use llm_transport::{
    EventHandler, EventTransport, FallbackTransport, TransportError, TransportRequest,
    WebSocketPool, WebSocketTransport, WsConnection, WsConnector, WsIncoming,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

#[derive(Default)]
struct FakeServer {
    connects: AtomicUsize,
    refuse: AtomicBool,
    scripts: Mutex<VecDeque<Vec<WsIncoming>>>,
    sent: Mutex<Vec<(usize, Value)>>,
    closes: Mutex<Vec<(usize, u16, String)>>,
}

impl FakeServer {
    fn script(&self, frames: Vec<WsIncoming>) {
        self.scripts.lock().expect("scripts").push_back(frames);
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn closes(&self) -> Vec<(usize, u16, String)> {
        self.closes.lock().expect("closes").clone()
    }

    fn sent(&self) -> Vec<(usize, Value)> {
        self.sent.lock().expect("sent").clone()
    }
}

struct FakeConnector(Arc<FakeServer>);

#[async_trait]
impl WsConnector for FakeConnector {
    async fn connect(
        &self,
        _url: &str,
        _headers: &BTreeMap<String, String>,
    ) -> Result<Box<dyn WsConnection>, TransportError> {
        if self.0.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::WebSocketConnect("connection refused".into()));
        }
        let id = self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSocket {
            id,
            server: Arc::clone(&self.0),
            inbox: VecDeque::new(),
            open: true,
        }))
    }
}

struct FakeSocket {
    id: usize,
    server: Arc<FakeServer>,
    inbox: VecDeque<WsIncoming>,
    open: bool,
}

#[async_trait]
impl WsConnection for FakeSocket {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let value: Value = serde_json::from_str(&text).expect("client sends JSON");
        self.server.sent.lock().expect("sent").push((self.id, value));
        if let Some(frames) = self.server.scripts.lock().expect("scripts").pop_front() {
            self.inbox.extend(frames);
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<WsIncoming, TransportError> {
        match self.inbox.pop_front() {
            Some(WsIncoming::Closed { code, reason }) => {
                self.open = false;
                Ok(WsIncoming::Closed { code, reason })
            }
            Some(frame) => Ok(frame),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        self.open = false;
        self.server
            .closes
            .lock()
            .expect("closes")
            .push((self.id, code, reason.to_owned()));
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

fn fake_pool() -> (Arc<FakeServer>, WebSocketPool) {
    let server = Arc::new(FakeServer::default());
    let pool = WebSocketPool::new(Arc::new(FakeConnector(Arc::clone(&server))));
    (server, pool)
}

fn text(value: Value) -> WsIncoming {
    WsIncoming::Text(value.to_string())
}

fn completed_script() -> Vec<WsIncoming> {
    vec![
        text(json!({"type": "response.output_text.delta", "delta": "hi"})),
        text(json!({"type": "response.completed", "response": {"status": "completed"}})),
    ]
}

fn request(session_id: Option<&str>) -> TransportRequest {
    TransportRequest::new("https://example.test/codex/responses", json!({"model": "m"}))
        .with_session_id(session_id.map(str::to_owned))
}

async fn collect(
    transport: &dyn EventTransport,
    request: &TransportRequest,
    cancel: Option<&Arc<AtomicBool>>,
) -> (Vec<Value>, Result<(), TransportError>) {
    let mut events = Vec::new();
    let mut handler = |event: Value| {
        events.push(event);
        Ok::<(), TransportError>(())
    };
    let result = transport
        .stream(request, cancel, &mut handler as &mut EventHandler<'_>)
        .await;
    (events, result)
}

#[tokio::test]
async fn repeated_acquire_release_reuses_the_same_socket() {
    let (server, pool) = fake_pool();
    let headers = BTreeMap::new();

    for _ in 0..3 {
        let lease = pool
            .acquire("wss://example.test", &headers, Some("session-1"), None)
            .await
            .expect("acquire");
        assert!(lease.is_pooled());
        lease.release(true).await;
    }

    assert_eq!(server.connects(), 1);
    assert_eq!(pool.session_busy("session-1"), Some(false));
    assert!(server.closes().is_empty());
}

#[tokio::test]
async fn busy_session_gets_a_dedicated_socket() {
    let (server, pool) = fake_pool();
    let headers = BTreeMap::new();

    let first = pool
        .acquire("wss://example.test", &headers, Some("s"), None)
        .await
        .expect("first");
    let second = pool
        .acquire("wss://example.test", &headers, Some("s"), None)
        .await
        .expect("second");

    assert!(first.is_pooled());
    assert!(!second.is_pooled());
    assert_eq!(server.connects(), 2);
    assert_eq!(pool.session_busy("s"), Some(true));

    second.release(true).await;
    assert_eq!(server.closes(), vec![(1, CLOSE_NORMAL, "done".to_owned())]);

    first.release(true).await;
    assert_eq!(pool.session_busy("s"), Some(false));
}

#[tokio::test(start_paused = true)]
async fn idle_socket_expires_after_ttl() {
    let (server, pool) = fake_pool();
    let headers = BTreeMap::new();

    let lease = pool
        .acquire("wss://example.test", &headers, Some("s"), None)
        .await
        .expect("acquire");
    lease.release(true).await;

    tokio::time::sleep(DEFAULT_IDLE_TTL - Duration::from_secs(1)).await;
    assert_eq!(pool.session_busy("s"), Some(false));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(pool.is_empty());
    assert_eq!(server.closes(), vec![(0, CLOSE_NORMAL, "idle_timeout".to_owned())]);
}

#[tokio::test(start_paused = true)]
async fn reacquiring_cancels_pending_expiry() {
    let (server, pool) = fake_pool();
    let pool = pool.with_idle_ttl(Duration::from_secs(10));
    let headers = BTreeMap::new();

    let lease = pool
        .acquire("wss://example.test", &headers, Some("s"), None)
        .await
        .expect("acquire");
    lease.release(true).await;

    tokio::time::sleep(Duration::from_secs(8)).await;
    let lease = pool
        .acquire("wss://example.test", &headers, Some("s"), None)
        .await
        .expect("reacquire");
    tokio::time::sleep(Duration::from_secs(8)).await;

    assert_eq!(pool.session_busy("s"), Some(true));
    lease.release(true).await;
    assert_eq!(server.connects(), 1);
    assert!(server.closes().is_empty());
}

#[tokio::test]
async fn dropped_lease_evicts_its_session() {
    let (_server, pool) = fake_pool();
    let headers = BTreeMap::new();

    let lease = pool
        .acquire("wss://example.test", &headers, Some("s"), None)
        .await
        .expect("acquire");
    drop(lease);

    assert!(pool.is_empty());
}

#[tokio::test]
async fn transport_streams_until_completion_and_returns_socket() {
    let (server, pool) = fake_pool();
    server.script(completed_script());
    let transport = WebSocketTransport::new(pool.clone());

    let (events, result) = collect(&transport, &request(Some("s")), None).await;

    result.expect("stream completes");
    assert_eq!(events.len(), 2);
    assert_eq!(pool.session_busy("s"), Some(false));
    let sent = server.sent();
    assert_eq!(sent[0].1["type"], "response.create");
    assert_eq!(sent[0].1["model"], "m");
}

#[tokio::test]
async fn close_before_completion_fails_and_evicts() {
    let (server, pool) = fake_pool();
    server.script(vec![
        text(json!({"type": "response.output_text.delta", "delta": "par"})),
        WsIncoming::Closed {
            code: Some(1006),
            reason: String::new(),
        },
    ]);
    let transport = WebSocketTransport::new(pool.clone());

    let (events, result) = collect(&transport, &request(Some("s")), None).await;

    assert_eq!(events.len(), 1);
    match result {
        Err(TransportError::WebSocketClosed(message)) => {
            assert_eq!(
                message,
                "WebSocket stream closed before response.completed (code 1006)"
            );
        }
        other => panic!("expected closed error, got {other:?}"),
    }
    assert_eq!(pool.session_busy("s"), None);
}

#[tokio::test(start_paused = true)]
async fn abort_closes_with_distinct_code_and_evicts() {
    let (server, pool) = fake_pool();
    let transport = WebSocketTransport::new(pool.clone());
    let cancel = Arc::new(AtomicBool::new(false));
    let trigger = Arc::clone(&cancel);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.store(true, Ordering::Release);
    });

    let (_, result) = collect(&transport, &request(Some("s")), Some(&cancel)).await;

    assert!(matches!(result, Err(TransportError::Cancelled)));
    assert_eq!(server.closes(), vec![(0, CLOSE_ABORTED, "aborted".to_owned())]);
    assert!(pool.is_empty());
}

#[tokio::test]
async fn calls_without_session_id_never_share_sockets() {
    let (server, pool) = fake_pool();
    server.script(completed_script());
    server.script(completed_script());
    let transport = WebSocketTransport::new(pool.clone());

    for _ in 0..2 {
        let (_, result) = collect(&transport, &request(None), None).await;
        result.expect("stream completes");
    }

    assert_eq!(server.connects(), 2);
    assert!(pool.is_empty());
    assert_eq!(server.closes().len(), 2);
}

struct StaticTransport {
    calls: AtomicUsize,
}

#[async_trait]
impl EventTransport for StaticTransport {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn stream(
        &self,
        _request: &TransportRequest,
        _cancel: Option<&Arc<AtomicBool>>,
        on_event: &mut EventHandler<'_>,
    ) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        on_event(json!({"type": "response.completed"}))
    }
}

#[tokio::test]
async fn fallback_only_when_socket_never_connected() {
    let (server, pool) = fake_pool();
    server.refuse.store(true, Ordering::SeqCst);
    let sse = Arc::new(StaticTransport {
        calls: AtomicUsize::new(0),
    });
    let auto = FallbackTransport::new(
        Arc::new(WebSocketTransport::new(pool.clone())),
        Arc::clone(&sse) as Arc<dyn EventTransport>,
    );

    let (events, result) = collect(&auto, &request(Some("s")), None).await;
    result.expect("fallback succeeds");
    assert_eq!(events, vec![json!({"type": "response.completed"})]);
    assert_eq!(sse.calls.load(Ordering::SeqCst), 1);

    server.refuse.store(false, Ordering::SeqCst);
    server.script(vec![WsIncoming::Closed {
        code: None,
        reason: String::new(),
    }]);
    let (_, result) = collect(&auto, &request(Some("s")), None).await;
    assert!(matches!(result, Err(TransportError::WebSocketClosed(_))));
    assert_eq!(sse.calls.load(Ordering::SeqCst), 1);
}
