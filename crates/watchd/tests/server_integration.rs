//! Integration tests for the WebSocket server.
//!
//! These tests run a real `WatchServer` on a loopback port and talk to it
//! with a WebSocket client, covering event delivery, counter resets,
//! admission limits, origin checks, and process-wide shutdown.
//!
//! Tests CAN use `.unwrap()` and `.expect()`. We test the panic-free behavior
//! of production code through assertions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use watch_core::{CounterValue, WatcherId};
use watch_protocol::ControlMessage;
use watchd::admission::AdmissionController;
use watchd::config::ServerConfig;
use watchd::registry::WatcherRegistry;
use watchd::server::{ServerError, WatchServer};
use watchd::session::{Session, SessionError, SessionFactory};
use watchd::watcher::{Watcher, WatcherConfig, WatcherFactory};

// ============================================================================
// Constants
// ============================================================================

/// Tick interval for watchers under test
const TICK_MS: u64 = 20;

/// Maximum time to wait for any single step
const STEP_TIMEOUT: Duration = Duration::from_secs(3);

/// Interval between state polls
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long a slow session blocks in `stop`
const SLOW_STOP: Duration = Duration::from_millis(300);

// ============================================================================
// Test Helpers
// ============================================================================

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Test server context that manages server lifecycle.
struct TestServer {
    addr: SocketAddr,
    quit: CancellationToken,
    admission: AdmissionController,
    registry: Arc<WatcherRegistry>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn spawn(max_connections: usize) -> Self {
        Self::spawn_with(ServerConfig {
            max_connections,
            ..ServerConfig::default()
        })
        .await
    }

    async fn spawn_with(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let config = ServerConfig {
            bind: addr,
            tick_interval_ms: TICK_MS,
            ..config
        };

        let quit = CancellationToken::new();
        let factory = WatcherFactory::new(WatcherConfig::from(&config));
        let server = WatchServer::new(config, factory, quit.clone());
        let admission = server.admission();
        let registry = server.registry();
        let task = tokio::spawn(server.run_with_listener(listener));

        Self {
            addr,
            quit,
            admission,
            registry,
            task,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn connect(&self) -> Client {
        let (client, _response) = timeout(STEP_TIMEOUT, connect_async(self.url()))
            .await
            .expect("connect within timeout")
            .expect("connect to server");
        client
    }

    /// Polls until no connection holds a slot.
    async fn wait_idle(&self) {
        let start = Instant::now();
        while self.admission.in_use() > 0 || !self.registry.is_empty() {
            assert!(
                start.elapsed() < STEP_TIMEOUT,
                "connections still open: {}",
                self.admission.in_use()
            );
            sleep(POLL_INTERVAL).await;
        }
    }
}

/// Watcher whose cleanup blocks for [`SLOW_STOP`].
struct SlowStopWatcher(Watcher);

#[async_trait]
impl Session for SlowStopWatcher {
    type Event = CounterValue;

    fn id(&self) -> &WatcherId {
        self.0.id()
    }

    async fn start(&mut self) -> Result<(), SessionError> {
        self.0.start().await
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<CounterValue>> {
        self.0.take_events()
    }

    async fn reset_counter(&self) -> Result<(), SessionError> {
        self.0.reset_counter().await
    }

    fn stop(&self) {
        std::thread::sleep(SLOW_STOP);
        self.0.stop();
    }
}

struct SlowStopFactory(WatcherFactory);

impl SessionFactory for SlowStopFactory {
    type Session = SlowStopWatcher;

    fn create(&self, id: WatcherId) -> SlowStopWatcher {
        SlowStopWatcher(self.0.create(id))
    }
}

/// Reads the next counter event, skipping control frames.
async fn next_event(client: &mut Client) -> Value {
    loop {
        let message = timeout(STEP_TIMEOUT, client.next())
            .await
            .expect("event within timeout")
            .expect("stream open")
            .expect("valid frame");
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("json event"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Reads until the server's close frame and returns its code.
async fn close_code(client: &mut Client) -> Option<CloseCode> {
    loop {
        match timeout(STEP_TIMEOUT, client.next()).await.expect("close within timeout") {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| f.code),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

async fn send_text(client: &mut Client, text: &str) {
    client
        .send(Message::Text(text.to_string().into()))
        .await
        .expect("send");
}

// ============================================================================
// Event Delivery
// ============================================================================

#[tokio::test]
async fn test_events_arrive_in_order() {
    let server = TestServer::spawn(4).await;
    let mut client = server.connect().await;

    let first = next_event(&mut client).await;
    let watcher_id = first["watcher_id"].as_str().unwrap().to_string();
    assert!(watcher_id.starts_with("watcher-"));
    assert!(first["timestamp"].is_string());

    let mut last_iteration = first["iteration"].as_u64().unwrap();
    let mut last_value = first["value"].as_u64().unwrap();
    for _ in 0..5 {
        let event = next_event(&mut client).await;
        assert_eq!(event["watcher_id"], watcher_id.as_str());
        let iteration = event["iteration"].as_u64().unwrap();
        let value = event["value"].as_u64().unwrap();
        assert_eq!(iteration, last_iteration + 1);
        assert_eq!(value, last_value + 1);
        last_iteration = iteration;
        last_value = value;
    }

    client.close(None).await.unwrap();
    server.wait_idle().await;
}

#[tokio::test]
async fn test_each_connection_gets_own_watcher() {
    let server = TestServer::spawn(4).await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    let a_id = next_event(&mut a).await["watcher_id"].clone();
    let b_id = next_event(&mut b).await["watcher_id"].clone();
    assert_ne!(a_id, b_id);
    assert_eq!(server.registry.len(), 2);

    a.close(None).await.unwrap();
    b.close(None).await.unwrap();
    server.wait_idle().await;
}

// ============================================================================
// Control Messages
// ============================================================================

#[tokio::test]
async fn test_reset_counter_restarts_value() {
    let server = TestServer::spawn(4).await;
    let mut client = server.connect().await;

    let mut event = next_event(&mut client).await;
    while event["value"].as_u64().unwrap() < 3 {
        event = next_event(&mut client).await;
    }
    let iteration_before = event["iteration"].as_u64().unwrap();

    let reset = ControlMessage::reset_counter().encode().unwrap();
    send_text(&mut client, &reset).await;

    // Events already queued still carry the old values.
    let reset_event = loop {
        let event = next_event(&mut client).await;
        if event["value"].as_u64().unwrap() == 1 {
            break event;
        }
    };
    assert!(reset_event["iteration"].as_u64().unwrap() > iteration_before);

    client.close(None).await.unwrap();
    server.wait_idle().await;
}

#[tokio::test]
async fn test_malformed_input_keeps_connection_open() {
    let server = TestServer::spawn(4).await;
    let mut client = server.connect().await;

    send_text(&mut client, "not json").await;
    send_text(&mut client, r#"{"type":"launch_missiles"}"#).await;
    client
        .send(Message::Binary(vec![0xff, 0x00].into()))
        .await
        .unwrap();

    // Still receiving events afterwards
    let first = next_event(&mut client).await["iteration"].as_u64().unwrap();
    let second = next_event(&mut client).await["iteration"].as_u64().unwrap();
    assert!(second > first);
    assert_eq!(server.admission.in_use(), 1);

    client.close(None).await.unwrap();
    server.wait_idle().await;
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_admission_blocks_until_slot_frees() {
    let server = TestServer::spawn(2).await;

    let mut a = server.connect().await;
    let mut b = server.connect().await;
    next_event(&mut a).await;
    next_event(&mut b).await;
    assert_eq!(server.admission.in_use(), 2);

    let url = server.url();
    let pending = tokio::spawn(async move { connect_async(url).await });

    sleep(Duration::from_millis(200)).await;
    assert!(!pending.is_finished(), "third client admitted over capacity");
    assert_eq!(server.admission.in_use(), 2);
    assert_eq!(server.registry.len(), 2);

    a.close(None).await.unwrap();

    let (mut c, _) = timeout(STEP_TIMEOUT, pending)
        .await
        .expect("third client admitted after a slot freed")
        .unwrap()
        .expect("handshake succeeded");
    next_event(&mut c).await;
    assert!(server.admission.in_use() <= 2);
    assert_eq!(server.registry.len(), 2);

    b.close(None).await.unwrap();
    c.close(None).await.unwrap();
    server.wait_idle().await;
}

#[tokio::test]
async fn test_abrupt_disconnect_frees_slot() {
    let server = TestServer::spawn(1).await;

    let mut a = server.connect().await;
    next_event(&mut a).await;
    drop(a);
    server.wait_idle().await;

    let mut b = server.connect().await;
    next_event(&mut b).await;
    b.close(None).await.unwrap();
    server.wait_idle().await;
}

// ============================================================================
// Origin Checks
// ============================================================================

#[tokio::test]
async fn test_foreign_origin_rejected() {
    let server = TestServer::spawn(1).await;

    let mut request = server.url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", "http://evil.test".parse().unwrap());

    match connect_async(request).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 403),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("foreign origin was accepted"),
    }
    assert_eq!(server.admission.in_use(), 0);
}

#[tokio::test]
async fn test_allowed_origin_accepted() {
    let server = TestServer::spawn_with(ServerConfig {
        allowed_origins: vec!["http://app.test".to_string()],
        ..ServerConfig::default()
    })
    .await;

    let mut request = server.url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", "http://app.test".parse().unwrap());

    let (mut client, _) = connect_async(request).await.expect("allowed origin");
    next_event(&mut client).await;
    client.close(None).await.unwrap();
    server.wait_idle().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_quit_closes_all_connections() {
    let server = TestServer::spawn(4).await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;
    next_event(&mut a).await;
    next_event(&mut b).await;

    server.quit.cancel();

    assert_eq!(close_code(&mut a).await, Some(CloseCode::Away));
    assert_eq!(close_code(&mut b).await, Some(CloseCode::Away));
    server.wait_idle().await;

    let result = timeout(STEP_TIMEOUT, server.task)
        .await
        .expect("server stopped within timeout")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_returns_after_connection_teardown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let config = ServerConfig {
        bind: addr,
        tick_interval_ms: TICK_MS,
        ..ServerConfig::default()
    };

    let quit = CancellationToken::new();
    let factory = SlowStopFactory(WatcherFactory::new(WatcherConfig::from(&config)));
    let server = WatchServer::new(config, factory, quit.clone());
    let admission = server.admission();
    let registry = server.registry();
    let task = tokio::spawn(server.run_with_listener(listener));

    let (mut client, _) = timeout(STEP_TIMEOUT, connect_async(format!("ws://{addr}/ws")))
        .await
        .expect("connect within timeout")
        .expect("connect to server");
    next_event(&mut client).await;
    assert_eq!(admission.in_use(), 1);

    quit.cancel();
    let result = timeout(STEP_TIMEOUT, task)
        .await
        .expect("server stopped within timeout")
        .unwrap();
    assert!(result.is_ok());

    // No polling: the server only returns once teardown has run.
    assert_eq!(admission.in_use(), 0);
    assert!(registry.is_empty());
}
