//! HTTP/WebSocket server for the watch daemon.
//!
//! The server:
//! - Accepts WebSocket upgrades on `/ws`, one watcher per connection
//! - Bounds open connections with an [`AdmissionController`]
//! - Reports capacity and active watchers on `/health`
//! - Shuts down every connection when the quit token is cancelled
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   WatchServer   │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ GET /ws
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │   ws_handler    │────▶│ WatcherRegistry │
//! │ origin → admit  │     │                 │
//! │ → start session │     └─────────────────┘
//! └───────┬─────────┘
//!         │ on_upgrade
//!         ▼
//! ┌─────────────────┐
//! │ConnectionHandler│
//! │  (per client)   │
//! └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Every rejected request gives its slot back and stops its session

mod close;
mod connection;
mod origin;
mod shutdown;

pub use close::{Closure, Direction};
pub use connection::{ConnectionHandler, ConnectionOutcome};
pub use origin::{OriginError, OriginPolicy};
pub use shutdown::{CoordinatorState, ShutdownCoordinator, TerminationSignal};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use watch_core::WatcherId;

use crate::admission::AdmissionController;
use crate::config::{ConfigError, ServerConfig};
use crate::registry::{WatcherEntry, WatcherRegistry};
use crate::session::{Session, SessionFactory};

/// State shared by every request handler.
pub struct ServerContext<F: SessionFactory> {
    config: ServerConfig,
    admission: AdmissionController,
    quit: CancellationToken,
    registry: Arc<WatcherRegistry>,
    factory: F,
    origins: OriginPolicy,
    connection_counter: AtomicU64,
    /// Upgraded connections that have not finished teardown.
    connections: TaskTracker,
}

impl<F: SessionFactory> ServerContext<F> {
    fn new(config: ServerConfig, factory: F, quit: CancellationToken) -> Self {
        Self {
            admission: AdmissionController::new(config.max_connections),
            origins: OriginPolicy::new(config.allowed_origins.iter().cloned()),
            registry: Arc::new(WatcherRegistry::new()),
            connection_counter: AtomicU64::new(0),
            connections: TaskTracker::new(),
            config,
            factory,
            quit,
        }
    }

    /// Identity for the next admitted connection: `watcher-1`, `watcher-2`, ...
    fn next_watcher_id(&self) -> WatcherId {
        let n = self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1;
        WatcherId::from_connection(n)
    }
}

/// WebSocket server bridging sessions to clients.
pub struct WatchServer<F: SessionFactory> {
    context: Arc<ServerContext<F>>,
}

impl<F: SessionFactory> WatchServer<F> {
    /// Creates a new server.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated server configuration
    /// * `factory` - Builds one session per admitted connection
    /// * `quit` - Process-wide quit signal
    pub fn new(config: ServerConfig, factory: F, quit: CancellationToken) -> Self {
        Self {
            context: Arc::new(ServerContext::new(config, factory, quit)),
        }
    }

    /// Routes served by this server.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler::<F>))
            .route("/health", get(health_handler::<F>))
            .with_state(Arc::clone(&self.context))
    }

    /// Admission controller shared by all connections.
    pub fn admission(&self) -> AdmissionController {
        self.context.admission.clone()
    }

    /// Registry of watchers bound to open connections.
    pub fn registry(&self) -> Arc<WatcherRegistry> {
        Arc::clone(&self.context.registry)
    }

    /// Binds the configured address and serves until quit.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.context.config.bind;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr,
                error: e.to_string(),
            })?;
        self.run_with_listener(listener).await
    }

    /// Serves on an already bound listener until quit.
    ///
    /// Returns once the quit token is cancelled and every connection has
    /// finished its teardown.
    pub async fn run_with_listener(self, listener: TcpListener) -> Result<(), ServerError> {
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::Serve(e.to_string()))?;
        info!(
            addr = %addr,
            max_connections = self.context.admission.capacity(),
            "Watch server listening"
        );

        let quit = self.context.quit.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(quit.cancelled_owned())
            .await
            .map_err(|e| ServerError::Serve(e.to_string()))?;

        // Upgraded sockets outlive the HTTP connections serve waits for.
        let connections = &self.context.connections;
        connections.close();
        if !connections.is_empty() {
            info!(open = connections.len(), "Waiting for connections to close");
        }
        connections.wait().await;

        info!("Watch server stopped");
        Ok(())
    }
}

/// Upgrades `/ws` requests into watched connections.
///
/// Checks run in order: origin (403), admission (503 once quitting),
/// session start (500), upgrade (500). A request rejected after admission
/// gives its slot back and stops its session before responding.
async fn ws_handler<F: SessionFactory>(
    State(ctx): State<Arc<ServerContext<F>>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // Held until teardown finishes, or dropped with the handler on rejection.
    let tracked = ctx.connections.token();

    if let Err(e) = ctx.origins.check(&headers) {
        warn!(error = %e, "Rejected WebSocket request");
        return (StatusCode::FORBIDDEN, e.to_string()).into_response();
    }

    let slot = match ctx.admission.acquire(&ctx.quit).await {
        Ok(slot) => slot,
        Err(e) => {
            debug!(error = %e, "Admission refused");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    let watcher_id = ctx.next_watcher_id();
    let mut session = ctx.factory.create(watcher_id.clone());
    if let Err(e) = session.start().await {
        error!(watcher_id = %watcher_id, error = %e, "Failed to start session");
        session.stop();
        slot.release();
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    if !ctx.registry.add(watcher_id.clone()) {
        warn!(watcher_id = %watcher_id, "Watcher already registered");
    }

    let handler = ConnectionHandler::new(session, slot, ctx.quit.clone())
        .with_registry(Arc::clone(&ctx.registry))
        .with_close_timeout(ctx.config.close_timeout());

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(watcher_id = %watcher_id, error = %rejection, "WebSocket upgrade rejected");
            drop(handler);
            return (StatusCode::INTERNAL_SERVER_ERROR, rejection.body_text()).into_response();
        }
    };

    let failed_id = watcher_id.clone();
    ws.on_failed_upgrade(move |e| {
        warn!(watcher_id = %failed_id, error = %e, "WebSocket upgrade failed");
    })
    .on_upgrade(move |socket| async move {
        let _tracked = tracked;
        let (sink, stream) = socket.split();
        let outcome = handler.run(stream, sink).await;
        debug!(
            watcher_id = %outcome.watcher_id,
            cause = %outcome.cause,
            events_sent = outcome.events_sent,
            commands_applied = outcome.commands_applied,
            soft_errors = outcome.soft_errors,
            "Connection finished"
        );
    })
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub capacity: usize,
    pub active_connections: usize,
    pub watchers: Vec<WatcherEntry>,
}

async fn health_handler<F: SessionFactory>(
    State(ctx): State<Arc<ServerContext<F>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        capacity: ctx.admission.capacity(),
        active_connections: ctx.admission.in_use(),
        watchers: ctx.registry.snapshot(),
    })
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("Server error: {0}")]
    Serve(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
