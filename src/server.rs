//! WebSocket server the browser extension connects to.
//!
//! Serves the extension endpoint at `/` and a `/health` endpoint. Each upgraded
//! socket runs its own handler task (see [`crate::handler`]); `stop()`
//! cancels them all, fails whatever requests are still pending, and clears
//! the registry.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::correlator::RequestCorrelator;
use crate::error::BridgeError;
use crate::handler;
use crate::pending::PendingTable;
use crate::registry::{ConnectionId, ConnectionRegistry};

/// Maximum concurrent extension connections.
///
/// Only one connection is ever active; the rest are failover candidates.
/// The cap keeps a misbehaving client from exhausting the server.
const MAX_CONNECTIONS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Lifecycle {
    state: ServerState,
    local_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    handlers: TaskTracker,
    serve_task: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct AppState {
    registry: ConnectionRegistry,
    pending: PendingTable,
    cancel: CancellationToken,
    handlers: TaskTracker,
    /// One permit per connection, held from upgrade until the handler exits.
    slots: Arc<Semaphore>,
}

pub struct BridgeServer {
    config: ServerConfig,
    registry: ConnectionRegistry,
    pending: PendingTable,
    correlator: Arc<RequestCorrelator>,
    lifecycle: Mutex<Lifecycle>,
}

impl BridgeServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = ConnectionRegistry::new();
        let pending = PendingTable::new();
        let correlator = Arc::new(RequestCorrelator::new(registry.clone(), pending.clone()));
        Self {
            config,
            registry,
            pending,
            correlator,
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::Stopped,
                local_addr: None,
                cancel: CancellationToken::new(),
                handlers: TaskTracker::new(),
                serve_task: None,
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle.lock().state
    }

    /// Address actually bound, while running. Differs from the configured
    /// port when that port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().local_addr
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Calling this while the server is not stopped is a no-op.
    pub async fn start(&self) -> Result<(), BridgeError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ServerState::Stopped {
                tracing::warn!(
                    state = ?lifecycle.state,
                    "start requested while not stopped, ignoring"
                );
                return Ok(());
            }
            lifecycle.state = ServerState::Starting;
        }

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                self.lifecycle.lock().state = ServerState::Stopped;
                tracing::error!(error = %e, "failed to start bridge server");
                return Err(e);
            }
        };
        let local_addr = listener.local_addr().ok();

        let cancel = CancellationToken::new();
        let handlers = TaskTracker::new();
        let app = router(AppState {
            registry: self.registry.clone(),
            pending: self.pending.clone(),
            cancel: cancel.clone(),
            handlers: handlers.clone(),
            slots: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        });

        let shutdown = cancel.clone();
        let serve_task = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "accept loop failed");
            }
        });

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = ServerState::Running;
            lifecycle.local_addr = local_addr;
            lifecycle.cancel = cancel;
            lifecycle.handlers = handlers;
            lifecycle.serve_task = Some(serve_task);
        }

        tracing::info!(addr = ?local_addr, "bridge server listening");
        Ok(())
    }

    async fn bind(&self) -> Result<TcpListener, BridgeError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|source| BridgeError::Bind { addr, source })
    }

    /// Stop accepting, close every connection and fail every pending request.
    ///
    /// Calling this while the server is not running is a no-op.
    pub async fn stop(&self) {
        let (cancel, handlers, serve_task) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ServerState::Running {
                tracing::warn!(
                    state = ?lifecycle.state,
                    "stop requested while not running, ignoring"
                );
                return;
            }
            lifecycle.state = ServerState::Stopping;
            (
                lifecycle.cancel.clone(),
                lifecycle.handlers.clone(),
                lifecycle.serve_task.take(),
            )
        };

        tracing::info!("bridge server stopping");
        let grace = self.config.shutdown_timeout();

        cancel.cancel();
        handlers.close();
        if tokio::time::timeout(grace, handlers.wait()).await.is_err() {
            tracing::warn!(
                remaining = handlers.len(),
                "connection handlers did not stop in time, abandoning them"
            );
        }

        if let Some(mut task) = serve_task {
            match tokio::time::timeout(grace, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "accept loop task failed"),
                Err(_) => {
                    tracing::warn!("accept loop did not stop in time, aborting it");
                    task.abort();
                }
            }
        }

        let failed = self.pending.fail_all(BridgeError::shutting_down);
        let connections = self.registry.drain();
        for connection in &connections {
            connection.close();
        }

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = ServerState::Stopped;
            lifecycle.local_addr = None;
        }
        tracing::info!(
            failed_requests = failed,
            closed_connections = connections.len(),
            "bridge server stopped"
        );
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(extension_ws))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn extension_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let Ok(permit) = Arc::clone(&state.slots).try_acquire_owned() else {
        tracing::warn!(peer = %peer, "connection limit reached, rejecting extension");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    let cancel = state.cancel.child_token();
    let handlers = state.handlers.clone();
    ws.on_upgrade(move |socket| {
        handlers.track_future(async move {
            handler::run_connection(socket, Some(peer), state.registry, state.pending, cancel)
                .await;
            drop(permit);
        })
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    active: Option<ConnectionId>,
    pending_requests: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.registry.len(),
        active: state.registry.active_id(),
        pending_requests: state.pending.len(),
    })
}
