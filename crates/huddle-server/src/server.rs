//! Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use huddle_settings::HuddleSettings;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::bridge::{BackendConnector, BridgePool};
use crate::errors::ServerError;
use crate::gateway::Gateway;
use crate::health::{self, HealthResponse};
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomIndex;
use crate::shutdown::ShutdownCoordinator;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session runner and the shared structures behind it.
    pub gateway: Gateway,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle backing `/metrics`, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
}

impl AppState {
    /// Build the registry, room index and bridge pool for `settings`.
    pub fn new(
        settings: &HuddleSettings,
        connector: Arc<dyn BackendConnector>,
        metrics: Option<PrometheusHandle>,
        shutdown: CancellationToken,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(settings.server.max_send_queue));
        let rooms = Arc::new(RoomIndex::new(Arc::clone(&registry)));
        let bridges = Arc::new(BridgePool::from_settings(connector, &settings.backend));
        Self {
            gateway: Gateway::new(registry, rooms, bridges, settings, shutdown),
            start_time: Instant::now(),
            metrics,
            max_message_size: settings.server.max_message_size,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws/{client_id}/{room_id}", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and serve until the returned handle is shut down.
pub async fn start(
    settings: &HuddleSettings,
    connector: Arc<dyn BackendConnector>,
    metrics: Option<PrometheusHandle>,
) -> Result<ServerHandle, ServerError> {
    let host = settings.server.host.as_str();
    let port = settings.server.port;
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .map_err(|source| ServerError::Bind {
            addr: format!("{host}:{port}"),
            source,
        })?;
    let addr = listener.local_addr()?;

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let state = AppState::new(settings, connector, metrics, shutdown.token());
    let gateway = state.gateway.clone();
    let router = build_router(state);

    let token = shutdown.token();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "server terminated with error");
        }
    });

    info!(%addr, backend = %settings.backend.url, "huddle gateway listening");

    Ok(ServerHandle {
        addr,
        gateway,
        shutdown,
        shutdown_timeout: settings.server.shutdown_timeout(),
        server,
    })
}

/// Handle returned by [`start`]; keeps the server task alive.
pub struct ServerHandle {
    addr: SocketAddr,
    gateway: Gateway,
    shutdown: Arc<ShutdownCoordinator>,
    shutdown_timeout: Duration,
    server: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The running gateway.
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Stop accepting connections, close sessions and wait for the server
    /// task. Returns `false` if the drain timed out.
    pub async fn shutdown(self) -> bool {
        info!("shutting down huddle gateway");
        self.shutdown.drain(self.server, self.shutdown_timeout).await
    }
}

/// GET /
async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({ "message": "huddle signaling gateway is running" }))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let gateway = &state.gateway;
    Json(health::health_check(
        state.start_time,
        gateway.registry().count(),
        gateway.rooms().room_count(),
        gateway.bridges().bridge_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            huddle_telemetry::render(handle),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// GET /ws/{client_id}/{room_id}
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((client_id, room_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    let gateway = state.gateway.clone();
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            gateway.run_session(socket, client_id, room_id).await;
        })
}
