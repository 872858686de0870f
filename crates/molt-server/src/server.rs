//! `GatewayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use chrono::{DateTime, Utc};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use molt_core::ConnectionId;
use molt_stream::EventSource;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_CONNECTIONS_REJECTED_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::connection::ClientConnection;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::{SessionContext, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    session: SessionContext,
    start_time: Instant,
    started_at: DateTime<Utc>,
    metrics_handle: PrometheusHandle,
}

/// The event gateway server.
pub struct GatewayServer {
    config: Arc<ServerConfig>,
    source: Arc<dyn EventSource>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    started_at: DateTime<Utc>,
    metrics_handle: PrometheusHandle,
}

impl GatewayServer {
    /// Create a new server reading chat streams from `source`.
    pub fn new(
        config: ServerConfig,
        source: Arc<dyn EventSource>,
        metrics_handle: PrometheusHandle,
    ) -> Self {
        Self {
            config: Arc::new(config),
            source,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            started_at: Utc::now(),
            metrics_handle,
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
            session: SessionContext {
                source: Arc::clone(&self.source),
                registry: Arc::clone(&self.registry),
                shutdown: self.shutdown.token(),
                heartbeat: self.config.heartbeat(),
            },
            start_time: self.start_time,
            started_at: self.started_at,
            metrics_handle: self.metrics_handle.clone(),
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind and serve in a background task.
    ///
    /// Returns the bound address and the serving task, which exits once
    /// shutdown is initiated.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(error) = serve.await {
                error!(%error, "server error");
            }
        });
        info!(%addr, max_connections = self.config.max_connections, "gateway listening");
        Ok((addr, handle))
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /ws
///
/// Admission is decided before the upgrade: a shutting-down or full server
/// answers 503 instead of switching protocols.
async fn ws_handler(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let Some(slot) = state.registry.try_reserve(state.config.max_connections) else {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!(max_connections = state.config.max_connections, "connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    let capacity = state.config.outbound_queue_capacity;
    let session = state.session;
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let connection = Arc::new(ClientConnection::new(ConnectionId::new(), capacity));
            run_ws_session(socket, connection, session).await;
            drop(slot);
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.registry.connection_count().await;
    let subscriptions = state.registry.subscription_count().await;
    Json(health::health_check(
        state.start_time,
        state.started_at,
        connections,
        subscriptions,
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::render(&state.metrics_handle),
    )
}
