#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod protocol;
pub mod router;

pub use router::{Session, SignalingRouter};

use crate::config::ServerConfig;
use crate::metrics::ServerMetrics;
use crate::room::RoomManager;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Largest accepted WebSocket frame
const MAX_MESSAGE_SIZE: usize = 65_536;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    router: SignalingRouter,
    metrics: ServerMetrics,
    metrics_token: Option<Arc<str>>,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    pub fn new(room_manager: Arc<RoomManager>, config: &ServerConfig) -> Self {
        info!("Max connections: {}", config.max_connections);
        Self {
            metrics: room_manager.metrics().clone(),
            router: SignalingRouter::new(room_manager),
            metrics_token: config.metrics_token.as_deref().map(Arc::from),
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.router.rooms();
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms.room_count(),
        "peers": rooms.total_peer_count(),
    }))
}

/// Prometheus text exposition, behind an optional bearer token
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = server.metrics_token.as_deref() {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if provided != Some(expected) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = server.router.rooms();
    let body = server
        .metrics
        .render_prometheus(rooms.room_count(), rooms.total_peer_count());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    // Non-blocking: over the limit is rejected, not queued
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.router, server.metrics, permit)
        })
}
