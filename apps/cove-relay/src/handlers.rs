use axum::{extract::State, response::Json, routing::get, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::storage::RoomStore;
use crate::websocket::{websocket_handler, SignalingState};

#[derive(Clone)]
pub struct HealthState {
    started_at: Instant,
    store: Arc<dyn RoomStore>,
}

impl HealthState {
    pub fn new(store: Arc<dyn RoomStore>) -> Self {
        Self {
            started_at: Instant::now(),
            store,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    uptime_seconds: u64,
    backend: &'static str,
    store: &'static str,
}

/// GET /health - process uptime and backing-store connectivity.
pub async fn health_check(State(state): State<HealthState>) -> Json<HealthStatus> {
    let connected = state.store.ping().await;
    Json(HealthStatus {
        status: "ok",
        uptime_seconds: state.started_at.elapsed().as_secs(),
        backend: state.store.backend_name(),
        store: if connected { "connected" } else { "disconnected" },
    })
}

/// The full route table. The two route groups carry different state.
pub fn router(signaling: SignalingState, health: HealthState) -> Router {
    let http_routes = Router::new()
        .route("/health", get(health_check))
        .with_state(health);
    let ws_routes = Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(signaling);

    Router::new()
        .merge(http_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
