//! WebAPI - HTTP and WebSocket Endpoints
//!
//! ## Responsibilities
//!
//! - Frame ingestion websocket
//! - Health / status endpoints
//! - Audit ledger lookup and one-shot recognition

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let ledger_ok = state.ledger.is_healthy().await;

    let response = HealthResponse {
        status: if ledger_ok { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.started_at.elapsed().as_secs(),
        dispatch_mode: state.dispatcher.mode().to_string(),
        ledger_ok,
    };

    Json(response)
}

/// Pipeline status endpoint
pub async fn service_status(State(state): State<AppState>) -> impl IntoResponse {
    let correlator = state.correlator.stats().await;
    let queue_depth = state.dispatcher.queue_depth().await;

    Json(json!({
        "dispatch_mode": state.dispatcher.mode(),
        "worker_pool_size": state.config.worker_pool_size,
        "recognize_permits_available": state.recognize_permits.available_permits(),
        "connections": correlator.connections,
        "pending_deliveries": correlator.pending,
        "delivered": correlator.delivered,
        "dropped": correlator.dropped,
        "queue_depth": queue_depth,
        "ledger_path": state.ledger.path().display().to_string(),
    }))
}
