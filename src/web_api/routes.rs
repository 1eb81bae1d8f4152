//! API Routes

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Multipart, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Instant;

use crate::audit_ledger::{AuditQuery, AuditRecord};
use crate::dispatcher::recognize_isolated;
use crate::error::{Error, Result};
use crate::gateway::envelope::error_envelope;
use crate::gateway::FrameSession;
use crate::models::{ApiResponse, FailureKind, FrameTask};
use crate::state::AppState;

/// Upload limit for one-shot recognition
const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/healthz", get(super::health_check))
        .route("/api/status", get(super::service_status))
        // Frame ingestion
        .route("/ws", get(websocket_handler))
        .route("/api/ws", get(websocket_handler))
        // Audit ledger
        .route("/api/audit", get(list_audit_records))
        // One-shot recognition
        .route(
            "/api/recognize",
            post(recognize_upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .with_state(state)
}

// ========================================
// Audit
// ========================================

async fn list_audit_records(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<ApiResponse<Vec<AuditRecord>>>> {
    let records = state.ledger.query(&query).await?;
    Ok(Json(ApiResponse::success(records)))
}

// ========================================
// One-shot recognition
// ========================================

async fn recognize_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response> {
    let mut image: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(format!("Invalid multipart body: {}", e)))?
    {
        if field.name() == Some("image") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| Error::Validation(format!("Failed to read image: {}", e)))?;
            image = Some(bytes.to_vec());
        }
    }

    let image = image
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| Error::Validation("Missing image field".to_string()))?;

    let task = FrameTask {
        observer_id: "upload".to_string(),
        frame_id: format!("upload-{}", uuid::Uuid::new_v4().simple()),
        captured_at: Utc::now(),
        image,
    };

    let outcome = {
        let _permit = state
            .recognize_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("Recognition pool closed".to_string()))?;
        recognize_isolated(state.recognizer.clone(), task).await
    };

    if let Some(error) = &outcome.error {
        return Err(Error::Recognition(format!(
            "{}: {}",
            error.kind.label(),
            error.detail
        )));
    }

    let response = if outcome.found {
        (
            StatusCode::OK,
            Json(json!({
                "found": true,
                "person": outcome.person,
                "confidence": outcome.confidence,
            })),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "found": false,
                "message": outcome.message,
            })),
        )
    };

    Ok(response.into_response())
}

// ========================================
// WebSocket
// ========================================

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let (conn_id, mut deliveries) = state.correlator.register_connection().await;
    let mut session = FrameSession::new(
        conn_id,
        state.config.admission_policy(),
        state.dispatcher.clone(),
        state.correlator.clone(),
    );

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let reply = match incoming {
                    Some(Ok(Message::Text(text))) => session.on_message(&text, Instant::now()).await,
                    Some(Ok(Message::Binary(_))) => Some(
                        error_envelope(
                            None,
                            None,
                            FailureKind::InvalidFormat,
                            "Binary messages are not supported",
                        )
                        .to_string(),
                    ),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => None,
                    Some(Err(e)) => {
                        tracing::warn!(connection_id = %conn_id, error = %e, "WebSocket error");
                        break;
                    }
                };

                if let Some(reply) = reply {
                    if sender.send(Message::Text(reply)).await.is_err() {
                        break;
                    }
                }
            }
            Some(delivery) = deliveries.recv() => {
                session.on_delivery(&delivery.frame_id);
                if sender.send(Message::Text(delivery.envelope)).await.is_err() {
                    break;
                }
            }
        }
    }

    // In-flight tasks keep running and are still audited
    state.correlator.release_connection(&conn_id).await;
}
