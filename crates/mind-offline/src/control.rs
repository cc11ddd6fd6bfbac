//! Worker control surface: page-to-worker messages and lifecycle events.

use crate::lifecycle::{LifecycleEvent, MessageOutcome};
use crate::proxy::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Accepts either the bare message (`skipWaiting`) or a JSON string
/// (`"skipWaiting"`), the shape `postMessage` payloads arrive in.
fn parse_message(body: &str) -> Option<String> {
    let body = body.trim();
    if body.starts_with('"') {
        serde_json::from_str::<String>(body).ok()
    } else {
        Some(body.to_string())
    }
}

/// POST /__sw/message
pub async fn message_handler(
    State(state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    let Some(message) = parse_message(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "message must be a string"})),
        );
    };

    match state.registration.post_message(&message).await {
        Ok(MessageOutcome::Unrecognized) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": format!("unknown message: {message}")})),
        ),
        Ok(outcome) => (StatusCode::OK, Json(serde_json::json!({"outcome": outcome}))),
        Err(e) => {
            tracing::error!(error = %e, "skipWaiting activation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}

/// GET /__sw/events: WebSocket stream of lifecycle events.
pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let rx = state.registration.subscribe();
    ws.on_upgrade(move |socket| handle_events_client(socket, rx))
}

async fn handle_events_client(mut socket: WebSocket, mut rx: broadcast::Receiver<LifecycleEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let json = match serde_json::to_string(&event) {
                    Ok(j) => j,
                    Err(_) => continue,
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "events client lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
