//! HTTP ingress and the consumer WebSocket endpoint.
//!
//! `POST /messages` accepts producer submissions: the text is run through the
//! optional transform collaborator, persisted, and — when the recipient has a
//! live connection — pushed asynchronously through that identity's delivery
//! sequence. The assigned id is returned immediately; delivery is not
//! guaranteed complete when the call returns. A store failure is the only
//! condition surfaced to the producer as an error.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::delivery::DeliveryEngine;
use crate::registry::ConnectionRegistry;
use crate::session;
use crate::store::MessageStore;
use crate::transform::TextTransformer;

#[derive(Clone)]
pub struct AppState {
    pub store: MessageStore,
    pub registry: ConnectionRegistry,
    pub engine: DeliveryEngine,
    pub transformer: Option<TextTransformer>,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

pub fn router(state: AppState) -> axum::Router {
    use axum::routing;

    axum::Router::new()
        .route("/health", routing::get(health))
        .route("/messages", routing::post(submit_message))
        .route("/ws/{identity}", routing::get(consumer_ws))
        .with_state(state)
}

async fn health() -> axum::Json<Value> {
    axum::Json(json!({
        "status": "ok",
        "service": "message-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub recipient: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

async fn submit_message(
    axum::extract::State(state): axum::extract::State<AppState>,
    axum::Json(request): axum::Json<SubmitRequest>,
) -> (axum::http::StatusCode, axum::Json<Value>) {
    let recipient = request.recipient.trim().to_string();
    if recipient.is_empty() || request.text.is_empty() {
        return (
            axum::http::StatusCode::BAD_REQUEST,
            axum::Json(json!({
                "success": false,
                "error": "Missing required fields: recipient, text",
            })),
        );
    }

    let mut metadata = request.metadata;
    let mut processed_text = None;
    if let Some(transformer) = &state.transformer {
        match transformer.transform(&request.text).await {
            Ok(out) => {
                if let Some(date) = out.date {
                    match metadata.get_or_insert_with(|| json!({})) {
                        Value::Object(object) => {
                            object.insert("date".to_string(), json!(date));
                        }
                        // non-object producer metadata is preserved under its
                        // own key so the extracted date still survives
                        other => {
                            *other = json!({"producer_metadata": other.clone(), "date": date});
                        }
                    }
                }
                processed_text = Some(out.text);
            }
            Err(error) => {
                // collaborator failure never blocks delivery: the raw text is
                // stored verbatim
                tracing::warn!(recipient = %recipient, error = %error, "text transform failed, storing raw text");
            }
        }
    }

    let id = match state.store.append(
        &recipient,
        &request.text,
        processed_text.as_deref(),
        metadata.as_ref(),
    ) {
        Ok(id) => id,
        Err(error) => {
            tracing::error!(recipient = %recipient, error = %error, "failed to persist message");
            return (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({
                    "success": false,
                    "error": format!("store unavailable: {error}"),
                })),
            );
        }
    };
    tracing::info!(recipient = %recipient, message_id = id, "message accepted");

    // immediate push when the recipient is online; an offline recipient is
    // not an error, the message waits for the next connect
    if state.registry.lookup(&recipient).is_some() {
        match state.store.get(id) {
            Ok(Some(message)) => {
                let engine = state.engine.clone();
                tokio::spawn(async move { engine.push(message).await });
            }
            Ok(None) => {}
            Err(error) => {
                tracing::error!(recipient = %recipient, message_id = id, error = %error, "failed to reload message for push");
            }
        }
    }

    (
        axum::http::StatusCode::OK,
        axum::Json(json!({ "success": true, "id": id })),
    )
}

async fn consumer_ws(
    ws: axum::extract::WebSocketUpgrade,
    axum::extract::Path(identity): axum::extract::Path<String>,
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| session::run(socket, identity, state))
}
