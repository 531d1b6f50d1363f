//! Wire events for the consumer WebSocket transport.
//!
//! Server→client: `new_message`, `ping`. Client→server: `confirm`, `pong`.
//! Unrecognized client event types deserialize to [`ClientEvent::Unknown`]
//! and are logged and ignored, never fatal to the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events pushed from the relay to a connected consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        id: i64,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        created_at: String,
    },
    Ping,
}

/// Events received from a consumer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Confirm {
        id: i64,
    },
    Pong,
    #[serde(other)]
    Unknown,
}
