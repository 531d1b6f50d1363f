//! Per-connection WebSocket session.
//!
//! Registers the connection (closing any replaced one), kicks off backlog
//! replay, pumps outbound events from the delivery engine onto the socket,
//! routes inbound `confirm`/`pong` frames, and drives the heartbeat state
//! machine. A protocol error, disconnect, or heartbeat timeout terminates
//! only this connection, never the relay.

use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};

use crate::api::AppState;
use crate::heartbeat::{Heartbeat, HeartbeatAction};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::registry::ConnectionHandle;

pub async fn run(mut socket: WebSocket, identity: String, state: AppState) {
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel::<ServerEvent>(64);
    let conn = ConnectionHandle::new(identity.clone(), outbound_tx);

    if let Some(replaced) = state.registry.register(conn.clone()) {
        tracing::info!(identity = %identity, "new connection replaces existing one");
        replaced.close();
    }
    tracing::info!(identity = %identity, epoch = %conn.epoch(), "consumer connected");

    // replay the unprocessed backlog; runs concurrently with this loop so the
    // outbound pump is live while the replay waits on acks
    {
        let engine = state.engine.clone();
        let identity = identity.clone();
        tokio::spawn(async move { engine.deliver_all(&identity).await });
    }

    let mut heartbeat = Heartbeat::new(state.ping_interval, state.ping_timeout, Instant::now());
    let mut evicted = false;

    loop {
        let deadline = tokio::time::Instant::from_std(heartbeat.deadline());
        tokio::select! {
            maybe_event = outbound_rx.recv() => {
                let Some(event) = maybe_event else { break };
                if !send_event(&mut socket, &event).await {
                    break;
                }
            }
            _ = conn.closed() => {
                // replaced by a newer connection for this identity
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            _ = tokio::time::sleep_until(deadline) => {
                match heartbeat.fire(Instant::now()) {
                    HeartbeatAction::SendPing => {
                        if !send_event(&mut socket, &ServerEvent::Ping).await {
                            break;
                        }
                    }
                    HeartbeatAction::Expired => {
                        tracing::warn!(identity = %identity, "heartbeat timeout, evicting connection");
                        state.registry.remove(&conn);
                        evicted = true;
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                    HeartbeatAction::Idle => {}
                }
            }
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&state, &identity, text.as_str(), &mut heartbeat);
                    }
                    // transport-level pongs count as liveness too
                    Some(Ok(Message::Pong(_))) => heartbeat.on_pong(Instant::now()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::warn!(identity = %identity, error = %error, "ws read error");
                        break;
                    }
                }
            }
        }
    }

    if !evicted {
        state.registry.remove(&conn);
    }
    tracing::info!(identity = %identity, "consumer disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(frame) => socket.send(Message::Text(frame.into())).await.is_ok(),
        Err(error) => {
            tracing::error!(error = %error, "failed to encode outbound event");
            true
        }
    }
}

fn handle_client_frame(state: &AppState, identity: &str, text: &str, heartbeat: &mut Heartbeat) {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(ClientEvent::Confirm { id }) => {
            if let Err(error) = state.engine.on_ack(identity, id) {
                tracing::error!(identity = %identity, message_id = id, error = %error, "confirm could not be applied");
            }
        }
        Ok(ClientEvent::Pong) => heartbeat.on_pong(Instant::now()),
        Ok(ClientEvent::Unknown) => {
            tracing::debug!(identity = %identity, raw = %text, "ignoring unrecognized event type");
        }
        Err(_) => {
            tracing::debug!(identity = %identity, raw = %text, "ignoring malformed frame");
        }
    }
}
