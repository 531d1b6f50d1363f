//! Reliable message-delivery relay.
//!
//! Producers submit messages over HTTP; the relay persists them in SQLite and
//! forwards them to at-most-one live WebSocket connection per recipient
//! identity. A message only becomes `processed` after the consumer sends an
//! explicit `confirm` for its id. Unconfirmed messages are replayed in id
//! order on the next successful connect, giving at-least-once delivery with
//! the durable store as the single source of truth.

pub mod api;
pub mod config;
pub mod delivery;
pub mod error;
pub mod heartbeat;
pub mod notify;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod store;
pub mod transform;
