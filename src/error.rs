//! Error types for the relay.

use thiserror::Error;

/// Errors surfaced by the relay library.
///
/// Only store failures propagate to producers; everything else is recovered
/// locally through the redelivery path or logged and ignored.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The durable message store rejected or failed an operation.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Message metadata could not be encoded or decoded.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// An outbound HTTP call to a collaborator failed at the transport level.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The text-transform collaborator returned an error.
    #[error("transform failed: {0}")]
    Transform(String),

    /// The post-ack notification collaborator returned an error.
    #[error("notification failed: {0}")]
    Notify(String),

    /// The consumer connection went away while an event was being sent.
    #[error("connection closed")]
    ConnectionClosed,

    /// Filesystem error (database directory, prompt file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
