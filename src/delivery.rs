//! Delivery engine: sequential, acknowledged, at-least-once delivery.
//!
//! All state transitions for one recipient — backlog replay, ingress pushes,
//! ack and timeout processing — serialize through that identity's sequence
//! lock, so unrelated identities never contend and the same message is never
//! double-sent by a racing reconnect and ingress push. The engine never
//! retries inside a connection: a timed-out message stays unprocessed in the
//! store and is resent on the next successful connect, while the heartbeat
//! monitor takes care of dropping a truly dead transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::Result;
use crate::notify::AckNotifier;
use crate::protocol::ServerEvent;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::store::{MessageStore, StoredMessage};

/// In-memory record of a sent-but-unconfirmed message. Dropped on ack or
/// timeout; the durable row stays unprocessed until the ack path marks it.
struct PendingAck {
    metadata: Option<serde_json::Value>,
    epoch: Uuid,
    settled: Arc<Notify>,
}

struct EngineInner {
    store: MessageStore,
    registry: ConnectionRegistry,
    ack_timeout: Duration,
    notifier: Option<AckNotifier>,
    /// At most one entry per (identity, message id).
    pending: Mutex<HashMap<(String, i64), PendingAck>>,
    /// Per-identity sequence locks; never a global delivery lock.
    sequences: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Clone)]
pub struct DeliveryEngine {
    inner: Arc<EngineInner>,
}

impl DeliveryEngine {
    pub fn new(
        store: MessageStore,
        registry: ConnectionRegistry,
        ack_timeout: Duration,
        notifier: Option<AckNotifier>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                registry,
                ack_timeout,
                notifier,
                pending: Mutex::new(HashMap::new()),
                sequences: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn sequence(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .sequences
            .lock()
            .entry(identity.to_string())
            .or_default()
            .clone()
    }

    /// Replay every unprocessed message for `identity` in ascending id order.
    /// Each message waits for its own ack or timeout before the next is sent.
    /// Invoked on every successful connect.
    pub async fn deliver_all(&self, identity: &str) {
        let sequence = self.sequence(identity);
        let _guard = sequence.lock().await;
        self.drain_backlog(identity, None).await;
    }

    /// Ingress-triggered delivery of a freshly appended message. Serializes
    /// through the same per-identity sequence as `deliver_all`, and drains any
    /// older unprocessed ids first so a push that beats a reconnect replay to
    /// the sequence lock cannot send ids out of order.
    pub async fn push(&self, message: StoredMessage) {
        let identity = message.recipient.clone();
        let sequence = self.sequence(&identity);
        let _guard = sequence.lock().await;

        if self.inner.registry.lookup(&identity).is_none() {
            // not an error: the message waits in the store for the next connect
            tracing::debug!(identity = %identity, message_id = message.id, "recipient offline, queued for reconnect");
            return;
        }
        self.drain_backlog(&identity, Some(message.id)).await;
    }

    /// Send-and-await loop over the unprocessed backlog in ascending id
    /// order, stopping after `up_to` when one is given. The caller must hold
    /// the identity's sequence lock.
    async fn drain_backlog(&self, identity: &str, up_to: Option<i64>) {
        let backlog = match self.inner.store.fetch_unprocessed(identity) {
            Ok(backlog) => backlog,
            Err(error) => {
                tracing::error!(identity = %identity, error = %error, "failed to fetch backlog");
                return;
            }
        };
        if backlog.is_empty() {
            return;
        }
        tracing::info!(identity = %identity, count = backlog.len(), "replaying unprocessed backlog");

        for message in backlog {
            if up_to.is_some_and(|max| message.id > max) {
                return;
            }
            // consumer may have gone away mid-replay; the rest is retried on
            // the next connect
            let Some(conn) = self.inner.registry.lookup(identity) else {
                return;
            };
            // an ingress push that won an earlier sequence slot may have
            // settled this id already
            match self.inner.store.is_unprocessed(message.id) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(error) => {
                    tracing::error!(identity = %identity, message_id = message.id, error = %error, "store check failed during replay");
                    return;
                }
            }
            let settled = self.send_with_ack(&conn, &message).await;
            settled.notified().await;
        }
    }

    /// Serialize `message` as a `new_message` event, record a pending ack,
    /// transmit, and arm the ack timeout. Fire-and-forget: returns a handle
    /// that is notified once the ack arrives or the timeout fires.
    pub async fn send_with_ack(
        &self,
        conn: &ConnectionHandle,
        message: &StoredMessage,
    ) -> Arc<Notify> {
        let key = (conn.identity().to_string(), message.id);
        let settled = Arc::new(Notify::new());
        {
            let mut pending = self.inner.pending.lock();
            if let Some(existing) = pending.get(&key) {
                // invariant: at most one pending ack per (identity, id)
                tracing::warn!(identity = %conn.identity(), message_id = message.id, "send suppressed, ack already pending");
                return existing.settled.clone();
            }
            pending.insert(
                key.clone(),
                PendingAck {
                    metadata: message.metadata.clone(),
                    epoch: conn.epoch(),
                    settled: settled.clone(),
                },
            );
        }

        let event = ServerEvent::NewMessage {
            id: message.id,
            text: message.delivery_text().to_string(),
            metadata: message.metadata.clone(),
            created_at: message.created_at.clone(),
        };
        if conn.send(event).await.is_err() {
            // writer side is gone; leave the row unprocessed for redelivery
            tracing::debug!(identity = %conn.identity(), message_id = message.id, "connection closed before send");
            self.inner.pending.lock().remove(&key);
            settled.notify_one();
            return settled;
        }
        tracing::debug!(identity = %conn.identity(), message_id = message.id, "message sent, awaiting confirm");

        // timeout keyed by (identity, id, epoch): a stale timer from a
        // replaced connection cannot clear a newer connection's pending ack
        let engine = self.clone();
        let identity = conn.identity().to_string();
        let epoch = conn.epoch();
        let message_id = message.id;
        let timeout = self.inner.ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            engine.on_ack_timeout(&identity, message_id, epoch);
        });

        settled
    }

    /// Apply a consumer `confirm`. Duplicate or stale confirms are ignored;
    /// only a store failure is surfaced to the caller.
    pub fn on_ack(&self, identity: &str, message_id: i64) -> Result<()> {
        let removed = self
            .inner
            .pending
            .lock()
            .remove(&(identity.to_string(), message_id));
        let Some(pending) = removed else {
            tracing::debug!(identity = %identity, message_id, "ignoring duplicate or stale confirm");
            return Ok(());
        };

        let marked = self.inner.store.mark_processed(message_id);
        // settle the waiting sequence regardless of the store outcome so the
        // delivery loop is never wedged
        pending.settled.notify_one();

        match marked {
            Ok(true) => {
                tracing::info!(identity = %identity, message_id, "message confirmed");
                if let (Some(notifier), Some(metadata)) =
                    (self.inner.notifier.clone(), pending.metadata)
                {
                    // post-ack side effect: failures are logged, never block
                    // or roll back the ack
                    tokio::spawn(async move {
                        if let Err(error) = notifier.message_delivered(&metadata).await {
                            tracing::warn!(message_id, error = %error, "post-ack notification failed");
                        }
                    });
                }
                Ok(())
            }
            Ok(false) => {
                tracing::debug!(identity = %identity, message_id, "confirm for missing or already-processed message");
                Ok(())
            }
            Err(error) => {
                tracing::error!(identity = %identity, message_id, error = %error, "failed to mark message processed");
                Err(error)
            }
        }
    }

    /// Clear a pending ack whose deadline passed without a confirm. The
    /// durable row stays unprocessed and is resent on the next reconnect; no
    /// in-connection retry is attempted.
    pub fn on_ack_timeout(&self, identity: &str, message_id: i64, epoch: Uuid) {
        let key = (identity.to_string(), message_id);
        let expired = {
            let mut pending = self.inner.pending.lock();
            match pending.get(&key) {
                Some(entry) if entry.epoch == epoch => pending.remove(&key),
                _ => None,
            }
        };
        if let Some(entry) = expired {
            tracing::warn!(identity = %identity, message_id, "ack timeout, message left unprocessed for redelivery");
            entry.settled.notify_one();
        }
    }

    /// Number of sent-but-unconfirmed messages currently tracked.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}
