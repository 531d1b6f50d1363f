//! Live-connection registry: at most one connection per recipient identity.
//!
//! Registry state is process-local and rebuilt from scratch on restart; the
//! durable store guarantees no message loss across that gap.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::protocol::ServerEvent;

/// Handle to a live consumer connection.
///
/// Cloneable; all clones refer to the same underlying channel. The epoch
/// distinguishes successive connections for the same identity so that stale
/// timers or removes from a dead session cannot affect its replacement.
#[derive(Clone)]
pub struct ConnectionHandle {
    identity: String,
    epoch: Uuid,
    outbound: mpsc::Sender<ServerEvent>,
    close: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(identity: impl Into<String>, outbound: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            identity: identity.into(),
            epoch: Uuid::new_v4(),
            outbound,
            close: Arc::new(Notify::new()),
        }
    }

    /// A handle plus the receiving end of its outbound channel, for tests and
    /// in-process consumers.
    pub fn pair(identity: &str) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (Self::new(identity, tx), rx)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    /// Queue an event toward the consumer's session loop.
    pub async fn send(&self, event: ServerEvent) -> Result<()> {
        self.outbound
            .send(event)
            .await
            .map_err(|_| RelayError::ConnectionClosed)
    }

    /// Ask the owning session to shut this connection down. Used when a newer
    /// connection for the same identity replaces this one.
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.close.notified().await;
    }
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<String, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `conn`, returning any previous connection for the same
    /// identity. The registry does not close the replaced handle; that is the
    /// caller's responsibility.
    pub fn register(&self, conn: ConnectionHandle) -> Option<ConnectionHandle> {
        self.inner
            .lock()
            .insert(conn.identity().to_string(), conn)
    }

    pub fn lookup(&self, identity: &str) -> Option<ConnectionHandle> {
        self.inner.lock().get(identity).cloned()
    }

    /// Remove only when the stored handle has the same epoch as `conn`, so a
    /// late remove from a dead session cannot evict a newer connection.
    pub fn remove(&self, conn: &ConnectionHandle) {
        let mut map = self.inner.lock();
        if map
            .get(conn.identity())
            .is_some_and(|current| current.epoch == conn.epoch)
        {
            map.remove(conn.identity());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionHandle, ConnectionRegistry};

    #[test]
    fn register_replaces_and_returns_old_handle() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = ConnectionHandle::pair("u1");
        let (second, _rx2) = ConnectionHandle::pair("u1");

        assert!(registry.register(first.clone()).is_none());
        let replaced = registry.register(second.clone()).unwrap();
        assert_eq!(replaced.epoch(), first.epoch());

        let current = registry.lookup("u1").unwrap();
        assert_eq!(current.epoch(), second.epoch());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_remove_does_not_evict_newer_connection() {
        let registry = ConnectionRegistry::new();
        let (old, _rx1) = ConnectionHandle::pair("u1");
        let (new, _rx2) = ConnectionHandle::pair("u1");

        registry.register(old.clone());
        registry.register(new.clone());

        // the old session shutting down must not evict its replacement
        registry.remove(&old);
        assert_eq!(registry.lookup("u1").unwrap().epoch(), new.epoch());

        registry.remove(&new);
        assert!(registry.lookup("u1").is_none());
    }

    #[test]
    fn lookup_misses_for_unknown_identity() {
        let registry = ConnectionRegistry::new();
        assert!(registry.lookup("nobody").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn close_signal_reaches_waiter_even_if_sent_first() {
        let (conn, _rx) = ConnectionHandle::pair("u1");
        conn.close();
        // notify_one stores a permit, so a close that races the session loop
        // is not lost
        conn.closed().await;
    }

    #[tokio::test]
    async fn send_fails_once_receiver_is_dropped() {
        let (conn, rx) = ConnectionHandle::pair("u1");
        drop(rx);
        assert!(conn.send(crate::protocol::ServerEvent::Ping).await.is_err());
    }
}
