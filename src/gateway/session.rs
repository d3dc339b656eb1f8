use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

/// Outbound half of one live device connection. Writes are serialised by
/// the per-connection writer task that drains `tx`; closing wakes the
/// connection task through `shutdown`.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: u64,
    tx: mpsc::Sender<Vec<u8>>,
    shutdown: Arc<Notify>,
}

impl SessionHandle {
    pub async fn write(&self, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.tx
            .send(bytes)
            .await
            .map_err(|_| anyhow::anyhow!("session writer closed"))
    }

    pub fn close(&self) {
        self.shutdown.notify_one();
    }
}

/// Device id -> live session. At most one session per device: inserting a
/// new one atomically evicts and closes the previous socket. The
/// dispatcher listens on the connect channel to flush queued commands on
/// next contact.
pub struct SessionRegistry {
    sessions: DashMap<i64, SessionHandle>,
    next_id: AtomicU64,
    connect_tx: mpsc::Sender<i64>,
}

impl SessionRegistry {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<i64>) {
        let (connect_tx, connect_rx) = mpsc::channel(256);
        (
            Arc::new(Self { sessions: DashMap::new(), next_id: AtomicU64::new(1), connect_tx }),
            connect_rx,
        )
    }

    /// Bind a connection to a device. Returns the registered handle; any
    /// previous session for the device is closed.
    pub async fn register(
        &self,
        device_id: i64,
        tx: mpsc::Sender<Vec<u8>>,
        shutdown: Arc<Notify>,
    ) -> SessionHandle {
        let handle = SessionHandle {
            session_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tx,
            shutdown,
        };
        if let Some(previous) = self.sessions.insert(device_id, handle.clone()) {
            info!(device_id, "evicting previous session");
            previous.close();
        }
        metrics::gauge!("gateway_sessions", self.sessions.len() as f64);
        // Wake the command dispatcher; a full channel only delays flushing
        // until the next tick.
        let _ = self.connect_tx.try_send(device_id);
        handle
    }

    /// Remove the binding, but only if it still belongs to this session;
    /// a connection being torn down must not evict its replacement.
    pub fn unregister(&self, device_id: i64, session_id: u64) {
        let removed = self
            .sessions
            .remove_if(&device_id, |_, handle| handle.session_id == session_id)
            .is_some();
        if removed {
            debug!(device_id, "session unregistered");
            metrics::gauge!("gateway_sessions", self.sessions.len() as f64);
        }
    }

    pub fn get(&self, device_id: i64) -> Option<SessionHandle> {
        self.sessions.get(&device_id).map(|h| h.clone())
    }

    pub fn is_online(&self, device_id: i64) -> bool {
        self.sessions.contains_key(&device_id)
    }

    /// Close and drop a device's session (eviction on device retirement).
    pub fn close_device(&self, device_id: i64) {
        if let Some((_, handle)) = self.sessions.remove(&device_id) {
            handle.close();
        }
    }

    /// Graceful shutdown: close every live session.
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().close();
        }
        self.sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_evicts_previous_session() {
        let (registry, mut connect_rx) = SessionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let shutdown1 = Arc::new(Notify::new());
        let first = registry.register(7, tx1, shutdown1.clone()).await;

        let (tx2, _rx2) = mpsc::channel(4);
        let second = registry.register(7, tx2, Arc::new(Notify::new())).await;

        assert_ne!(first.session_id, second.session_id);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(7).unwrap().session_id, second.session_id);
        // Both registrations signalled the dispatcher.
        assert_eq!(connect_rx.recv().await, Some(7));
        assert_eq!(connect_rx.recv().await, Some(7));
        // The evicted session was told to close.
        tokio::time::timeout(std::time::Duration::from_millis(50), shutdown1.notified())
            .await
            .expect("first session should have been closed");
    }

    #[tokio::test]
    async fn stale_unregister_keeps_the_replacement() {
        let (registry, _connect_rx) = SessionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let first = registry.register(7, tx1, Arc::new(Notify::new())).await;
        let (tx2, _rx2) = mpsc::channel(4);
        let second = registry.register(7, tx2, Arc::new(Notify::new())).await;

        // The evicted connection's teardown runs late.
        registry.unregister(7, first.session_id);
        assert!(registry.is_online(7));
        registry.unregister(7, second.session_id);
        assert!(!registry.is_online(7));
    }

    #[tokio::test]
    async fn writes_flow_through_the_channel() {
        let (registry, _connect_rx) = SessionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = registry.register(7, tx, Arc::new(Notify::new())).await;
        handle.write(vec![1, 2, 3]).await.unwrap();
        assert_eq!(rx.recv().await, Some(vec![1, 2, 3]));
    }
}
