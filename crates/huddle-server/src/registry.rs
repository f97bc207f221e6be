//! Connection registry: client id → live outbound queue.
//!
//! The registry is the only owner of client channels. Sends never block: each
//! client has a bounded queue drained by its connection's writer task, and a
//! full or closed queue is reported as a dropped delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::protocol::OutboundFrame;

/// A serialized frame, shared between recipients of one broadcast.
pub type Payload = Arc<String>;

/// Result of handing a payload to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the client's writer.
    Delivered,
    /// No client with that id is registered. Expected when racing a
    /// disconnect; not an error.
    NotConnected,
    /// The client's queue was full or already closed.
    Dropped,
}

/// One registered connection.
pub struct ClientHandle {
    /// Caller-supplied client id.
    pub client_id: String,
    /// Server-generated id of this particular socket.
    pub connection_id: String,
    /// Room the connection was opened for.
    pub room_id: String,
    tx: mpsc::Sender<Payload>,
    last_seen: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ClientHandle {
    fn new(client_id: &str, room_id: &str, tx: mpsc::Sender<Payload>) -> Self {
        Self {
            client_id: client_id.to_string(),
            connection_id: format!("conn_{}", Uuid::now_v7()),
            room_id: room_id.to_string(),
            tx,
            last_seen: Mutex::new(Instant::now()),
            dropped_messages: AtomicU64::new(0),
        }
    }

    fn try_send(&self, payload: Payload) -> bool {
        if self.tx.try_send(payload).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Record inbound activity (any frame, including pongs).
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last inbound activity.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Messages dropped because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

/// Registry of all live client connections.
pub struct ConnectionRegistry {
    clients: DashMap<String, Arc<ClientHandle>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    /// Create a registry whose client queues hold `max_send_queue` frames.
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Create a bounded queue sized for one client.
    pub fn channel(&self) -> (mpsc::Sender<Payload>, mpsc::Receiver<Payload>) {
        mpsc::channel(self.max_send_queue)
    }

    /// Store `tx` as the live channel for `client_id`.
    ///
    /// Any previous entry for the same id is replaced (last connection wins).
    pub fn register(
        &self,
        client_id: &str,
        room_id: &str,
        tx: mpsc::Sender<Payload>,
    ) -> Arc<ClientHandle> {
        let handle = Arc::new(ClientHandle::new(client_id, room_id, tx));
        if let Some(previous) = self
            .clients
            .insert(client_id.to_string(), Arc::clone(&handle))
        {
            warn!(
                client_id,
                previous = %previous.connection_id,
                "client id re-registered, replacing previous connection"
            );
        }
        handle
    }

    /// Remove `client_id`. Returns whether an entry existed.
    pub fn unregister(&self, client_id: &str) -> bool {
        self.clients.remove(client_id).is_some()
    }

    /// Remove `client_id` only if it is still bound to `connection_id`.
    ///
    /// A superseded connection must not evict the connection that replaced it.
    pub fn release(&self, client_id: &str, connection_id: &str) -> bool {
        self.clients
            .remove_if(client_id, |_, handle| handle.connection_id == connection_id)
            .is_some()
    }

    /// Look up the live connection for `client_id`.
    pub fn get(&self, client_id: &str) -> Option<Arc<ClientHandle>> {
        self.clients
            .get(client_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Queue `payload` for `client_id`.
    pub fn send(&self, client_id: &str, payload: Payload) -> Delivery {
        let Some(handle) = self.get(client_id) else {
            return Delivery::NotConnected;
        };
        if handle.try_send(payload) {
            Delivery::Delivered
        } else {
            warn!(
                client_id,
                total_drops = handle.drop_count(),
                "failed to queue frame for client (channel full or closed)"
            );
            Delivery::Dropped
        }
    }

    /// Serialize `frame` and queue it for `client_id`.
    pub fn send_frame(&self, client_id: &str, frame: &OutboundFrame) -> Delivery {
        match frame.encode() {
            Ok(payload) => self.send(client_id, payload),
            Err(e) => {
                warn!(client_id, error = %e, "failed to serialize frame");
                Delivery::Dropped
            }
        }
    }

    /// Whether `client_id` currently has a live connection.
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(
        registry: &ConnectionRegistry,
        client_id: &str,
    ) -> (Arc<ClientHandle>, mpsc::Receiver<Payload>) {
        let (tx, rx) = registry.channel();
        (registry.register(client_id, "r1", tx), rx)
    }

    #[test]
    fn register_and_unregister() {
        let registry = ConnectionRegistry::new(8);
        let (_a, _rx_a) = registered(&registry, "a");
        let (_b, _rx_b) = registered(&registry, "b");
        assert_eq!(registry.count(), 2);

        assert!(registry.unregister("a"));
        assert!(!registry.is_connected("a"));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn unregister_absent_is_noop() {
        let registry = ConnectionRegistry::new(8);
        assert!(!registry.unregister("ghost"));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn send_delivers_payload() {
        let registry = ConnectionRegistry::new(8);
        let (_a, mut rx) = registered(&registry, "a");

        let outcome = registry.send("a", Arc::new("hello".to_string()));
        assert_eq!(outcome, Delivery::Delivered);
        assert_eq!(&*rx.recv().await.unwrap(), "hello");
    }

    #[test]
    fn send_to_absent_client_is_silent() {
        let registry = ConnectionRegistry::new(8);
        let outcome = registry.send("ghost", Arc::new("hello".to_string()));
        assert_eq!(outcome, Delivery::NotConnected);
    }

    #[test]
    fn send_to_closed_channel_is_dropped() {
        let registry = ConnectionRegistry::new(8);
        let (handle, rx) = registered(&registry, "a");
        drop(rx);

        let outcome = registry.send("a", Arc::new("hello".to_string()));
        assert_eq!(outcome, Delivery::Dropped);
        assert_eq!(handle.drop_count(), 1);
    }

    #[test]
    fn send_to_full_queue_is_dropped() {
        let registry = ConnectionRegistry::new(1);
        let (_a, _rx) = registered(&registry, "a");

        assert_eq!(
            registry.send("a", Arc::new("one".to_string())),
            Delivery::Delivered
        );
        assert_eq!(
            registry.send("a", Arc::new("two".to_string())),
            Delivery::Dropped
        );
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let registry = ConnectionRegistry::new(8);
        let (_old, mut old_rx) = registered(&registry, "a");
        let (_new, mut new_rx) = registered(&registry, "a");
        assert_eq!(registry.count(), 1);

        let _ = registry.send("a", Arc::new("hi".to_string()));
        assert_eq!(&*new_rx.recv().await.unwrap(), "hi");
        assert!(old_rx.try_recv().is_err());
    }

    #[test]
    fn release_ignores_superseded_connection() {
        let registry = ConnectionRegistry::new(8);
        let (old, _old_rx) = registered(&registry, "a");
        let (new, _new_rx) = registered(&registry, "a");

        assert!(!registry.release("a", &old.connection_id));
        assert!(registry.is_connected("a"));
        assert!(registry.release("a", &new.connection_id));
        assert!(!registry.is_connected("a"));
    }

    #[tokio::test]
    async fn send_frame_serializes() {
        let registry = ConnectionRegistry::new(8);
        let (_a, mut rx) = registered(&registry, "a");

        let outcome = registry.send_frame("a", &OutboundFrame::error("boom"));
        assert_eq!(outcome, Delivery::Delivered);
        let json: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "boom");
    }

    #[test]
    fn connection_ids_are_unique() {
        let registry = ConnectionRegistry::new(8);
        let (a, _rx_a) = registered(&registry, "a");
        let (b, _rx_b) = registered(&registry, "b");
        assert_ne!(a.connection_id, b.connection_id);
        assert!(a.connection_id.starts_with("conn_"));
    }

    #[test]
    fn mark_alive_resets_idle_time() {
        let registry = ConnectionRegistry::new(8);
        let (a, _rx) = registered(&registry, "a");
        std::thread::sleep(Duration::from_millis(10));
        assert!(a.idle_for() >= Duration::from_millis(10));
        a.mark_alive();
        assert!(a.idle_for() < Duration::from_millis(10));
    }
}
