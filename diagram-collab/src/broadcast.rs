//! Hub-side fan-out to the other connections in a room.
//!
//! Uses tokio broadcast channels: one send reaches every subscriber, and
//! each connection drains its own receiver. A receiver that falls more than
//! `capacity` frames behind skips the oldest ones (backpressure by loss).
//!
//! Every frame carries the id of the connection it came from so the
//! connection loop can skip its own traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::Collaborator;

/// A frame travelling through a room.
#[derive(Debug, Clone)]
pub struct HubFrame {
    /// Connection id of the sender; `0` for frames the hub itself produced.
    pub origin: u64,
    pub message: Message,
}

/// One connection in a room.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub connection_id: u64,
    /// Set once the connection announces a `join`.
    pub collaborator: Option<Collaborator>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<HubFrame>>,
    peers: RwLock<HashMap<u64, PeerInfo>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Add a connection unless the room already holds `max_peers`.
    pub async fn try_add_peer(
        &self,
        connection_id: u64,
        max_peers: usize,
    ) -> Option<broadcast::Receiver<Arc<HubFrame>>> {
        let mut peers = self.peers.write().await;
        if peers.len() >= max_peers {
            return None;
        }
        peers.insert(
            connection_id,
            PeerInfo {
                connection_id,
                collaborator: None,
            },
        );
        Some(self.sender.subscribe())
    }

    /// Remember who is behind a connection, for the leave on drop.
    pub async fn set_collaborator(&self, connection_id: u64, collaborator: Option<Collaborator>) {
        if let Some(peer) = self.peers.write().await.get_mut(&connection_id) {
            peer.collaborator = collaborator;
        }
    }

    /// Whether any connection in the room has joined as `id`.
    pub async fn has_collaborator(&self, id: &str) -> bool {
        self.peers
            .read()
            .await
            .values()
            .any(|peer| peer.collaborator.as_ref().is_some_and(|c| c.id == id))
    }

    pub async fn remove_peer(&self, connection_id: u64) -> Option<PeerInfo> {
        self.peers.write().await.remove(&connection_id)
    }

    /// Send to every subscriber, the origin included; receivers filter.
    ///
    /// Returns the number of receivers reached.
    pub fn broadcast(&self, origin: u64, message: Message) -> usize {
        let count = self
            .sender
            .send(Arc::new(HubFrame { origin, message }))
            .unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps room keys to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, key: &str) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(key) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, key: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(key).cloned()
    }

    /// Drop the room if nobody is left in it.
    pub async fn remove_if_empty(&self, key: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(key) {
            if room.peer_count().await == 0 {
                rooms.remove(key);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Message {
        Message::Text(s.into())
    }

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let _rx = group.try_add_peer(1, 10).await.unwrap();
        assert_eq!(group.peer_count().await, 1);

        let removed = group.remove_peer(1).await.unwrap();
        assert_eq!(removed.connection_id, 1);
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_peer_limit() {
        let group = BroadcastGroup::new(16);
        assert!(group.try_add_peer(1, 2).await.is_some());
        assert!(group.try_add_peer(2, 2).await.is_some());
        assert!(group.try_add_peer(3, 2).await.is_none());
        assert_eq!(group.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_with_origin() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.try_add_peer(1, 10).await.unwrap();
        let mut rx2 = group.try_add_peer(2, 10).await.unwrap();

        // Both receivers get it, including the sender; filtering is the caller's job
        assert_eq!(group.broadcast(1, text("hello")), 2);

        let frame = rx1.recv().await.unwrap();
        assert_eq!(frame.origin, 1);
        let frame = rx2.recv().await.unwrap();
        assert_eq!(frame.message, text("hello"));

        assert_eq!(group.stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.try_add_peer(1, 10).await.unwrap();
        for i in 0..5 {
            group.broadcast(0, text(&i.to_string()));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_dropped(n),
            other => panic!("Expected lag, got {other:?}"),
        }
        assert_eq!(group.stats().await.messages_dropped, 3);
    }

    #[tokio::test]
    async fn test_set_collaborator() {
        let group = BroadcastGroup::new(4);
        let _rx = group.try_add_peer(7, 10).await.unwrap();
        group
            .set_collaborator(7, Some(Collaborator::new("u7", "Uma")))
            .await;

        let peers = group.peers().await;
        assert_eq!(peers[0].collaborator.as_ref().unwrap().id, "u7");
        assert!(group.has_collaborator("u7").await);
        assert!(!group.has_collaborator("u8").await);
    }

    #[tokio::test]
    async fn test_room_manager() {
        let manager = RoomManager::new(16);
        let a = manager.get_or_create("relay/a").await;
        let again = manager.get_or_create("relay/a").await;
        assert!(Arc::ptr_eq(&a, &again));
        manager.get_or_create("crdt/b").await;
        assert_eq!(manager.room_count().await, 2);
        assert_eq!(manager.active_rooms().await, vec!["crdt/b", "relay/a"]);

        let _rx = a.try_add_peer(1, 10).await.unwrap();
        assert!(!manager.remove_if_empty("relay/a").await);
        a.remove_peer(1).await;
        assert!(manager.remove_if_empty("relay/a").await);
        assert!(manager.get("relay/a").await.is_none());
    }
}
