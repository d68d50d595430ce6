//! Relay rooms: membership, access key and fan-out.
//!
//! Every room owns one tokio broadcast channel. Each routed frame carries
//! its sender and optional target; connection tasks drop frames that are
//! their own or addressed to someone else, so a targeted relay costs the
//! same O(1) send as a room-wide one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{Frame, PeerInfo, ProtocolError, RejectReason, RoomId, RoomKey};

/// An encoded frame on its way through a room.
#[derive(Debug, Clone)]
pub struct Routed {
    pub from: Uuid,
    pub to: Option<Uuid>,
    pub bytes: Arc<Vec<u8>>,
}

impl Routed {
    /// Whether the connection of `peer_id` should forward this frame.
    pub fn is_for(&self, peer_id: Uuid) -> bool {
        self.from != peer_id && self.to.is_none_or(|to| to == peer_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub frames_routed: u64,
    pub frames_lagged: u64,
    pub active_peers: usize,
}

struct AtomicRoomStats {
    frames_routed: AtomicU64,
    frames_lagged: AtomicU64,
}

pub struct Room {
    id: RoomId,
    /// Fixed by the first peer to join.
    key: Option<RoomKey>,
    max_peers: usize,
    sender: broadcast::Sender<Routed>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    stats: AtomicRoomStats,
}

impl Room {
    pub fn new(id: impl Into<RoomId>, key: Option<RoomKey>, max_peers: usize, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            id: id.into(),
            key,
            max_peers,
            sender,
            peers: RwLock::new(HashMap::new()),
            stats: AtomicRoomStats {
                frames_routed: AtomicU64::new(0),
                frames_lagged: AtomicU64::new(0),
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Admit a peer. Returns its receiver and the peers already present.
    pub async fn join(
        &self,
        peer: PeerInfo,
        key: Option<RoomKey>,
    ) -> Result<(broadcast::Receiver<Routed>, Vec<PeerInfo>), RejectReason> {
        if key != self.key {
            return Err(RejectReason::WrongKey);
        }
        let mut peers = self.peers.write().await;
        if peers.len() >= self.max_peers && !peers.contains_key(&peer.peer_id) {
            return Err(RejectReason::RoomFull);
        }
        let existing: Vec<PeerInfo> = peers.values().filter(|p| p.peer_id != peer.peer_id).cloned().collect();
        peers.insert(peer.peer_id, peer);
        Ok((self.sender.subscribe(), existing))
    }

    pub async fn leave(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode and route a frame. Returns how many receivers got it.
    pub fn publish(&self, from: Uuid, to: Option<Uuid>, frame: &Frame) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(frame.encode()?);
        Ok(self.publish_raw(Routed { from, to, bytes }))
    }

    pub fn publish_raw(&self, routed: Routed) -> usize {
        let count = self.sender.send(routed).unwrap_or(0);
        self.stats.frames_routed.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn record_lag(&self, skipped: u64) {
        self.stats.frames_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_routed: self.stats.frames_routed.load(Ordering::Relaxed),
            frames_lagged: self.stats.frames_lagged.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }
}

/// Room id → room.
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
    max_peers: usize,
    capacity: usize,
}

impl RoomManager {
    pub fn new(max_peers: usize, capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            max_peers,
            capacity,
        }
    }

    /// Get the room, creating it with `key` if it does not exist yet.
    pub async fn get_or_create(&self, id: &str, key: Option<RoomKey>) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(id.to_string())
            .or_insert_with(|| {
                log::info!("Room {id} opened");
                Arc::new(Room::new(id, key, self.max_peers, self.capacity))
            })
            .clone()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(id).cloned()
    }

    pub async fn remove_if_empty(&self, id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(id) {
            if room.peer_count().await == 0 {
                rooms.remove(id);
                log::info!("Room {id} closed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
