//! WebSocket signaling and relay server.
//!
//! ```text
//! Peer A ──┐                       ┌── Peer A
//!          ├── Room (room id) ──── Room broadcast ──┤
//! Peer B ──┘        │              └── Peer B
//!                   └── membership + room key
//! ```
//!
//! The relay is a rendezvous point: it admits peers into rooms, announces
//! arrivals and departures, and forwards `Relay` frames between peers that
//! cannot reach each other directly. It keeps no document state and never
//! decodes the `SyncMessage` payloads it forwards.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{Frame, PeerInfo, RejectReason};
use crate::room::{Room, RoomManager, Routed};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Ephemeral port on loopback.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 16,
            broadcast_capacity: 64,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_joins: u64,
    pub dropped_frames: u64,
    pub active_rooms: usize,
}

pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.max_peers_per_room, config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.room_count().await;
        stats
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<RelayStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // (room, our peer id) once joined
        let mut joined: Option<(Arc<Room>, Uuid)> = None;
        let mut room_rx: Option<broadcast::Receiver<Routed>> = None;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let bytes: Vec<u8> = match msg {
                            Some(Ok(Message::Binary(data))) => data.into(),
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => return Err(e.into()),
                        };

                        {
                            let mut s = stats.write().await;
                            s.total_frames += 1;
                            s.total_bytes += bytes.len() as u64;
                        }

                        let frame = match Frame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Dropping undecodable frame from {addr}: {e}");
                                stats.write().await.dropped_frames += 1;
                                continue;
                            }
                        };

                        match frame {
                            Frame::Join { room, peer, key } => {
                                if joined.is_some() {
                                    log::warn!("Peer at {addr} sent a second Join; ignored");
                                    continue;
                                }
                                let handle = rooms.get_or_create(&room, key).await;
                                match handle.join(peer.clone(), key).await {
                                    Ok((rx, existing)) => {
                                        let welcome = Frame::Welcome { peers: existing }.encode()?;
                                        ws_sender.send(Message::Binary(welcome.into())).await?;
                                        handle.publish(peer.peer_id, None, &Frame::PeerJoined { peer: peer.clone() })?;
                                        log::info!("Peer {} ({}) joined room {room}", peer.name, peer.peer_id);
                                        room_rx = Some(rx);
                                        joined = Some((handle, peer.peer_id));
                                    }
                                    Err(reason) => {
                                        log::info!("Rejected {} from room {room}: {reason}", peer.peer_id);
                                        stats.write().await.rejected_joins += 1;
                                        let rejected = Frame::Rejected { reason }.encode()?;
                                        ws_sender.send(Message::Binary(rejected.into())).await?;
                                        rooms.remove_if_empty(&room).await;
                                    }
                                }
                            }
                            Frame::Relay { room, to, message, .. } => {
                                let Some((handle, peer_id)) = &joined else {
                                    let rejected = Frame::Rejected { reason: RejectReason::NotJoined }.encode()?;
                                    ws_sender.send(Message::Binary(rejected.into())).await?;
                                    continue;
                                };
                                if room != handle.id() {
                                    log::debug!("Dropping relay for room {room} from {peer_id}");
                                    stats.write().await.dropped_frames += 1;
                                    continue;
                                }
                                // Never trust the sender field from the wire.
                                let frame = Frame::Relay { room, from: *peer_id, to, message };
                                handle.publish(*peer_id, to, &frame)?;
                            }
                            Frame::Leave => break,
                            other => {
                                log::debug!("Ignoring {other:?} from {addr}");
                            }
                        }
                    }

                    routed = recv_routed(&mut room_rx) => {
                        let Some((handle, peer_id)) = &joined else { continue };
                        match routed {
                            Ok(routed) => {
                                if !routed.is_for(*peer_id) {
                                    continue;
                                }
                                ws_sender.send(Message::Binary(routed.bytes.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Peer {peer_id} lagged, skipped {n} frames");
                                handle.record_lag(n);
                                let resync = Frame::Resync { skipped: n }.encode()?;
                                ws_sender.send(Message::Binary(resync.into())).await?;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        // Cleanup: leave the room and tell the others
        if let Some((handle, peer_id)) = joined {
            handle.leave(&peer_id).await;
            if let Err(e) = handle.publish(peer_id, None, &Frame::PeerLeft { peer_id }) {
                log::error!("Failed to announce departure of {peer_id}: {e}");
            }
            rooms.remove_if_empty(handle.id()).await;
            log::info!("Peer {peer_id} left room {}", handle.id());
        }

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result
    }
}

/// Wait on the room receiver, or forever when not joined yet.
async fn recv_routed(rx: &mut Option<broadcast::Receiver<Routed>>) -> Result<Routed, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Peers currently admitted to `room`.
pub async fn room_peers(server: &RelayServer, room: &str) -> Vec<PeerInfo> {
    match server.rooms.get(room).await {
        Some(handle) => handle.peers().await,
        None => Vec::new(),
    }
}
