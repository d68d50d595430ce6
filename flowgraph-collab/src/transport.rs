//! Mesh transport: signaling, direct peer links and relay fallback.
//!
//! ```text
//!            ┌──────────── signaling / relay ────────────┐
//!            │                                            │
//!   MeshTransport A ◄═══════ direct link (Hello) ═══════► MeshTransport B
//! ```
//!
//! A transport joins one room on the first reachable signaling endpoint.
//! With [`RelayPolicy::Auto`] it then dials every peer that advertised a
//! direct address and keeps relaying through the signaling server for the
//! peers it cannot reach. Delivery is best effort: frames may be dropped,
//! duplicated or reordered and the document merge tolerates all three.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::lock;
use crate::protocol::{Frame, PeerInfo, ProtocolError, RejectReason, RoomId, RoomKey, SyncMessage};

/// How document traffic is routed between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayPolicy {
    /// Direct links where possible, relay otherwise.
    #[default]
    Auto,
    RelayOnly,
    DirectOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Signaling endpoints, tried in order.
    pub signaling_urls: Vec<String>,
    pub connect_timeout: Duration,
    pub relay_policy: RelayPolicy,
    /// Accept direct links on this address (`host:port`, port 0 for any).
    pub listen_addr: Option<String>,
    /// Address announced to peers. Defaults to the bound listen address.
    pub advertise_addr: Option<String>,
    /// ICE/STUN servers, announced verbatim.
    pub ice_servers: Vec<String>,
    /// Per-link outgoing queue length.
    pub outgoing_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            signaling_urls: vec!["ws://127.0.0.1:9090".to_string()],
            connect_timeout: Duration::from_secs(5),
            relay_policy: RelayPolicy::Auto,
            listen_addr: None,
            advertise_addr: None,
            ice_servers: Vec::new(),
            outgoing_capacity: 256,
        }
    }
}

impl TransportConfig {
    pub fn for_testing(signaling_url: impl Into<String>) -> Self {
        Self {
            signaling_urls: vec![signaling_url.into()],
            connect_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }
}

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Relayed,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Joined the room through `endpoint`; `peers` were already present.
    Connected { peers: Vec<PeerInfo>, endpoint: String },
    Disconnected,
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
    /// The relay dropped frames addressed to us.
    Resync { skipped: u64 },
    /// How traffic to a peer is routed changed.
    Route { peer_id: Uuid, route: Route },
    Message {
        from: Uuid,
        via: Route,
        message: SyncMessage,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No signaling endpoint reachable: {0}")]
    Unreachable(String),
    #[error("Rejected: {0}")]
    Rejected(RejectReason),
    #[error("Not connected")]
    NotConnected,
    #[error("Timed out")]
    Timeout,
    #[error("Connection closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        TransportError::WebSocket(e.to_string())
    }
}

// ─── Shared state ───────────────────────────────────────────────────

/// State shared by the handle and its background tasks. Locks are never
/// held across an await point.
struct Shared {
    room: RoomId,
    key: Option<RoomKey>,
    policy: RelayPolicy,
    connect_timeout: Duration,
    outgoing_capacity: usize,
    /// Bumped on every connect and disconnect; tasks of an older
    /// generation stay silent.
    generation: AtomicU64,
    local: Mutex<PeerInfo>,
    state: Mutex<ConnectionState>,
    peers: Mutex<HashMap<Uuid, PeerInfo>>,
    direct: Mutex<HashMap<Uuid, mpsc::Sender<Vec<u8>>>>,
    signaling: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    readers: Mutex<Vec<AbortHandle>>,
    events: mpsc::Sender<TransportEvent>,
}

impl Shared {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn local(&self) -> PeerInfo {
        lock(&self.local).clone()
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    async fn emit(&self, event: TransportEvent) {
        // Nobody listening is not an error.
        let _ = self.events.send(event).await;
    }

    /// Drop every link and forget every peer.
    fn teardown(&self) {
        lock(&self.signaling).take();
        lock(&self.direct).clear();
        lock(&self.peers).clear();
        for reader in lock(&self.readers).drain(..) {
            reader.abort();
        }
    }

    fn track(&self, handle: AbortHandle) {
        lock(&self.readers).push(handle);
    }

    /// Decide the route to a peer announced in `Welcome`.
    async fn route_peer(self: Arc<Self>, peer: PeerInfo, generation: u64) {
        let addr = match (self.policy, peer.direct_addr.clone()) {
            (RelayPolicy::RelayOnly, _) | (RelayPolicy::Auto, None) => {
                self.emit(TransportEvent::Route {
                    peer_id: peer.peer_id,
                    route: Route::Relayed,
                })
                .await;
                return;
            }
            (RelayPolicy::DirectOnly, None) => {
                log::warn!("Peer {} has no direct address and relaying is disabled", peer.peer_id);
                return;
            }
            (_, Some(addr)) => addr,
        };

        match self.clone().dial(&peer, &addr, generation).await {
            Ok(()) => log::debug!("Direct link to {} at {addr}", peer.peer_id),
            Err(e) if self.policy == RelayPolicy::Auto => {
                log::info!("Direct link to {} failed ({e}); relaying", peer.peer_id);
                self.emit(TransportEvent::Route {
                    peer_id: peer.peer_id,
                    route: Route::Relayed,
                })
                .await;
            }
            Err(e) => log::warn!("Peer {} unreachable: {e}", peer.peer_id),
        }
    }

    async fn dial(self: Arc<Self>, peer: &PeerInfo, addr: &str, generation: u64) -> Result<(), TransportError> {
        let url = format!("ws://{addr}");
        let (ws, _) = timeout(self.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let (mut sink, mut stream) = ws.split();

        let hello = Frame::Hello {
            room: self.room.clone(),
            peer: self.local(),
            key: self.key,
        };
        sink.send(Message::Binary(hello.encode()?.into())).await?;

        let reply = timeout(self.connect_timeout, next_frame(&mut stream))
            .await
            .map_err(|_| TransportError::Timeout)??;
        match reply {
            Frame::HelloAck { peer: remote } if remote.peer_id == peer.peer_id => {}
            Frame::Rejected { reason } => return Err(TransportError::Rejected(reason)),
            _ => return Err(ProtocolError::UnexpectedFrame("expected HelloAck").into()),
        }

        self.attach_link(peer.peer_id, sink, stream, generation).await;
        Ok(())
    }

    /// Validate an inbound `Hello` and attach the link.
    async fn accept_link(self: Arc<Self>, stream: TcpStream) -> Result<(), TransportError> {
        let generation = self.generation();
        let ws = timeout(self.connect_timeout, tokio_tungstenite::accept_async(stream))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let (mut sink, mut stream) = ws.split();

        let hello = timeout(self.connect_timeout, next_frame(&mut stream))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let Frame::Hello { room, peer, key } = hello else {
            return Err(ProtocolError::UnexpectedFrame("expected Hello").into());
        };

        let rejection = if room != self.room {
            Some(RejectReason::WrongRoom)
        } else if key != self.key {
            Some(RejectReason::WrongKey)
        } else if *lock(&self.state) != ConnectionState::Connected {
            Some(RejectReason::NotJoined)
        } else {
            None
        };
        if let Some(reason) = rejection {
            sink.send(Message::Binary(Frame::Rejected { reason }.encode()?.into())).await?;
            return Err(TransportError::Rejected(reason));
        }

        let ack = Frame::HelloAck { peer: self.local() };
        sink.send(Message::Binary(ack.encode()?.into())).await?;
        lock(&self.peers).entry(peer.peer_id).or_insert_with(|| peer.clone());
        self.attach_link(peer.peer_id, sink, stream, generation).await;
        Ok(())
    }

    async fn attach_link<Si, St>(self: Arc<Self>, peer_id: Uuid, sink: Si, stream: St, generation: u64)
    where
        Si: Sink<Message> + Unpin + Send + 'static,
        Si::Error: Send,
        St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
    {
        if self.generation() != generation {
            return;
        }
        let (tx, rx) = mpsc::channel(self.outgoing_capacity);
        spawn_writer(sink, rx);
        lock(&self.direct).insert(peer_id, tx);

        let shared = self.clone();
        let reader = tokio::spawn(async move { shared.direct_reader(peer_id, stream, generation).await });
        self.track(reader.abort_handle());

        self.emit(TransportEvent::Route {
            peer_id,
            route: Route::Direct,
        })
        .await;
    }

    async fn direct_reader<St>(self: Arc<Self>, peer_id: Uuid, mut stream: St, generation: u64)
    where
        St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            match next_frame(&mut stream).await {
                Ok(Frame::Direct { message }) => {
                    self.emit(TransportEvent::Message {
                        from: peer_id,
                        via: Route::Direct,
                        message,
                    })
                    .await;
                }
                Ok(other) => log::debug!("Ignoring {other:?} on direct link to {peer_id}"),
                Err(TransportError::Protocol(e)) => log::warn!("Dropping frame from {peer_id}: {e}"),
                Err(_) => break,
            }
        }

        if self.generation() != generation {
            return;
        }
        lock(&self.direct).remove(&peer_id);
        let still_known = lock(&self.peers).contains_key(&peer_id);
        log::debug!("Direct link to {peer_id} closed");
        if still_known && self.policy != RelayPolicy::DirectOnly {
            self.emit(TransportEvent::Route {
                peer_id,
                route: Route::Relayed,
            })
            .await;
        }
    }

    async fn signaling_reader<St>(self: Arc<Self>, mut stream: St, generation: u64)
    where
        St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            match next_frame(&mut stream).await {
                Ok(Frame::Relay { from, message, .. }) => {
                    self.emit(TransportEvent::Message {
                        from,
                        via: Route::Relayed,
                        message,
                    })
                    .await;
                }
                Ok(Frame::PeerJoined { peer }) => {
                    lock(&self.peers).insert(peer.peer_id, peer.clone());
                    log::info!("Peer {} ({}) joined", peer.name, peer.peer_id);
                    self.emit(TransportEvent::PeerJoined(peer)).await;
                }
                Ok(Frame::PeerLeft { peer_id }) => {
                    lock(&self.peers).remove(&peer_id);
                    lock(&self.direct).remove(&peer_id);
                    log::info!("Peer {peer_id} left");
                    self.emit(TransportEvent::PeerLeft(peer_id)).await;
                }
                Ok(Frame::Resync { skipped }) => {
                    log::warn!("Relay dropped {skipped} frames for us");
                    self.emit(TransportEvent::Resync { skipped }).await;
                }
                Ok(Frame::Rejected { reason }) => log::warn!("Signaling rejected a frame: {reason}"),
                Ok(other) => log::debug!("Ignoring {other:?} from signaling"),
                Err(TransportError::Protocol(e)) => log::warn!("Dropping signaling frame: {e}"),
                Err(_) => break,
            }
        }

        if self.generation() != generation {
            return;
        }
        lock(&self.signaling).take();
        self.set_state(ConnectionState::Disconnected);
        log::info!("Signaling connection lost");
        self.emit(TransportEvent::Disconnected).await;
    }
}

/// Read the next binary frame, skipping control messages.
async fn next_frame<St>(stream: &mut St) -> Result<Frame, TransportError>
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => {
                let bytes: Vec<u8> = data.into();
                return Ok(Frame::decode(&bytes)?);
            }
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Forward queued frames to the socket; closes it once the queue is dropped.
fn spawn_writer<Si>(mut sink: Si, mut rx: mpsc::Receiver<Vec<u8>>)
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Send,
{
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if sink.send(Message::Binary(data.into())).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    });
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Direct listener accept failed: {e}");
                continue;
            }
        };
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.accept_link(stream).await {
                log::debug!("Direct link from {addr} refused: {e}");
            }
        });
    }
}

// ─── MeshTransport ──────────────────────────────────────────────────

/// One peer's membership in one room.
///
/// The peer id is reassigned on every [`connect`](Self::connect).
pub struct MeshTransport {
    config: TransportConfig,
    user_id: String,
    name: String,
    shared: Arc<Shared>,
    event_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    advertised: Mutex<Option<String>>,
    listener: Mutex<Option<AbortHandle>>,
}

impl MeshTransport {
    pub fn new(
        config: TransportConfig,
        room: impl Into<RoomId>,
        password: Option<&str>,
        user_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let room = room.into();
        let user_id = user_id.into();
        let name = name.into();
        let (events, event_rx) = mpsc::channel(1024);
        let shared = Arc::new(Shared {
            key: RoomKey::for_room(&room, password),
            room,
            policy: config.relay_policy,
            connect_timeout: config.connect_timeout,
            outgoing_capacity: config.outgoing_capacity.max(1),
            generation: AtomicU64::new(0),
            local: Mutex::new(PeerInfo::new(user_id.clone(), name.clone())),
            state: Mutex::new(ConnectionState::Disconnected),
            peers: Mutex::new(HashMap::new()),
            direct: Mutex::new(HashMap::new()),
            signaling: Mutex::new(None),
            readers: Mutex::new(Vec::new()),
            events,
        });
        Self {
            config,
            user_id,
            name,
            shared,
            event_rx: Mutex::new(Some(event_rx)),
            advertised: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        lock(&self.event_rx).take()
    }

    pub fn room(&self) -> &str {
        &self.shared.room
    }

    pub fn local_peer(&self) -> PeerInfo {
        self.shared.local()
    }

    pub fn peer_id(&self) -> Uuid {
        lock(&self.shared.local).peer_id
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        lock(&self.shared.peers).values().cloned().collect()
    }

    /// Address announced for direct links, once the listener is bound.
    pub fn direct_addr(&self) -> Option<String> {
        lock(&self.advertised).clone()
    }

    pub fn route(&self, peer_id: &Uuid) -> Option<Route> {
        if lock(&self.shared.direct).contains_key(peer_id) {
            return Some(Route::Direct);
        }
        let known = lock(&self.shared.peers).contains_key(peer_id);
        (known && self.shared.policy != RelayPolicy::DirectOnly).then_some(Route::Relayed)
    }

    /// Join the room on the first reachable signaling endpoint.
    ///
    /// Returns the peers already present.
    pub async fn connect(&self) -> Result<Vec<PeerInfo>, TransportError> {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.teardown();
        self.shared.set_state(if generation > 1 {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        let advertised = self.ensure_listener().await?;
        let mut local = PeerInfo::new(self.user_id.clone(), self.name.clone());
        local.direct_addr = advertised;
        local.ice_hints = self.config.ice_servers.clone();
        *lock(&self.shared.local) = local.clone();

        let mut failures = Vec::new();
        for url in &self.config.signaling_urls {
            match self.join_endpoint(url, &local, generation).await {
                Ok(peers) => return Ok(peers),
                Err(TransportError::Rejected(reason)) => {
                    self.shared.set_state(ConnectionState::Disconnected);
                    return Err(TransportError::Rejected(reason));
                }
                Err(e) => {
                    log::warn!("Signaling endpoint {url} failed: {e}");
                    failures.push(format!("{url}: {e}"));
                }
            }
        }

        self.shared.set_state(ConnectionState::Disconnected);
        Err(TransportError::Unreachable(failures.join("; ")))
    }

    async fn join_endpoint(&self, url: &str, local: &PeerInfo, generation: u64) -> Result<Vec<PeerInfo>, TransportError> {
        let shared = &self.shared;
        let (ws, _) = timeout(shared.connect_timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let (mut sink, mut stream) = ws.split();

        let join = Frame::Join {
            room: shared.room.clone(),
            peer: local.clone(),
            key: shared.key,
        };
        sink.send(Message::Binary(join.encode()?.into())).await?;

        let reply = timeout(shared.connect_timeout, next_frame(&mut stream))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let peers = match reply {
            Frame::Welcome { peers } => peers,
            Frame::Rejected { reason } => return Err(TransportError::Rejected(reason)),
            _ => return Err(ProtocolError::UnexpectedFrame("expected Welcome").into()),
        };

        let (tx, rx) = mpsc::channel(shared.outgoing_capacity);
        spawn_writer(sink, rx);
        *lock(&shared.signaling) = Some(tx);
        {
            let mut known = lock(&shared.peers);
            for peer in &peers {
                known.insert(peer.peer_id, peer.clone());
            }
        }
        shared.set_state(ConnectionState::Connected);
        log::info!(
            "Joined room {} via {url} as {} ({} peers present)",
            shared.room,
            local.peer_id,
            peers.len()
        );

        // Connected goes out before anything the reader forwards.
        shared
            .emit(TransportEvent::Connected {
                peers: peers.clone(),
                endpoint: url.to_string(),
            })
            .await;
        let reader = tokio::spawn(shared.clone().signaling_reader(stream, generation));
        shared.track(reader.abort_handle());
        for peer in &peers {
            tokio::spawn(shared.clone().route_peer(peer.clone(), generation));
        }
        Ok(peers)
    }

    /// Bind the direct-link listener on first use.
    async fn ensure_listener(&self) -> Result<Option<String>, TransportError> {
        if self.config.relay_policy == RelayPolicy::RelayOnly {
            return Ok(None);
        }
        let Some(listen_addr) = &self.config.listen_addr else {
            return Ok(None);
        };
        if lock(&self.listener).is_some() {
            return Ok(lock(&self.advertised).clone());
        }

        let listener = TcpListener::bind(listen_addr).await?;
        let bound = listener.local_addr()?;
        let advertised = self.config.advertise_addr.clone().unwrap_or_else(|| bound.to_string());
        log::info!("Accepting direct links on {bound} (advertised as {advertised})");

        let task = tokio::spawn(accept_loop(self.shared.clone(), listener));
        *lock(&self.listener) = Some(task.abort_handle());
        *lock(&self.advertised) = Some(advertised.clone());
        Ok(Some(advertised))
    }

    /// Send to one peer, or to the whole room with `to: None`.
    ///
    /// Direct links are preferred; everything else goes through the relay.
    pub async fn send(&self, to: Option<Uuid>, message: SyncMessage) -> Result<(), TransportError> {
        let shared = &self.shared;
        let from = lock(&shared.local).peer_id;
        let relay_allowed = shared.policy != RelayPolicy::DirectOnly;
        let signaling = if relay_allowed { lock(&shared.signaling).clone() } else { None };

        match to {
            Some(peer_id) => {
                let direct = lock(&shared.direct).get(&peer_id).cloned();
                if let Some(link) = direct {
                    let bytes = Frame::Direct { message }.encode()?;
                    return link.send(bytes).await.map_err(|_| TransportError::Closed);
                }
                let relay = signaling.ok_or(TransportError::NotConnected)?;
                let bytes = Frame::relay(&shared.room, from, Some(peer_id), message).encode()?;
                relay.send(bytes).await.map_err(|_| TransportError::NotConnected)
            }
            None => {
                let direct: Vec<(Uuid, mpsc::Sender<Vec<u8>>)> =
                    lock(&shared.direct).iter().map(|(id, tx)| (*id, tx.clone())).collect();
                let relayed: Vec<Uuid> = lock(&shared.peers)
                    .keys()
                    .filter(|id| !direct.iter().any(|(d, _)| d == *id))
                    .copied()
                    .collect();

                if direct.is_empty() && signaling.is_none() {
                    return Err(TransportError::NotConnected);
                }

                if !direct.is_empty() {
                    let bytes = Frame::Direct {
                        message: message.clone(),
                    }
                    .encode()?;
                    for (peer_id, link) in &direct {
                        if link.send(bytes.clone()).await.is_err() {
                            log::debug!("Direct link to {peer_id} closed while sending");
                        }
                    }
                }

                let Some(relay) = signaling else {
                    return Ok(());
                };
                if direct.is_empty() {
                    let bytes = Frame::relay(&shared.room, from, None, message).encode()?;
                    return relay.send(bytes).await.map_err(|_| TransportError::NotConnected);
                }
                for peer_id in relayed {
                    let bytes = Frame::relay(&shared.room, from, Some(peer_id), message.clone()).encode()?;
                    relay.send(bytes).await.map_err(|_| TransportError::NotConnected)?;
                }
                Ok(())
            }
        }
    }

    /// Leave the room and drop every link.
    pub async fn disconnect(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let signaling = lock(&self.shared.signaling).take();
        if let Some(tx) = signaling {
            if let Ok(bytes) = Frame::Leave.encode() {
                let _ = tx.send(bytes).await;
            }
        }
        self.shared.teardown();
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.emit(TransportEvent::Disconnected).await;
    }
}

impl Drop for MeshTransport {
    fn drop(&mut self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        self.shared.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.relay_policy, RelayPolicy::Auto);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert!(config.listen_addr.is_none());
    }

    #[test]
    fn test_policy_serde_names() {
        let json = serde_json::to_string(&RelayPolicy::RelayOnly).unwrap();
        assert_eq!(json, "\"relay_only\"");
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let transport = MeshTransport::new(TransportConfig::default(), "room", None, "u", "User");
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        let err = transport.send(None, SyncMessage::Ping { nonce: 1 }).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_unreachable_endpoints_are_reported() {
        // Bind then drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let mut config = TransportConfig::for_testing(format!("ws://127.0.0.1:{port}"));
        config.connect_timeout = Duration::from_millis(200);
        let transport = MeshTransport::new(config, "room", None, "u", "User");

        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_event_receiver_taken_once() {
        let transport = MeshTransport::new(TransportConfig::default(), "room", None, "u", "User");
        assert!(transport.take_event_rx().is_some());
        assert!(transport.take_event_rx().is_none());
    }
}
