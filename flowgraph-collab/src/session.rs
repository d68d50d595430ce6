//! One client's collaboration session in one room.
//!
//! ```text
//!            commands                 UpdateEvent (every origin)
//!   UI ───────────────► GraphEngine ─────────────────────────────► Persister
//!                          ▲   │ Local / History origin
//!      apply_remote_update │   ▼
//!                     ┌────┴──────────┐   SyncStep1/2, Update, Awareness
//!                     │  event loop   │ ◄──────────────────────────────► MeshTransport
//!                     └───────────────┘
//! ```
//!
//! Start-up order: persisted state is restored into the engine, the
//! persister starts, then the transport connects. On every (re)connect the
//! session sends its state vector so peers answer with only what is missing.
//! Transport, merge and persistence failures are logged and reported as
//! [`SessionEvent`]s; they never reach the caller of a local command.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use flowgraph_core::{
    EngineConfig, GraphEngine, NodeTypeRegistry, Observers, Point, ReplicaError, RetentionPolicy, Subscription,
    TxnOrigin, Viewport,
};

use crate::awareness::{
    Awareness, AwarenessConfig, AwarenessState, AwarenessUpdate, PresenceStatus, TextSelection, UserPresence,
};
use crate::lock;
use crate::protocol::{PeerInfo, SyncMessage};
use crate::storage::{DocumentStore, PersistenceConfig, Persister, StoreError};
use crate::transport::{ConnectionState, MeshTransport, TransportConfig, TransportError, TransportEvent};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub room_id: String,
    pub user_id: String,
    pub display_name: String,
    /// `#rrggbb`; derived from the user id when absent.
    pub color: Option<String>,
    pub password: Option<String>,
    pub retention: RetentionPolicy,
    pub transport: TransportConfig,
    pub awareness: AwarenessConfig,
    pub persistence: PersistenceConfig,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// Period of the background state-vector exchange with the room.
    pub sync_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            room_id: "default".to_string(),
            user_id: "anonymous".to_string(),
            display_name: "Anonymous".to_string(),
            color: None,
            password: None,
            retention: RetentionPolicy::default(),
            transport: TransportConfig::default(),
            awareness: AwarenessConfig::default(),
            persistence: PersistenceConfig::default(),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            sync_interval: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    pub fn for_testing(room_id: &str, user_id: &str, signaling_url: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            display_name: user_id.to_string(),
            retention: RetentionPolicy::unbounded(),
            transport: TransportConfig::for_testing(signaling_url),
            awareness: AwarenessConfig::for_testing(),
            persistence: PersistenceConfig::for_testing(),
            reconnect_initial: Duration::from_millis(50),
            reconnect_max: Duration::from_millis(500),
            sync_interval: Duration::from_secs(2),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected { endpoint: String, peers: usize },
    /// Working offline; reconnection is attempted in the background.
    Disconnected,
    /// The state-vector exchange with `peer_id` completed.
    Synced { peer_id: Uuid },
    PeerListChanged { peers: usize },
    AwarenessChanged,
    /// A remote user left, went silent, or we lost the link to them.
    PeerOffline { client_id: Uuid, user_id: String },
    PersistenceError(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error("Background task failed: {0}")]
    Task(String),
}

// ─── Shared context ─────────────────────────────────────────────────

struct Context {
    engine: Arc<Mutex<GraphEngine>>,
    awareness: Mutex<Awareness>,
    transport: MeshTransport,
    events: Arc<Observers<SessionEvent>>,
    shutting_down: AtomicBool,
    reconnect_initial: Duration,
    reconnect_max: Duration,
}

impl Context {
    async fn send(&self, to: Option<Uuid>, message: SyncMessage) {
        let kind = message.kind();
        match self.transport.send(to, message).await {
            Ok(()) => {}
            Err(TransportError::NotConnected) => log::trace!("Offline, {kind} not sent"),
            Err(e) => log::debug!("Failed to send {kind}: {e}"),
        }
    }

    async fn send_awareness(&self, to: Option<Uuid>, update: AwarenessUpdate) {
        match update.encode() {
            Ok(payload) => self.send(to, SyncMessage::Awareness { payload }).await,
            Err(e) => log::warn!("Failed to encode awareness: {e}"),
        }
    }

    async fn send_state_vector(&self, to: Option<Uuid>) {
        let state_vector = lock(&self.engine).state_vector();
        self.send(to, SyncMessage::SyncStep1 { state_vector }).await;
    }

    fn emit(&self, event: SessionEvent) {
        self.events.emit(&event);
    }

    /// Report users whose presence was just dropped.
    fn report_departed(&self) {
        let departed = lock(&self.awareness).take_departed();
        for presence in departed {
            log::debug!("{} ({}) is offline", presence.state.user_id, presence.client_id);
            self.emit(SessionEvent::PeerOffline {
                client_id: presence.client_id,
                user_id: presence.state.user_id,
            });
        }
    }

    fn peer_list_changed(&self) {
        self.emit(SessionEvent::PeerListChanged {
            peers: self.transport.peers().len(),
        });
    }

    /// Handle one transport event. Returns `true` when the link was lost and
    /// the session should reconnect.
    async fn handle(&self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Connected { peers, endpoint } => {
                let full = {
                    let mut awareness = lock(&self.awareness);
                    awareness.set_client_id(self.transport.peer_id());
                    awareness.full_update(Instant::now())
                };
                self.emit(SessionEvent::Connected {
                    endpoint,
                    peers: peers.len(),
                });
                self.send_state_vector(None).await;
                self.send_awareness(None, full).await;
                self.peer_list_changed();
            }
            TransportEvent::Disconnected => {
                if lock(&self.awareness).remove_all() > 0 {
                    self.report_departed();
                    self.emit(SessionEvent::AwarenessChanged);
                }
                self.emit(SessionEvent::Disconnected);
                return !self.shutting_down.load(Ordering::SeqCst);
            }
            TransportEvent::PeerJoined(peer) => {
                self.send_state_vector(Some(peer.peer_id)).await;
                let full = lock(&self.awareness).full_update(Instant::now());
                self.send_awareness(Some(peer.peer_id), full).await;
                self.peer_list_changed();
            }
            TransportEvent::PeerLeft(peer_id) => {
                if lock(&self.awareness).remove(&peer_id) {
                    self.report_departed();
                    self.emit(SessionEvent::AwarenessChanged);
                }
                self.peer_list_changed();
            }
            TransportEvent::Resync { skipped } => {
                log::info!("Lost {skipped} relayed frames, resyncing room {}", self.transport.room());
                self.send_state_vector(None).await;
            }
            TransportEvent::Route { peer_id, route } => log::debug!("Traffic to {peer_id} now {route:?}"),
            TransportEvent::Message { from, message, .. } => self.handle_message(from, message).await,
        }
        false
    }

    async fn handle_message(&self, from: Uuid, message: SyncMessage) {
        match message {
            SyncMessage::SyncStep1 { state_vector } => {
                let diff = lock(&self.engine).encode_diff(&state_vector);
                match diff {
                    Ok(update) => self.send(Some(from), SyncMessage::SyncStep2 { update }).await,
                    Err(e) => log::warn!("Bad state vector from {from}: {e}"),
                }
            }
            SyncMessage::SyncStep2 { update } => {
                if self.merge(from, &update) {
                    self.emit(SessionEvent::Synced { peer_id: from });
                }
            }
            SyncMessage::Update { update, .. } => {
                self.merge(from, &update);
            }
            SyncMessage::Awareness { payload } => match AwarenessUpdate::decode(&payload) {
                Ok(update) => {
                    let changed = lock(&self.awareness).apply_remote(update, Instant::now());
                    if changed {
                        self.report_departed();
                        self.emit(SessionEvent::AwarenessChanged);
                    }
                }
                Err(e) => log::debug!("Dropping awareness from {from}: {e}"),
            },
            SyncMessage::Ping { nonce } => self.send(Some(from), SyncMessage::Pong { nonce }).await,
            SyncMessage::Pong { .. } => log::trace!("Pong from {from}"),
        }
    }

    fn merge(&self, from: Uuid, update: &[u8]) -> bool {
        let result = lock(&self.engine).apply_remote_update(update, TxnOrigin::Remote(from));
        match result {
            Ok(changes) => {
                log::trace!("Merged update from {from} ({} changes)", changes.len());
                true
            }
            Err(e) => {
                log::warn!("Rejected update from {from}: {e}");
                false
            }
        }
    }

    /// Reconnect with exponential backoff. Returns `false` when giving up.
    async fn reconnect(&self) -> bool {
        let mut delay = self.reconnect_initial;
        loop {
            tokio::time::sleep(delay).await;
            if self.shutting_down.load(Ordering::SeqCst) {
                return false;
            }
            match self.transport.connect().await {
                Ok(_) => return true,
                Err(TransportError::Rejected(reason)) => {
                    log::error!("Room {} rejected us: {reason}", self.transport.room());
                    return false;
                }
                Err(e) => {
                    delay = (delay * 2).min(self.reconnect_max);
                    log::info!("Reconnect failed ({e}), next attempt in {delay:?}");
                }
            }
        }
    }
}

async fn event_loop(ctx: Arc<Context>, mut rx: mpsc::Receiver<TransportEvent>, mut reconnect: bool) {
    loop {
        if reconnect && !ctx.reconnect().await {
            return;
        }
        let Some(event) = rx.recv().await else {
            return;
        };
        reconnect = ctx.handle(event).await;
    }
}

/// Forward local-origin updates to the room.
async fn forward_loop(ctx: Arc<Context>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    let mut clock = 0u64;
    while let Some(update) = rx.recv().await {
        clock += 1;
        ctx.send(None, SyncMessage::Update { clock, update }).await;
    }
}

/// Re-announce the state vector so peers fill any gap the links dropped.
async fn sync_loop(ctx: Arc<Context>, period: Duration) {
    let period = period.max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if ctx.transport.state() == ConnectionState::Connected && !ctx.transport.peers().is_empty() {
            log::trace!("Periodic sync of room {}", ctx.transport.room());
            ctx.send_state_vector(None).await;
        }
    }
}

/// Flush throttled cursor moves, send heartbeats and drop silent peers.
async fn awareness_loop(ctx: Arc<Context>, tick: Duration) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let now = Instant::now();
        let connected = ctx.transport.state() == ConnectionState::Connected;
        let (update, expired) = {
            let mut awareness = lock(&ctx.awareness);
            let update = if connected {
                awareness.flush_pending(now).or_else(|| awareness.heartbeat(now))
            } else {
                None
            };
            (update, awareness.expire_stale(now))
        };
        if let Some(update) = update {
            ctx.send_awareness(None, update).await;
        }
        if !expired.is_empty() {
            log::debug!("Dropped {} stale awareness entries", expired.len());
            ctx.report_departed();
            ctx.emit(SessionEvent::AwarenessChanged);
        }
    }
}

// ─── Session ────────────────────────────────────────────────────────

pub struct Session {
    ctx: Arc<Context>,
    persister: Option<Persister>,
    tasks: Vec<JoinHandle<()>>,
    updates: Option<Subscription>,
}

impl Session {
    /// Restore local state, start persisting and join the room.
    ///
    /// An unreachable signaling server is not an error: the session works
    /// offline and keeps reconnecting. A wrong room password is.
    pub async fn start(
        config: SessionConfig,
        registry: Arc<NodeTypeRegistry>,
        store: Option<Arc<dyn DocumentStore>>,
    ) -> Result<Self, SessionError> {
        let engine = GraphEngine::new(
            EngineConfig {
                user_id: config.user_id.clone(),
                retention: config.retention,
                client_id: None,
            },
            registry,
        );
        let engine = Arc::new(Mutex::new(engine));
        let events: Arc<Observers<SessionEvent>> = Arc::new(Observers::new());

        let next_seq = match &store {
            Some(store) => restore(&engine, store.clone(), &config.room_id).await,
            None => None,
        };

        let persister = match (store, next_seq) {
            (Some(store), Some(next_seq)) => {
                let snapshot_engine = engine.clone();
                let error_events = events.clone();
                Some(Persister::spawn(
                    store,
                    config.room_id.clone(),
                    config.persistence.clone(),
                    next_seq,
                    Arc::new(move || lock(&snapshot_engine).encode_state()),
                    Box::new(move |e: &StoreError| error_events.emit(&SessionEvent::PersistenceError(e.to_string()))),
                ))
            }
            _ => None,
        };

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let persist = persister.as_ref().map(Persister::handle);
        let updates = lock(&engine).subscribe_updates(move |event| {
            if let Some(persist) = &persist {
                persist.update(event.update.to_vec());
            }
            if event.origin.is_local() {
                let _ = local_tx.send(event.update.to_vec());
            }
        });

        let transport = MeshTransport::new(
            config.transport.clone(),
            config.room_id.clone(),
            config.password.as_deref(),
            config.user_id.clone(),
            config.display_name.clone(),
        );
        let Some(transport_rx) = transport.take_event_rx() else {
            return Err(SessionError::Task("transport events already taken".into()));
        };
        let local_state = AwarenessState::new(&config.user_id, &config.display_name, config.color.clone());
        let awareness = Awareness::new(config.awareness.clone(), transport.peer_id(), local_state);
        let tick = config.awareness.cursor_throttle.max(Duration::from_millis(10));

        let ctx = Arc::new(Context {
            engine,
            awareness: Mutex::new(awareness),
            transport,
            events,
            shutting_down: AtomicBool::new(false),
            reconnect_initial: config.reconnect_initial,
            reconnect_max: config.reconnect_max,
        });

        let offline = match ctx.transport.connect().await {
            Ok(_) => false,
            Err(TransportError::Rejected(reason)) => {
                drop(updates);
                if let Some(persister) = persister {
                    let _ = persister.shutdown().await;
                }
                return Err(TransportError::Rejected(reason).into());
            }
            Err(e) => {
                log::warn!("Starting room {} offline: {e}", config.room_id);
                true
            }
        };

        let tasks = vec![
            tokio::spawn(event_loop(ctx.clone(), transport_rx, offline)),
            tokio::spawn(forward_loop(ctx.clone(), local_rx)),
            tokio::spawn(awareness_loop(ctx.clone(), tick)),
            tokio::spawn(sync_loop(ctx.clone(), config.sync_interval)),
        ];

        Ok(Self {
            ctx,
            persister,
            tasks,
            updates: Some(updates),
        })
    }

    /// The engine behind this session. Do not hold the lock across an await.
    pub fn engine(&self) -> Arc<Mutex<GraphEngine>> {
        self.ctx.engine.clone()
    }

    pub fn with_engine<R>(&self, f: impl FnOnce(&mut GraphEngine) -> R) -> R {
        f(&mut lock(&self.ctx.engine))
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.ctx.events.subscribe(callback)
    }

    pub fn room_id(&self) -> &str {
        self.ctx.transport.room()
    }

    pub fn peer_id(&self) -> Uuid {
        self.ctx.transport.peer_id()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.ctx.transport.state()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.ctx.transport.peers()
    }

    /// Remote users seen within the staleness window, sorted by name.
    pub fn connected_users(&self) -> Vec<UserPresence> {
        lock(&self.ctx.awareness).connected_users(Instant::now())
    }

    pub fn local_awareness(&self) -> AwarenessState {
        lock(&self.ctx.awareness).local_state().clone()
    }

    // ─── Awareness ───

    pub async fn set_cursor(&self, cursor: Option<Point>) {
        let update = lock(&self.ctx.awareness).set_cursor(cursor, Instant::now());
        self.broadcast(update).await;
    }

    /// Announce the engine's current node selection.
    pub async fn publish_selection(&self) {
        let nodes = lock(&self.ctx.engine).selection().nodes.iter().cloned().collect();
        let update = lock(&self.ctx.awareness).set_selection(nodes, Instant::now());
        self.broadcast(update).await;
    }

    pub async fn set_text_selection(&self, text: Option<TextSelection>) {
        let update = lock(&self.ctx.awareness).set_text_selection(text, Instant::now());
        self.broadcast(update).await;
    }

    pub async fn set_status(&self, status: PresenceStatus) {
        let update = lock(&self.ctx.awareness).set_status(status, Instant::now());
        self.broadcast(update).await;
    }

    pub async fn set_awareness_viewport(&self, viewport: Option<Viewport>) {
        let update = lock(&self.ctx.awareness).set_viewport(viewport, Instant::now());
        self.broadcast(update).await;
    }

    async fn broadcast(&self, update: Option<AwarenessUpdate>) {
        if let Some(update) = update {
            self.ctx.send_awareness(None, update).await;
        }
    }

    // ─── Lifecycle ───

    /// Write every buffered update now.
    pub async fn flush_persistence(&self) -> Result<(), SessionError> {
        match &self.persister {
            Some(persister) => Ok(persister.flush().await?),
            None => Ok(()),
        }
    }

    /// Announce departure, leave the room and flush persistence.
    pub async fn shutdown(mut self) -> Result<(), SessionError> {
        self.ctx.shutting_down.store(true, Ordering::SeqCst);
        if self.ctx.transport.state() == ConnectionState::Connected {
            let leave = lock(&self.ctx.awareness).leave_update();
            self.ctx.send_awareness(None, leave).await;
        }
        self.ctx.transport.disconnect().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.updates.take();
        if let Some(persister) = self.persister.take() {
            persister.shutdown().await?;
        }
        log::info!("Left room {}", self.ctx.transport.room());
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.ctx.shutting_down.store(true, Ordering::SeqCst);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Apply persisted state. Returns the next delta sequence, or `None` when
/// the store cannot be read and persistence should stay off.
async fn restore(engine: &Mutex<GraphEngine>, store: Arc<dyn DocumentStore>, doc_id: &str) -> Option<u64> {
    let id = doc_id.to_string();
    let loaded = tokio::task::spawn_blocking(move || {
        let updates = store.load_updates(&id)?;
        let meta = store.metadata(&id)?;
        Ok::<_, StoreError>((updates, meta))
    })
    .await;

    let (updates, meta) = match loaded {
        Ok(Ok(loaded)) => loaded,
        Ok(Err(e)) => {
            log::error!("Cannot read local state of {doc_id}, persistence disabled: {e}");
            return None;
        }
        Err(e) => {
            log::error!("Restore task for {doc_id} failed: {e}");
            return None;
        }
    };

    let mut engine = lock(engine);
    for (i, update) in updates.iter().enumerate() {
        if let Err(e) = engine.restore(update) {
            log::warn!("Skipping unreadable stored update {i} of {doc_id}: {e}");
        }
    }
    if !updates.is_empty() {
        log::info!("Restored {doc_id} from {} stored updates", updates.len());
    }
    Some(meta.map_or(1, |m| m.next_seq()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use flowgraph_core::Node;
    use std::sync::atomic::AtomicU64;

    fn offline_config(room: &str, user: &str) -> SessionConfig {
        // Nothing listens on port 9 of loopback.
        let mut config = SessionConfig::for_testing(room, user, "ws://127.0.0.1:9");
        config.transport.connect_timeout = Duration::from_millis(100);
        config.reconnect_initial = Duration::from_secs(60);
        config
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"room_id": "r1", "user_id": "u1"}"#).unwrap();
        assert_eq!(config.room_id, "r1");
        assert_eq!(config.display_name, "Anonymous");
        assert_eq!(config.awareness.heartbeat_interval, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_offline_session_persists_local_edits() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(NodeTypeRegistry::with_defaults());
        let session = Session::start(offline_config("room", "alice"), registry.clone(), Some(store.clone() as Arc<dyn DocumentStore>))
            .await
            .unwrap();
        assert_ne!(session.connection_state(), ConnectionState::Connected);

        session
            .with_engine(|engine| engine.add_node(Node::with_id("n1", "action", Point::new(100.0, 100.0))))
            .unwrap();
        session.flush_persistence().await.unwrap();
        session.shutdown().await.unwrap();

        let restored = Session::start(offline_config("room", "alice"), registry, Some(store as Arc<dyn DocumentStore>))
            .await
            .unwrap();
        assert!(restored.with_engine(|engine| engine.model().node("n1").is_some()));
        restored.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_persistence_failure_is_reported_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_writes(1);
        let mut config = offline_config("room", "bob");
        config.persistence.flush_interval = Duration::from_secs(60);
        let session = Session::start(
            config,
            Arc::new(NodeTypeRegistry::with_defaults()),
            Some(store.clone() as Arc<dyn DocumentStore>),
        )
        .await
        .unwrap();

        let errors = Arc::new(AtomicU64::new(0));
        let seen = errors.clone();
        let _sub = session.subscribe(move |event| {
            if matches!(event, SessionEvent::PersistenceError(_)) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        session
            .with_engine(|engine| engine.add_node(Node::with_id("n1", "action", Point::new(0.0, 0.0))))
            .unwrap();
        assert!(session.flush_persistence().await.is_err());
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        session.flush_persistence().await.unwrap();
        assert!(!store.load_updates("room").unwrap().is_empty());
        session.shutdown().await.unwrap();
    }
}
