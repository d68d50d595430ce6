//! `GraphEngine`: the single entry point for UI collaborators.
//!
//! Binds the [`CommandStore`], the [`ReplicatedDoc`] and the
//! [`OperationLog`]. Every successful mutation is committed to the replica
//! in one transaction, logged, and announced to subscribers:
//!
//! ```text
//!   command ──► CommandStore ──changes──► ReplicatedDoc (TxnOrigin::Local)
//!                                   │
//!                                   ├──► OperationLog
//!                                   └──► EngineEvent observers
//!
//!   remote update ──► ReplicatedDoc (TxnOrigin::Remote) ──► materialize
//!                                   └──► CommandStore::replace_model ──► observers
//! ```
//!
//! The engine is synchronous. Callers that share it across tasks wrap it
//! in a mutex and never hold the lock across an await point.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::change::{diff_models, Change};
use crate::collab::{ReplicaError, ReplicatedDoc, TxnOrigin, UpdateEvent};
use crate::command::{Command, CommandError, CommentPatch, ConnectionPatch, NodePatch};
use crate::model::{
    now_millis, Comment, CommentId, Connection, ConnectionId, GraphModel, Node, NodeId, Point,
    SelectionState, Viewport,
};
use crate::observer::{Observers, Subscription};
use crate::oplog::{Operation, OperationCause, OperationLog, RetentionPolicy};
use crate::registry::NodeTypeRegistry;
use crate::store::CommandStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Recorded as the actor of every logged operation.
    pub user_id: String,
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// Fixed yrs client id; random when `None`.
    #[serde(default)]
    pub client_id: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_id: "anonymous".to_string(),
            retention: RetentionPolicy::default(),
            client_id: None,
        }
    }
}

impl EngineConfig {
    pub fn for_testing(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            retention: RetentionPolicy::unbounded(),
            client_id: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    DocumentChanged { origin: TxnOrigin, changes: usize },
    SelectionChanged,
    ViewportChanged,
    HistoryChanged { can_undo: bool, can_redo: bool },
    OperationAppended(Operation),
}

pub struct GraphEngine {
    store: CommandStore,
    replica: ReplicatedDoc,
    oplog: OperationLog,
    config: EngineConfig,
    events: Observers<EngineEvent>,
}

impl GraphEngine {
    pub fn new(config: EngineConfig, registry: Arc<NodeTypeRegistry>) -> Self {
        let replica = match config.client_id {
            Some(id) => ReplicatedDoc::with_client_id(id),
            None => ReplicatedDoc::new(),
        };
        Self {
            store: CommandStore::new(registry),
            replica,
            oplog: OperationLog::new(config.retention),
            config,
            events: Observers::new(),
        }
    }

    /// Engine with the built-in node types.
    pub fn with_user(user_id: &str) -> Self {
        Self::new(
            EngineConfig {
                user_id: user_id.to_string(),
                ..EngineConfig::default()
            },
            Arc::new(NodeTypeRegistry::with_defaults()),
        )
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn model(&self) -> &GraphModel {
        self.store.model()
    }

    pub fn selection(&self) -> &SelectionState {
        self.store.selection()
    }

    pub fn viewport(&self) -> &Viewport {
        self.store.viewport()
    }

    pub fn store(&self) -> &CommandStore {
        &self.store
    }

    pub fn replica(&self) -> &ReplicatedDoc {
        &self.replica
    }

    pub fn oplog(&self) -> &OperationLog {
        &self.oplog
    }

    pub fn oplog_mut(&mut self) -> &mut OperationLog {
        &mut self.oplog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// Raw replica updates, local and merged, tagged with their origin.
    pub fn subscribe_updates<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        self.replica.observe(callback)
    }

    // ─── Commands ─────────────────────────────────────────────────────

    pub fn execute(&mut self, command: Command) -> Result<Vec<Change>, EngineError> {
        let name = command.name();
        let selection = self.store.selection().clone();
        let changes = self.store.apply(command)?;
        log::trace!("{name}: {} changes", changes.len());
        self.notify_selection(&selection);
        Ok(self.commit(changes, OperationCause::Command)?)
    }

    pub fn add_node(&mut self, node: Node) -> Result<Vec<Change>, EngineError> {
        let changes = self.store.add_node(node)?;
        Ok(self.commit(changes, OperationCause::Command)?)
    }

    pub fn update_node(&mut self, id: &NodeId, patch: NodePatch) -> Result<Vec<Change>, EngineError> {
        let changes = self.store.update_node(id, patch)?;
        Ok(self.commit(changes, OperationCause::Command)?)
    }

    pub fn delete_node(&mut self, id: &NodeId) -> Result<Vec<Change>, EngineError> {
        self.delete_nodes(std::slice::from_ref(id))
    }

    pub fn delete_nodes(&mut self, ids: &[NodeId]) -> Result<Vec<Change>, EngineError> {
        let selection = self.store.selection().clone();
        let changes = self.store.delete_nodes(ids);
        self.notify_selection(&selection);
        Ok(self.commit(changes, OperationCause::Command)?)
    }

    pub fn add_connection(&mut self, connection: Connection) -> Result<Vec<Change>, EngineError> {
        let changes = self.store.add_connection(connection)?;
        Ok(self.commit(changes, OperationCause::Command)?)
    }

    pub fn update_connection(
        &mut self,
        id: &ConnectionId,
        patch: ConnectionPatch,
    ) -> Result<Vec<Change>, EngineError> {
        let changes = self.store.update_connection(id, patch)?;
        Ok(self.commit(changes, OperationCause::Command)?)
    }

    pub fn delete_connection(&mut self, id: &ConnectionId) -> Result<Vec<Change>, EngineError> {
        let selection = self.store.selection().clone();
        let changes = self.store.delete_connection(id);
        self.notify_selection(&selection);
        Ok(self.commit(changes, OperationCause::Command)?)
    }

    pub fn add_comment(&mut self, comment: Comment) -> Result<Vec<Change>, EngineError> {
        let changes = self.store.add_comment(comment)?;
        Ok(self.commit(changes, OperationCause::Command)?)
    }

    pub fn update_comment(&mut self, id: &CommentId, patch: CommentPatch) -> Result<Vec<Change>, EngineError> {
        let changes = self.store.update_comment(id, patch)?;
        Ok(self.commit(changes, OperationCause::Command)?)
    }

    pub fn resolve_comment(&mut self, id: &CommentId, resolved: bool) -> Result<Vec<Change>, EngineError> {
        let changes = self.store.resolve_comment(id, resolved);
        Ok(self.commit(changes, OperationCause::Command)?)
    }

    pub fn delete_comment(&mut self, id: &CommentId) -> Result<Vec<Change>, EngineError> {
        let changes = self.store.delete_comment(id);
        Ok(self.commit(changes, OperationCause::Command)?)
    }

    /// Delete the selected nodes and connections.
    pub fn delete_selection(&mut self) -> Result<Vec<Change>, EngineError> {
        let selection = self.store.selection().clone();
        let changes = self.store.delete_selection();
        self.notify_selection(&selection);
        Ok(self.commit(changes, OperationCause::Command)?)
    }

    // ─── Selection & viewport ─────────────────────────────────────────

    pub fn select_nodes(&mut self, ids: &[NodeId], additive: bool) -> bool {
        let changed = self.store.select_nodes(ids, additive);
        self.selection_event(changed)
    }

    pub fn select_connections(&mut self, ids: &[ConnectionId], additive: bool) -> bool {
        let changed = self.store.select_connections(ids, additive);
        self.selection_event(changed)
    }

    pub fn clear_selection(&mut self) -> bool {
        let changed = self.store.clear_selection();
        self.selection_event(changed)
    }

    pub fn select_all(&mut self) -> bool {
        let changed = self.store.select_all();
        self.selection_event(changed)
    }

    pub fn set_selecting(&mut self, selecting: bool) -> bool {
        let changed = self.store.set_selecting(selecting);
        self.selection_event(changed)
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> bool {
        let changed = self.store.set_viewport(viewport);
        if changed {
            self.events.emit(&EngineEvent::ViewportChanged);
        }
        changed
    }

    pub fn pan_by(&mut self, dx: f64, dy: f64) -> bool {
        let changed = self.store.pan_by(dx, dy);
        if changed {
            self.events.emit(&EngineEvent::ViewportChanged);
        }
        changed
    }

    pub fn zoom_at(&mut self, factor: f64, anchor: Point) -> bool {
        let changed = self.store.zoom_at(factor, anchor);
        if changed {
            self.events.emit(&EngineEvent::ViewportChanged);
        }
        changed
    }

    // ─── History ──────────────────────────────────────────────────────

    pub fn save_state(&mut self) -> u64 {
        let seq = self.store.save_state();
        self.history_event();
        seq
    }

    /// Step back one snapshot and publish the difference as a new edit.
    /// Returns `false` when there is nothing to undo.
    pub fn undo(&mut self) -> Result<bool, EngineError> {
        self.step(OperationCause::Undo)
    }

    pub fn redo(&mut self) -> Result<bool, EngineError> {
        self.step(OperationCause::Redo)
    }

    pub fn can_undo(&self) -> bool {
        self.store.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.store.can_redo()
    }

    fn step(&mut self, cause: OperationCause) -> Result<bool, EngineError> {
        let selection = self.store.selection().clone();
        let changes = match cause {
            OperationCause::Redo => self.store.redo(),
            _ => self.store.undo(),
        };
        let Some(changes) = changes else {
            return Ok(false);
        };
        self.notify_selection(&selection);
        self.commit(changes, cause)?;
        self.history_event();
        Ok(true)
    }

    // ─── Replication ──────────────────────────────────────────────────

    /// Merge an update received from a peer (or any non-local source) and
    /// re-materialize the model. Returns the resulting record changes.
    pub fn apply_remote_update(&mut self, update: &[u8], origin: TxnOrigin) -> Result<Vec<Change>, ReplicaError> {
        self.replica.apply_update(update, origin)?;
        let next = self.replica.materialize(self.store.model());
        let changes = diff_models(self.store.model(), &next);
        if changes.is_empty() {
            return Ok(changes);
        }
        log::debug!("Merged {} remote changes ({origin})", changes.len());
        let selection_changed = self.store.replace_model(next);
        self.events.emit(&EngineEvent::DocumentChanged {
            origin,
            changes: changes.len(),
        });
        self.selection_event(selection_changed);
        Ok(changes)
    }

    /// Load persisted state. The restored model becomes the start of the
    /// undo history.
    pub fn restore(&mut self, update: &[u8]) -> Result<(), ReplicaError> {
        self.replica.apply_update(update, TxnOrigin::Restore)?;
        let model = self.replica.materialize(self.store.model());
        let viewport = *self.store.viewport();
        let mut store = CommandStore::with_model(self.store.registry().clone(), model);
        store.set_viewport(viewport);
        self.store = store;
        log::info!("Restored {} nodes from local state", self.store.model().node_count());
        self.events.emit(&EngineEvent::DocumentChanged {
            origin: TxnOrigin::Restore,
            changes: self.store.model().node_count()
                + self.store.model().connection_count()
                + self.store.model().comment_count(),
        });
        self.history_event();
        Ok(())
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.replica.encode_state()
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.replica.state_vector()
    }

    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        self.replica.encode_diff(remote_state_vector)
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn commit(&mut self, changes: Vec<Change>, cause: OperationCause) -> Result<Vec<Change>, ReplicaError> {
        if changes.is_empty() {
            return Ok(changes);
        }
        let origin = match cause {
            OperationCause::Command => TxnOrigin::Local,
            OperationCause::Undo | OperationCause::Redo => TxnOrigin::History,
        };
        if let Err(e) = self.replica.apply_changes(&changes, origin) {
            log::error!("Failed to replicate {} changes: {e}", changes.len());
            self.resync_from_replica();
            return Err(e);
        }

        let now = now_millis();
        for change in &changes {
            let op = Operation::from_change(change, &self.config.user_id, cause, now);
            self.oplog.append(op.clone());
            self.events.emit(&EngineEvent::OperationAppended(op));
        }
        if self.config.retention.max_age.is_some() {
            self.oplog.prune(now);
        }

        self.events.emit(&EngineEvent::DocumentChanged {
            origin,
            changes: changes.len(),
        });
        Ok(changes)
    }

    /// Make the live model match the replicated document again.
    fn resync_from_replica(&mut self) {
        let next = self.replica.materialize(self.store.model());
        let selection_changed = self.store.replace_model(next);
        self.selection_event(selection_changed);
    }

    fn notify_selection(&self, before: &SelectionState) {
        if before != self.store.selection() {
            self.events.emit(&EngineEvent::SelectionChanged);
        }
    }

    fn selection_event(&self, changed: bool) -> bool {
        if changed {
            self.events.emit(&EngineEvent::SelectionChanged);
        }
        changed
    }

    fn history_event(&self) {
        self.events.emit(&EngineEvent::HistoryChanged {
            can_undo: self.store.can_undo(),
            can_redo: self.store.can_redo(),
        });
    }
}
