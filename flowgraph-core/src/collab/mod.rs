//! Replicated document backed by a yrs `Doc`.
//!
//! Layout:
//! ```text
//! nodes:       Map<node id,       Map{ type, position, size, style, data: Map<key, json> }>
//! connections: Map<connection id, Map{ source, target, sourceHandle, targetHandle, label, style }>
//! comments:    Map<comment id,    Map{ parentId, author, message, position, timestamp, resolved }>
//! ```
//!
//! Every record is a nested map with one entry per field (and one per data
//! key), so concurrent edits of different fields merge instead of
//! overwriting each other. Leaf values are JSON strings.
//!
//! Removing a record drops its nested map; yrs keeps the tombstone, and
//! writes that race the removal are integrated into the deleted map and
//! never become visible again. An update for a record that is not in the
//! replica is skipped rather than recreating it.

mod origin;

pub use origin::{TxnOrigin, UpdateEvent};

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::Arc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapPrelim, MapRef, Out, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::change::{Change, CommentField, ConnectionField, NodeField};
use crate::model::{Comment, CommentId, Connection, ConnectionId, GraphModel, Node, NodeId, Point};
use crate::observer::{Observers, Subscription};

const NODES: &str = "nodes";
const CONNECTIONS: &str = "connections";
const COMMENTS: &str = "comments";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplicaError {
    #[error("Malformed update: {0}")]
    Decode(String),
    #[error("Failed to integrate update: {0}")]
    Apply(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<yrs::encoding::read::Error> for ReplicaError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        ReplicaError::Decode(e.to_string())
    }
}

pub struct ReplicatedDoc {
    doc: Doc,
    nodes: MapRef,
    connections: MapRef,
    comments: MapRef,
    observers: Observers<UpdateEvent>,
}

impl Default for ReplicatedDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedDoc {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Fixed yrs client id, for deterministic tests.
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        let nodes = doc.get_or_insert_map(NODES);
        let connections = doc.get_or_insert_map(CONNECTIONS);
        let comments = doc.get_or_insert_map(COMMENTS);
        Self {
            doc,
            nodes,
            connections,
            comments,
            observers: Observers::new(),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Observe every committed transaction, local or merged.
    pub fn observe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    /// Write command changes in a single transaction tagged with `origin`.
    /// Returns the resulting update, or `None` when there was nothing to
    /// write.
    pub fn apply_changes(
        &self,
        changes: &[Change],
        origin: TxnOrigin,
    ) -> Result<Option<Arc<Vec<u8>>>, ReplicaError> {
        if changes.is_empty() {
            return Ok(None);
        }
        // A yrs transaction cannot be rolled back, so whatever was written
        // before a failure is still published to keep peers in step.
        let (update, written) = {
            let mut txn = self.doc.transact_mut_with(origin.tag().as_str());
            let written = changes.iter().try_for_each(|change| self.write_change(&mut txn, change));
            (txn.encode_update_v1(), written)
        };
        let update = Arc::new(update);
        log::trace!("Committed {} changes ({} bytes, origin {origin})", changes.len(), update.len());
        self.observers.emit(&UpdateEvent { origin, update: update.clone() });
        written?;
        Ok(Some(update))
    }

    /// Merge an encoded update (full state or delta). Duplicates and
    /// out-of-order deliveries are absorbed by yrs.
    pub fn apply_update(&self, update: &[u8], origin: TxnOrigin) -> Result<(), ReplicaError> {
        let decoded = Update::decode_v1(update)?;
        {
            let mut txn = self.doc.transact_mut_with(origin.tag().as_str());
            txn.apply_update(decoded).map_err(|e| ReplicaError::Apply(e.to_string()))?;
        }
        self.observers.emit(&UpdateEvent { origin, update: Arc::new(update.to_vec()) });
        Ok(())
    }

    /// Encoded state vector ("what I have seen").
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Full state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything a peer with `remote_state_vector` is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = StateVector::decode_v1(remote_state_vector)?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    pub fn node_count(&self) -> u32 {
        self.nodes.len(&self.doc.transact())
    }

    /// Build a graph model from the current document state.
    ///
    /// Records whose replicated content equals the one in `previous` keep
    /// the previous `Arc`; changed records inherit the local interaction
    /// flags. Previous ordering is kept and new records follow in id order.
    /// Connections with a missing endpoint are left out.
    pub fn materialize(&self, previous: &GraphModel) -> GraphModel {
        let txn = self.doc.transact();

        let mut nodes = BTreeMap::new();
        for (id, value) in self.nodes.iter(&txn) {
            if let Out::YMap(entry) = value {
                if let Some(node) = read_node(&txn, id, &entry) {
                    nodes.insert(node.id.clone(), node);
                }
            }
        }

        let mut connections = BTreeMap::new();
        for (id, value) in self.connections.iter(&txn) {
            if let Out::YMap(entry) = value {
                if let Some(connection) = read_connection(&txn, id, &entry) {
                    if nodes.contains_key(&connection.source) && nodes.contains_key(&connection.target) {
                        connections.insert(connection.id.clone(), connection);
                    }
                }
            }
        }

        let mut comments = BTreeMap::new();
        for (id, value) in self.comments.iter(&txn) {
            if let Out::YMap(entry) = value {
                if let Some(comment) = read_comment(&txn, id, &entry) {
                    comments.insert(comment.id.clone(), comment);
                }
            }
        }

        break_parent_cycles(&mut comments);

        GraphModel {
            nodes: reconcile(&previous.nodes, nodes, Node::same_content, |n, prev| n.copy_local_flags(prev)),
            connections: reconcile(&previous.connections, connections, Connection::same_content, |c, prev| {
                c.selected = prev.selected
            }),
            comments: reconcile(&previous.comments, comments, |a, b| a == b, |_, _| {}),
        }
    }

    // ─── Writes ───────────────────────────────────────────────────────

    fn write_change(&self, txn: &mut TransactionMut, change: &Change) -> Result<(), ReplicaError> {
        match change {
            Change::Node { id, after: None, .. } => {
                self.nodes.remove(txn, id.as_str());
            }
            Change::Node { after: Some(node), before: None, .. } => self.write_node(txn, node)?,
            Change::Node { id, after: Some(node), fields, .. } => {
                let Some(entry) = child(&self.nodes, &*txn, id.as_str()) else {
                    log::debug!("Node {id} is not in the replica, skipping update");
                    return Ok(());
                };
                for field in fields {
                    match field {
                        NodeField::Type => put(&entry, txn, "type", &node.node_type)?,
                        NodeField::Position => put(&entry, txn, "position", &node.position)?,
                        NodeField::Size => put(&entry, txn, "size", &node.size)?,
                        NodeField::Style => put(&entry, txn, "style", &node.style)?,
                        NodeField::Data(key) => {
                            let data = match child(&entry, &*txn, "data") {
                                Some(data) => data,
                                None => entry.insert(txn, "data", MapPrelim::default()),
                            };
                            match node.data.get(key) {
                                Some(value) => put(&data, txn, key, value)?,
                                None => {
                                    data.remove(txn, key);
                                }
                            }
                        }
                    }
                }
            }
            Change::Connection { id, after: None, .. } => {
                self.connections.remove(txn, id.as_str());
            }
            Change::Connection { after: Some(c), before: None, .. } => {
                let entry = self.connections.insert(txn, c.id.as_str(), MapPrelim::default());
                for field in ALL_CONNECTION_FIELDS {
                    write_connection_field(&entry, txn, c, field)?;
                }
            }
            Change::Connection { id, after: Some(c), fields, .. } => {
                let Some(entry) = child(&self.connections, &*txn, id.as_str()) else {
                    log::debug!("Connection {id} is not in the replica, skipping update");
                    return Ok(());
                };
                for field in fields {
                    write_connection_field(&entry, txn, c, *field)?;
                }
            }
            Change::Comment { id, after: None, .. } => {
                self.comments.remove(txn, id.as_str());
            }
            Change::Comment { after: Some(c), before: None, .. } => {
                let entry = self.comments.insert(txn, c.id.as_str(), MapPrelim::default());
                put(&entry, txn, "parentId", &c.parent_id)?;
                put(&entry, txn, "author", &c.author)?;
                put(&entry, txn, "timestamp", &c.timestamp)?;
                for field in [CommentField::Message, CommentField::Position, CommentField::Resolved] {
                    write_comment_field(&entry, txn, c, field)?;
                }
            }
            Change::Comment { id, after: Some(c), fields, .. } => {
                let Some(entry) = child(&self.comments, &*txn, id.as_str()) else {
                    log::debug!("Comment {id} is not in the replica, skipping update");
                    return Ok(());
                };
                for field in fields {
                    write_comment_field(&entry, txn, c, *field)?;
                }
            }
        }
        Ok(())
    }

    fn write_node(&self, txn: &mut TransactionMut, node: &Node) -> Result<(), ReplicaError> {
        let entry = self.nodes.insert(txn, node.id.as_str(), MapPrelim::default());
        put(&entry, txn, "type", &node.node_type)?;
        put(&entry, txn, "position", &node.position)?;
        put(&entry, txn, "size", &node.size)?;
        put(&entry, txn, "style", &node.style)?;
        let data = entry.insert(txn, "data", MapPrelim::default());
        for (key, value) in &node.data {
            put(&data, txn, key, value)?;
        }
        Ok(())
    }
}

const ALL_CONNECTION_FIELDS: [ConnectionField; 6] = [
    ConnectionField::Source,
    ConnectionField::Target,
    ConnectionField::SourceHandle,
    ConnectionField::TargetHandle,
    ConnectionField::Label,
    ConnectionField::Style,
];

fn write_connection_field(
    entry: &MapRef,
    txn: &mut TransactionMut,
    c: &Connection,
    field: ConnectionField,
) -> Result<(), ReplicaError> {
    match field {
        ConnectionField::Source => put(entry, txn, "source", &c.source),
        ConnectionField::Target => put(entry, txn, "target", &c.target),
        ConnectionField::SourceHandle => put(entry, txn, "sourceHandle", &c.source_handle),
        ConnectionField::TargetHandle => put(entry, txn, "targetHandle", &c.target_handle),
        ConnectionField::Label => put(entry, txn, "label", &c.label),
        ConnectionField::Style => put(entry, txn, "style", &c.style),
    }
}

fn write_comment_field(
    entry: &MapRef,
    txn: &mut TransactionMut,
    c: &Comment,
    field: CommentField,
) -> Result<(), ReplicaError> {
    match field {
        CommentField::Message => put(entry, txn, "message", &c.message),
        CommentField::Position => put(entry, txn, "position", &c.position),
        CommentField::Resolved => put(entry, txn, "resolved", &c.resolved),
    }
}

// ─── Field encoding ──────────────────────────────────────────────────

fn put<T: Serialize + ?Sized>(
    map: &MapRef,
    txn: &mut TransactionMut,
    key: &str,
    value: &T,
) -> Result<(), ReplicaError> {
    let json = serde_json::to_string(value).map_err(|e| ReplicaError::Serialization(e.to_string()))?;
    map.insert(txn, key, json);
    Ok(())
}

fn read<T: DeserializeOwned, Tx: ReadTxn>(map: &MapRef, txn: &Tx, key: &str) -> Option<T> {
    match map.get(txn, key)? {
        Out::Any(Any::String(s)) => serde_json::from_str(&s).ok(),
        _ => None,
    }
}

fn child<Tx: ReadTxn>(map: &MapRef, txn: &Tx, key: &str) -> Option<MapRef> {
    match map.get(txn, key)? {
        Out::YMap(m) => Some(m),
        _ => None,
    }
}

fn read_node<Tx: ReadTxn>(txn: &Tx, id: &str, entry: &MapRef) -> Option<Node> {
    let node_type: String = read(entry, txn, "type")?;
    let position: Point = read(entry, txn, "position")?;
    let mut node = Node::with_id(NodeId::from(id), node_type, position);
    node.size = read(entry, txn, "size").unwrap_or_default();
    node.style = read(entry, txn, "style").unwrap_or_default();
    if let Some(data) = child(entry, txn, "data") {
        for (key, value) in data.iter(txn) {
            if let Out::Any(Any::String(s)) = value {
                if let Ok(v) = serde_json::from_str(&s) {
                    node.data.insert(key.to_string(), v);
                }
            }
        }
    }
    Some(node)
}

fn read_connection<Tx: ReadTxn>(txn: &Tx, id: &str, entry: &MapRef) -> Option<Connection> {
    let source: NodeId = read(entry, txn, "source")?;
    let target: NodeId = read(entry, txn, "target")?;
    let mut connection = Connection::with_id(ConnectionId::from(id), source, target);
    connection.source_handle = read(entry, txn, "sourceHandle").unwrap_or_default();
    connection.target_handle = read(entry, txn, "targetHandle").unwrap_or_default();
    connection.label = read(entry, txn, "label").unwrap_or_default();
    connection.style = read(entry, txn, "style").unwrap_or_default();
    Some(connection)
}

fn read_comment<Tx: ReadTxn>(txn: &Tx, id: &str, entry: &MapRef) -> Option<Comment> {
    Some(Comment {
        id: CommentId::from(id),
        parent_id: read(entry, txn, "parentId").unwrap_or_default(),
        author: read(entry, txn, "author")?,
        message: read(entry, txn, "message")?,
        position: read(entry, txn, "position").unwrap_or_default(),
        timestamp: read(entry, txn, "timestamp").unwrap_or_default(),
        resolved: read(entry, txn, "resolved").unwrap_or_default(),
    })
}

/// Concurrent re-parenting can merge into a loop of replies. Every loop is
/// cut at its smallest id, so all replicas agree on the resulting roots.
fn break_parent_cycles(comments: &mut BTreeMap<CommentId, Comment>) {
    let ids: Vec<CommentId> = comments.keys().cloned().collect();
    for start in ids {
        let mut path: Vec<CommentId> = Vec::new();
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            if let Some(pos) = path.iter().position(|seen| *seen == id) {
                if let Some(root) = path[pos..].iter().min().cloned() {
                    log::debug!("Comment {root} closes a reply loop, treating it as a root");
                    if let Some(comment) = comments.get_mut(&root) {
                        comment.parent_id = None;
                    }
                }
                break;
            }
            cursor = comments.get(&id).and_then(|c| c.parent_id.clone());
            path.push(id);
        }
    }
}

/// Order and share freshly read records against the previous collection.
fn reconcile<K, T>(
    previous: &IndexMap<K, Arc<T>>,
    mut fresh: BTreeMap<K, T>,
    same: impl Fn(&T, &T) -> bool,
    adopt: impl Fn(&mut T, &T),
) -> IndexMap<K, Arc<T>>
where
    K: Ord + Hash + Eq + Clone,
{
    let mut out = IndexMap::with_capacity(fresh.len());
    for (id, prev) in previous {
        if let Some(mut record) = fresh.remove(id) {
            if same(prev, &record) {
                out.insert(id.clone(), prev.clone());
            } else {
                adopt(&mut record, prev);
                out.insert(id.clone(), Arc::new(record));
            }
        }
    }
    for (id, record) in fresh {
        out.insert(id, Arc::new(record));
    }
    out
}
