//! Field-level differences between two graph models.
//!
//! A [`Change`] is what a command produced: the record before and after,
//! plus the replicated fields that differ. The replicated document consumes
//! changes to write only those fields; the operation log turns them into
//! audit records.

use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::model::{Comment, CommentId, Connection, ConnectionId, GraphModel, Node, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeField {
    Type,
    Position,
    Size,
    Style,
    /// One key of the property bag.
    Data(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionField {
    Source,
    Target,
    SourceHandle,
    TargetHandle,
    Label,
    Style,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommentField {
    Message,
    Position,
    Resolved,
}

impl fmt::Display for NodeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeField::Type => f.write_str("type"),
            NodeField::Position => f.write_str("position"),
            NodeField::Size => f.write_str("size"),
            NodeField::Style => f.write_str("style"),
            NodeField::Data(key) => write!(f, "data.{key}"),
        }
    }
}

impl fmt::Display for ConnectionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionField::Source => "source",
            ConnectionField::Target => "target",
            ConnectionField::SourceHandle => "sourceHandle",
            ConnectionField::TargetHandle => "targetHandle",
            ConnectionField::Label => "label",
            ConnectionField::Style => "style",
        })
    }
}

impl fmt::Display for CommentField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommentField::Message => "message",
            CommentField::Position => "position",
            CommentField::Resolved => "resolved",
        })
    }
}

/// Kind of record-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

/// One record-level change. `before == None` means added, `after == None`
/// means removed. `fields` lists the differing fields of an update and is
/// empty for additions and removals.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Node {
        id: NodeId,
        before: Option<Arc<Node>>,
        after: Option<Arc<Node>>,
        fields: Vec<NodeField>,
    },
    Connection {
        id: ConnectionId,
        before: Option<Arc<Connection>>,
        after: Option<Arc<Connection>>,
        fields: Vec<ConnectionField>,
    },
    Comment {
        id: CommentId,
        before: Option<Arc<Comment>>,
        after: Option<Arc<Comment>>,
        fields: Vec<CommentField>,
    },
}

impl Change {
    pub fn kind(&self) -> ChangeKind {
        let (had, has) = match self {
            Change::Node { before, after, .. } => (before.is_some(), after.is_some()),
            Change::Connection { before, after, .. } => (before.is_some(), after.is_some()),
            Change::Comment { before, after, .. } => (before.is_some(), after.is_some()),
        };
        match (had, has) {
            (false, _) => ChangeKind::Added,
            (true, true) => ChangeKind::Updated,
            (true, false) => ChangeKind::Removed,
        }
    }

    /// Id of the changed record.
    pub fn target(&self) -> &str {
        match self {
            Change::Node { id, .. } => id.as_str(),
            Change::Connection { id, .. } => id.as_str(),
            Change::Comment { id, .. } => id.as_str(),
        }
    }

    /// Names of the changed fields.
    pub fn field_names(&self) -> Vec<String> {
        match self {
            Change::Node { fields, .. } => fields.iter().map(ToString::to_string).collect(),
            Change::Connection { fields, .. } => fields.iter().map(ToString::to_string).collect(),
            Change::Comment { fields, .. } => fields.iter().map(ToString::to_string).collect(),
        }
    }

    /// JSON rendering of the record before and after the change.
    pub fn payloads(&self) -> (Option<Value>, Option<Value>) {
        fn json<T: serde::Serialize>(v: &Option<Arc<T>>) -> Option<Value> {
            v.as_ref().and_then(|r| serde_json::to_value(&**r).ok())
        }
        match self {
            Change::Node { before, after, .. } => (json(before), json(after)),
            Change::Connection { before, after, .. } => (json(before), json(after)),
            Change::Comment { before, after, .. } => (json(before), json(after)),
        }
    }
}

pub fn node_fields(a: &Node, b: &Node) -> Vec<NodeField> {
    let mut fields = Vec::new();
    if a.node_type != b.node_type {
        fields.push(NodeField::Type);
    }
    if a.position != b.position {
        fields.push(NodeField::Position);
    }
    if a.size != b.size {
        fields.push(NodeField::Size);
    }
    if a.style != b.style {
        fields.push(NodeField::Style);
    }
    let keys: BTreeSet<&String> = a.data.keys().chain(b.data.keys()).collect();
    for key in keys {
        if a.data.get(key) != b.data.get(key) {
            fields.push(NodeField::Data(key.clone()));
        }
    }
    fields
}

pub fn connection_fields(a: &Connection, b: &Connection) -> Vec<ConnectionField> {
    let mut fields = Vec::new();
    if a.source != b.source {
        fields.push(ConnectionField::Source);
    }
    if a.target != b.target {
        fields.push(ConnectionField::Target);
    }
    if a.source_handle != b.source_handle {
        fields.push(ConnectionField::SourceHandle);
    }
    if a.target_handle != b.target_handle {
        fields.push(ConnectionField::TargetHandle);
    }
    if a.label != b.label {
        fields.push(ConnectionField::Label);
    }
    if a.style != b.style {
        fields.push(ConnectionField::Style);
    }
    fields
}

pub fn comment_fields(a: &Comment, b: &Comment) -> Vec<CommentField> {
    let mut fields = Vec::new();
    if a.message != b.message {
        fields.push(CommentField::Message);
    }
    if a.position != b.position {
        fields.push(CommentField::Position);
    }
    if a.resolved != b.resolved {
        fields.push(CommentField::Resolved);
    }
    fields
}

/// Record-level changes that turn `before` into `after`.
///
/// Shared `Arc`s are skipped without comparison, and changes to the local
/// interaction flags alone produce nothing. Additions and updates come
/// first, then removals (connections before the nodes they touch).
pub fn diff_models(before: &GraphModel, after: &GraphModel) -> Vec<Change> {
    let mut changes = Vec::new();

    for (id, next) in &after.nodes {
        match before.nodes.get(id) {
            Some(prev) if Arc::ptr_eq(prev, next) => {}
            Some(prev) => {
                let fields = node_fields(prev, next);
                if !fields.is_empty() {
                    changes.push(Change::Node {
                        id: id.clone(),
                        before: Some(prev.clone()),
                        after: Some(next.clone()),
                        fields,
                    });
                }
            }
            None => changes.push(Change::Node {
                id: id.clone(),
                before: None,
                after: Some(next.clone()),
                fields: Vec::new(),
            }),
        }
    }

    for (id, next) in &after.connections {
        match before.connections.get(id) {
            Some(prev) if Arc::ptr_eq(prev, next) => {}
            Some(prev) => {
                let fields = connection_fields(prev, next);
                if !fields.is_empty() {
                    changes.push(Change::Connection {
                        id: id.clone(),
                        before: Some(prev.clone()),
                        after: Some(next.clone()),
                        fields,
                    });
                }
            }
            None => changes.push(Change::Connection {
                id: id.clone(),
                before: None,
                after: Some(next.clone()),
                fields: Vec::new(),
            }),
        }
    }

    for (id, next) in &after.comments {
        match before.comments.get(id) {
            Some(prev) if Arc::ptr_eq(prev, next) => {}
            Some(prev) => {
                let fields = comment_fields(prev, next);
                if !fields.is_empty() {
                    changes.push(Change::Comment {
                        id: id.clone(),
                        before: Some(prev.clone()),
                        after: Some(next.clone()),
                        fields,
                    });
                }
            }
            None => changes.push(Change::Comment {
                id: id.clone(),
                before: None,
                after: Some(next.clone()),
                fields: Vec::new(),
            }),
        }
    }

    for (id, prev) in &before.connections {
        if !after.connections.contains_key(id) {
            changes.push(Change::Connection {
                id: id.clone(),
                before: Some(prev.clone()),
                after: None,
                fields: Vec::new(),
            });
        }
    }
    for (id, prev) in &before.nodes {
        if !after.nodes.contains_key(id) {
            changes.push(Change::Node {
                id: id.clone(),
                before: Some(prev.clone()),
                after: None,
                fields: Vec::new(),
            });
        }
    }
    for (id, prev) in &before.comments {
        if !after.comments.contains_key(id) {
            changes.push(Change::Comment {
                id: id.clone(),
                before: Some(prev.clone()),
                after: None,
                fields: Vec::new(),
            });
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Point;

    fn model_with(nodes: &[Node]) -> GraphModel {
        let mut model = GraphModel::new();
        for n in nodes {
            model.nodes.insert(n.id.clone(), Arc::new(n.clone()));
        }
        model
    }

    #[test]
    fn test_diff_identical_models_is_empty() {
        let model = model_with(&[Node::with_id("a", "action", Point::ORIGIN)]);
        assert!(diff_models(&model, &model.clone()).is_empty());
    }

    #[test]
    fn test_diff_reports_data_keys_individually() {
        let a = Node::with_id("a", "action", Point::ORIGIN).with_data("label", "Old");
        let b = a.clone().with_data("label", "New").with_data("retries", 3);
        let changes = diff_models(&model_with(&[a]), &model_with(&[b]));

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind(), ChangeKind::Updated);
        assert_eq!(changes[0].field_names(), vec!["data.label", "data.retries"]);
    }

    #[test]
    fn test_diff_ignores_local_flags() {
        let a = Node::with_id("a", "action", Point::ORIGIN);
        let mut b = a.clone();
        b.selected = true;
        b.dragging = true;
        assert!(diff_models(&model_with(&[a]), &model_with(&[b])).is_empty());
    }

    #[test]
    fn test_diff_orders_connection_removal_before_node_removal() {
        let mut before = model_with(&[
            Node::with_id("a", "action", Point::ORIGIN),
            Node::with_id("b", "action", Point::ORIGIN),
        ]);
        let c = Connection::with_id("c", "a", "b");
        before.connections.insert(c.id.clone(), Arc::new(c));
        let after = model_with(&[Node::with_id("b", "action", Point::ORIGIN)]);

        let changes = diff_models(&before, &after);
        let kinds: Vec<(&str, ChangeKind)> = changes.iter().map(|c| (c.target(), c.kind())).collect();
        // "b" is a fresh Arc with equal content, so it is not reported.
        assert_eq!(kinds, vec![("c", ChangeKind::Removed), ("a", ChangeKind::Removed)]);
    }

    #[test]
    fn test_payloads_render_json() {
        let a = Node::with_id("a", "action", Point::new(5.0, 6.0));
        let changes = diff_models(&GraphModel::new(), &model_with(&[a]));
        let (before, after) = changes[0].payloads();
        assert!(before.is_none());
        assert_eq!(after.unwrap()["position"]["x"], 5.0);
    }
}
