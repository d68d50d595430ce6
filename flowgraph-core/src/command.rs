//! Typed mutation commands and their validation errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Comment, CommentId, Connection, ConnectionId, Node, NodeId, Point, PropertyBag, Size};

/// Partial update of a node. Unset fields are left untouched.
///
/// `data` entries are merged key by key; a `null` value removes the key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePatch {
    #[serde(default, rename = "type")]
    pub node_type: Option<String>,
    #[serde(default)]
    pub position: Option<Point>,
    #[serde(default)]
    pub size: Option<Size>,
    #[serde(default)]
    pub style: Option<PropertyBag>,
    #[serde(default)]
    pub data: PropertyBag,
    #[serde(skip)]
    pub dragging: Option<bool>,
    #[serde(skip)]
    pub resizing: Option<bool>,
}

impl NodePatch {
    pub fn position(position: Point) -> Self {
        Self { position: Some(position), ..Self::default() }
    }

    pub fn size(size: Size) -> Self {
        Self { size: Some(size), ..Self::default() }
    }

    pub fn data(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::default().with_data(key, value)
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    pub fn with_style(mut self, style: PropertyBag) -> Self {
        self.style = Some(style);
        self
    }

    pub fn dragging(dragging: bool) -> Self {
        Self { dragging: Some(dragging), ..Self::default() }
    }

    pub fn resizing(resizing: bool) -> Self {
        Self { resizing: Some(resizing), ..Self::default() }
    }
}

/// Partial update of a connection. The nested options of handles and
/// label distinguish "leave" (`None`) from "clear" (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPatch {
    #[serde(default)]
    pub source: Option<NodeId>,
    #[serde(default)]
    pub target: Option<NodeId>,
    #[serde(default)]
    pub source_handle: Option<Option<String>>,
    #[serde(default)]
    pub target_handle: Option<Option<String>>,
    #[serde(default)]
    pub label: Option<Option<String>>,
    #[serde(default)]
    pub style: Option<PropertyBag>,
}

impl ConnectionPatch {
    pub fn label(label: Option<String>) -> Self {
        Self { label: Some(label), ..Self::default() }
    }

    pub fn endpoints(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: Some(source.into()),
            target: Some(target.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommentPatch {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub position: Option<Point>,
    #[serde(default)]
    pub resolved: Option<bool>,
}

/// A replicated mutation, as issued by toolbar, palette and property
/// collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    AddNode { node: Node },
    UpdateNode { id: NodeId, patch: NodePatch },
    DeleteNodes { ids: Vec<NodeId> },
    AddConnection { connection: Connection },
    UpdateConnection { id: ConnectionId, patch: ConnectionPatch },
    DeleteConnection { id: ConnectionId },
    AddComment { comment: Comment },
    UpdateComment { id: CommentId, patch: CommentPatch },
    DeleteComment { id: CommentId },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::AddNode { .. } => "add_node",
            Command::UpdateNode { .. } => "update_node",
            Command::DeleteNodes { .. } => "delete_nodes",
            Command::AddConnection { .. } => "add_connection",
            Command::UpdateConnection { .. } => "update_connection",
            Command::DeleteConnection { .. } => "delete_connection",
            Command::AddComment { .. } => "add_comment",
            Command::UpdateComment { .. } => "update_comment",
            Command::DeleteComment { .. } => "delete_comment",
        }
    }
}

/// Rejection of a malformed command. References to unknown ids in
/// update and delete commands are no-ops, not errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("Empty {0} id")]
    EmptyId(&'static str),
    #[error("Node already exists: {0}")]
    DuplicateNode(NodeId),
    #[error("Connection already exists: {0}")]
    DuplicateConnection(ConnectionId),
    #[error("Comment already exists: {0}")]
    DuplicateComment(CommentId),
    #[error("Connection {connection} references missing node {node}")]
    MissingEndpoint { connection: ConnectionId, node: NodeId },
    #[error("Invalid geometry for node {node}: {reason}")]
    InvalidGeometry { node: NodeId, reason: &'static str },
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),
    #[error("Comment message must not be empty")]
    EmptyComment,
    #[error("Comment {comment} replies to missing comment {parent}")]
    UnknownParent { comment: CommentId, parent: CommentId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_json_shape() {
        let cmd = Command::UpdateNode {
            id: NodeId::from("n1"),
            patch: NodePatch::data("label", "Start"),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["op"], "update_node");
        assert_eq!(json["id"], "n1");
        assert_eq!(json["patch"]["data"]["label"], "Start");

        let back: Command = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
        assert_eq!(back.name(), "update_node");
    }

    #[test]
    fn test_error_messages() {
        let err = CommandError::MissingEndpoint {
            connection: ConnectionId::from("c1"),
            node: NodeId::from("ghost"),
        };
        assert_eq!(err.to_string(), "Connection c1 references missing node ghost");
        assert_eq!(CommandError::EmptyId("node").to_string(), "Empty node id");
    }
}
