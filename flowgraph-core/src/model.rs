//! Graph model records.
//!
//! A [`GraphModel`] is a persistent value: every collection maps ids to
//! `Arc` records, so producing the next model after a command clones only
//! the pointers and the records that actually changed. Snapshots held by
//! the history ring or by a renderer are never mutated in place.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

/// Free-form JSON property bag carried by nodes and used for styles.
pub type PropertyBag = Map<String, Value>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Opaque node identifier.
    NodeId
);
string_id!(
    /// Opaque connection identifier.
    ConnectionId
);
string_id!(
    /// Opaque comment identifier.
    CommentId
);

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ───────────────────────────────────────────────────────────────────
// Geometry
// ───────────────────────────────────────────────────────────────────

/// Position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn offset(&self, dx: f64, dy: f64) -> Point {
        Point::new(self.x + dx, self.y + dy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const ZERO: Size = Size { width: 0.0, height: 0.0 };

    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Finite and non-negative in both dimensions.
    pub fn is_valid(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width >= 0.0 && self.height >= 0.0
    }

    pub fn is_zero(&self) -> bool {
        self.width == 0.0 && self.height == 0.0
    }
}

// ───────────────────────────────────────────────────────────────────
// Records
// ───────────────────────────────────────────────────────────────────

/// A workflow node.
///
/// The interaction flags (`selected`, `dragging`, `resizing`) belong to the
/// local client only; they are never serialized and never replicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    pub position: Point,
    #[serde(default)]
    pub size: Size,
    #[serde(default)]
    pub data: PropertyBag,
    #[serde(default)]
    pub style: PropertyBag,
    #[serde(skip)]
    pub selected: bool,
    #[serde(skip)]
    pub dragging: bool,
    #[serde(skip)]
    pub resizing: bool,
}

impl Node {
    /// Create a node with a fresh id. A zero size is filled in from the
    /// node type registry when the node is added.
    pub fn new(node_type: impl Into<String>, position: Point) -> Self {
        Self::with_id(NodeId::new(), node_type, position)
    }

    pub fn with_id(id: impl Into<NodeId>, node_type: impl Into<String>, position: Point) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            position,
            size: Size::ZERO,
            data: PropertyBag::new(),
            style: PropertyBag::new(),
            selected: false,
            dragging: false,
            resizing: false,
        }
    }

    pub fn with_size(mut self, size: Size) -> Self {
        self.size = size;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_style(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.style.insert(key.into(), value.into());
        self
    }

    /// The `label` property, if it is a string.
    pub fn label(&self) -> Option<&str> {
        self.data.get("label").and_then(Value::as_str)
    }

    /// Equality over the replicated fields only.
    pub fn same_content(&self, other: &Node) -> bool {
        self.id == other.id
            && self.node_type == other.node_type
            && self.position == other.position
            && self.size == other.size
            && self.data == other.data
            && self.style == other.style
    }

    pub(crate) fn copy_local_flags(&mut self, from: &Node) {
        self.selected = from.selected;
        self.dragging = from.dragging;
        self.resizing = from.resizing;
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, rename = "sourceHandle")]
    pub source_handle: Option<String>,
    #[serde(default, rename = "targetHandle")]
    pub target_handle: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub style: PropertyBag,
    #[serde(skip)]
    pub selected: bool,
}

impl Connection {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self::with_id(ConnectionId::new(), source, target)
    }

    pub fn with_id(
        id: impl Into<ConnectionId>,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
            label: None,
            style: PropertyBag::new(),
            selected: false,
        }
    }

    pub fn with_handles(mut self, source: Option<String>, target: Option<String>) -> Self {
        self.source_handle = source;
        self.target_handle = target;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Whether either endpoint is `node`.
    pub fn touches(&self, node: &NodeId) -> bool {
        &self.source == node || &self.target == node
    }

    pub fn same_content(&self, other: &Connection) -> bool {
        self.id == other.id
            && self.source == other.source
            && self.target == other.target
            && self.source_handle == other.source_handle
            && self.target_handle == other.target_handle
            && self.label == other.label
            && self.style == other.style
    }
}

/// A canvas comment, optionally threaded under a parent comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    #[serde(default, rename = "parentId")]
    pub parent_id: Option<CommentId>,
    pub author: String,
    pub message: String,
    pub position: Point,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub resolved: bool,
}

impl Comment {
    pub fn new(author: impl Into<String>, message: impl Into<String>, position: Point) -> Self {
        Self {
            id: CommentId::new(),
            parent_id: None,
            author: author.into(),
            message: message.into(),
            position,
            timestamp: now_millis(),
            resolved: false,
        }
    }

    /// A reply anchored at the same position as its parent.
    pub fn reply_to(parent: &Comment, author: impl Into<String>, message: impl Into<String>) -> Self {
        let mut reply = Self::new(author, message, parent.position);
        reply.parent_id = Some(parent.id.clone());
        reply
    }

    pub fn with_id(mut self, id: impl Into<CommentId>) -> Self {
        self.id = id.into();
        self
    }
}

// ───────────────────────────────────────────────────────────────────
// Local-only state
// ───────────────────────────────────────────────────────────────────

/// Current selection of the local client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionState {
    pub nodes: IndexSet<NodeId>,
    pub connections: IndexSet<ConnectionId>,
    /// Rubber-band selection in progress.
    pub selecting: bool,
}

impl SelectionState {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.connections.is_empty()
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.contains(id)
    }

    pub fn contains_connection(&self, id: &str) -> bool {
        self.connections.contains(id)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.connections.clear();
    }
}

pub const MIN_ZOOM: f64 = 0.1;
pub const MAX_ZOOM: f64 = 4.0;

/// Pan offset and zoom factor of the local canvas.
///
/// `screen = canvas * zoom + (x, y)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, zoom: 1.0 }
    }
}

impl Viewport {
    pub fn new(x: f64, y: f64, zoom: f64) -> Self {
        Self { x, y, zoom: clamp_zoom(zoom) }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.zoom.is_finite()
    }

    /// Returns `false` and leaves the viewport alone when the result would
    /// not be finite.
    pub fn pan_by(&mut self, dx: f64, dy: f64) -> bool {
        let (x, y) = (self.x + dx, self.y + dy);
        if !x.is_finite() || !y.is_finite() {
            return false;
        }
        self.x = x;
        self.y = y;
        dx != 0.0 || dy != 0.0
    }

    /// Zoom by `factor`, keeping the canvas point under the screen-space
    /// `anchor` fixed.
    pub fn zoom_at(&mut self, factor: f64, anchor: Point) -> bool {
        if !factor.is_finite() || factor <= 0.0 || !anchor.is_finite() {
            return false;
        }
        let focus = self.screen_to_canvas(anchor);
        let zoom = clamp_zoom(self.zoom * factor);
        let next = Viewport { x: anchor.x - focus.x * zoom, y: anchor.y - focus.y * zoom, zoom };
        if !next.is_finite() || next == *self {
            return false;
        }
        *self = next;
        true
    }

    pub fn screen_to_canvas(&self, p: Point) -> Point {
        Point::new((p.x - self.x) / self.zoom, (p.y - self.y) / self.zoom)
    }

    pub fn canvas_to_screen(&self, p: Point) -> Point {
        Point::new(p.x * self.zoom + self.x, p.y * self.zoom + self.y)
    }
}

fn clamp_zoom(zoom: f64) -> f64 {
    if zoom.is_finite() {
        zoom.clamp(MIN_ZOOM, MAX_ZOOM)
    } else {
        1.0
    }
}

// ───────────────────────────────────────────────────────────────────
// Graph model
// ───────────────────────────────────────────────────────────────────

/// Immutable-by-convention graph snapshot.
///
/// Equality is order-independent and compares record contents, including
/// the local interaction flags; use [`GraphModel::same_document`] to compare
/// only what replicas share.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphModel {
    pub nodes: IndexMap<NodeId, Arc<Node>>,
    pub connections: IndexMap<ConnectionId, Arc<Connection>>,
    pub comments: IndexMap<CommentId, Arc<Comment>>,
}

impl GraphModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    pub fn connection(&self, id: &str) -> Option<&Arc<Connection>> {
        self.connections.get(id)
    }

    pub fn comment(&self, id: &str) -> Option<&Arc<Comment>> {
        self.comments.get(id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn comment_count(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.connections.is_empty() && self.comments.is_empty()
    }

    /// Connections with `node` as source or target.
    pub fn connections_of<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a Arc<Connection>> + 'a {
        self.connections.values().filter(move |c| c.touches(node))
    }

    /// Ids of connections whose source or target is missing.
    pub fn dangling_connections(&self) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| !self.nodes.contains_key(&c.source) || !self.nodes.contains_key(&c.target))
            .map(|c| c.id.clone())
            .collect()
    }

    /// Ids of `root` and every comment threaded below it.
    /// Each comment is visited once even if parent links form a loop.
    pub fn comment_thread(&self, root: &CommentId) -> Vec<CommentId> {
        let mut thread = IndexSet::new();
        thread.insert(root.clone());
        let mut i = 0;
        while let Some(parent) = thread.get_index(i).cloned() {
            for reply in self.comments.values().filter(|c| c.parent_id.as_ref() == Some(&parent)) {
                thread.insert(reply.id.clone());
            }
            i += 1;
        }
        thread.into_iter().collect()
    }

    /// Order-independent equality over replicated content only.
    pub fn same_document(&self, other: &GraphModel) -> bool {
        self.nodes.len() == other.nodes.len()
            && self.connections.len() == other.connections.len()
            && self.comments.len() == other.comments.len()
            && self
                .nodes
                .iter()
                .all(|(id, n)| other.nodes.get(id).is_some_and(|o| n.same_content(o)))
            && self
                .connections
                .iter()
                .all(|(id, c)| other.connections.get(id).is_some_and(|o| c.same_content(o)))
            && self
                .comments
                .iter()
                .all(|(id, c)| other.comments.get(id).is_some_and(|o| **c == **o))
    }
}
