//! Command store: the local state machine over the graph model.
//!
//! Every mutation validates against the current model, builds the next
//! model by structural update and returns the [`Change`]s it produced. An
//! empty change list means the call was a no-op (unknown id, unchanged
//! value). Undo granularity is up to the caller: nothing is recorded in
//! the history ring until [`CommandStore::save_state`] is called.

use std::sync::Arc;

use crate::change::{diff_models, Change};
use crate::command::{Command, CommandError, CommentPatch, ConnectionPatch, NodePatch};
use crate::history::History;
use crate::model::{
    Comment, CommentId, Connection, ConnectionId, GraphModel, Node, NodeId, Point, SelectionState,
    Viewport,
};
use crate::registry::NodeTypeRegistry;

pub struct CommandStore {
    model: GraphModel,
    selection: SelectionState,
    viewport: Viewport,
    history: History,
    registry: Arc<NodeTypeRegistry>,
}

impl CommandStore {
    pub fn new(registry: Arc<NodeTypeRegistry>) -> Self {
        Self::with_model(registry, GraphModel::new())
    }

    /// Start from `model`; it becomes the oldest history entry.
    pub fn with_model(registry: Arc<NodeTypeRegistry>, model: GraphModel) -> Self {
        Self {
            history: History::new(model.clone()),
            model,
            selection: SelectionState::default(),
            viewport: Viewport::default(),
            registry,
        }
    }

    pub fn model(&self) -> &GraphModel {
        &self.model
    }

    pub fn selection(&self) -> &SelectionState {
        &self.selection
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn registry(&self) -> &Arc<NodeTypeRegistry> {
        &self.registry
    }

    /// Dispatch a typed command to the matching operation.
    pub fn apply(&mut self, command: Command) -> Result<Vec<Change>, CommandError> {
        match command {
            Command::AddNode { node } => self.add_node(node),
            Command::UpdateNode { id, patch } => self.update_node(&id, patch),
            Command::DeleteNodes { ids } => Ok(self.delete_nodes(&ids)),
            Command::AddConnection { connection } => self.add_connection(connection),
            Command::UpdateConnection { id, patch } => self.update_connection(&id, patch),
            Command::DeleteConnection { id } => Ok(self.delete_connection(&id)),
            Command::AddComment { comment } => self.add_comment(comment),
            Command::UpdateComment { id, patch } => self.update_comment(&id, patch),
            Command::DeleteComment { id } => Ok(self.delete_comment(&id)),
        }
    }

    // ─── Nodes ────────────────────────────────────────────────────────

    pub fn add_node(&mut self, mut node: Node) -> Result<Vec<Change>, CommandError> {
        if node.id.is_empty() {
            return Err(CommandError::EmptyId("node"));
        }
        if self.model.contains_node(node.id.as_str()) {
            return Err(CommandError::DuplicateNode(node.id));
        }
        self.registry.validate(&node.node_type)?;
        check_geometry(&node)?;
        if node.size.is_zero() {
            node.size = self.registry.default_size(&node.node_type);
        }
        node.selected = false;

        let mut next = self.model.clone();
        next.nodes.insert(node.id.clone(), Arc::new(node));
        Ok(self.commit(next))
    }

    pub fn update_node(&mut self, id: &NodeId, patch: NodePatch) -> Result<Vec<Change>, CommandError> {
        let Some(current) = self.model.node(id.as_str()) else {
            log::debug!("update_node: unknown node {id}, ignoring");
            return Ok(Vec::new());
        };

        let mut node = Node::clone(current);
        if let Some(node_type) = patch.node_type {
            self.registry.validate(&node_type)?;
            node.node_type = node_type;
        }
        if let Some(position) = patch.position {
            node.position = position;
        }
        if let Some(size) = patch.size {
            node.size = size;
        }
        if let Some(style) = patch.style {
            node.style = style;
        }
        for (key, value) in patch.data {
            if value.is_null() {
                node.data.remove(&key);
            } else {
                node.data.insert(key, value);
            }
        }
        if let Some(dragging) = patch.dragging {
            node.dragging = dragging;
        }
        if let Some(resizing) = patch.resizing {
            node.resizing = resizing;
        }
        check_geometry(&node)?;

        if node == **current {
            return Ok(Vec::new());
        }
        let mut next = self.model.clone();
        next.nodes.insert(id.clone(), Arc::new(node));
        Ok(self.commit(next))
    }

    pub fn delete_node(&mut self, id: &NodeId) -> Vec<Change> {
        self.delete_nodes(std::slice::from_ref(id))
    }

    /// Delete nodes and, in the same step, every connection touching them.
    pub fn delete_nodes(&mut self, ids: &[NodeId]) -> Vec<Change> {
        if !ids.iter().any(|id| self.model.contains_node(id.as_str())) {
            return Vec::new();
        }
        let mut next = self.model.clone();
        for id in ids {
            next.nodes.shift_remove(id.as_str());
        }
        self.cascade(next)
    }

    // ─── Connections ──────────────────────────────────────────────────

    pub fn add_connection(&mut self, mut connection: Connection) -> Result<Vec<Change>, CommandError> {
        if connection.id.is_empty() {
            return Err(CommandError::EmptyId("connection"));
        }
        if self.model.connections.contains_key(&connection.id) {
            return Err(CommandError::DuplicateConnection(connection.id));
        }
        self.check_endpoints(&connection)?;
        connection.selected = false;

        let mut next = self.model.clone();
        next.connections.insert(connection.id.clone(), Arc::new(connection));
        Ok(self.commit(next))
    }

    pub fn update_connection(
        &mut self,
        id: &ConnectionId,
        patch: ConnectionPatch,
    ) -> Result<Vec<Change>, CommandError> {
        let Some(current) = self.model.connection(id.as_str()) else {
            log::debug!("update_connection: unknown connection {id}, ignoring");
            return Ok(Vec::new());
        };

        let mut connection = Connection::clone(current);
        if let Some(source) = patch.source {
            connection.source = source;
        }
        if let Some(target) = patch.target {
            connection.target = target;
        }
        if let Some(handle) = patch.source_handle {
            connection.source_handle = handle;
        }
        if let Some(handle) = patch.target_handle {
            connection.target_handle = handle;
        }
        if let Some(label) = patch.label {
            connection.label = label;
        }
        if let Some(style) = patch.style {
            connection.style = style;
        }
        self.check_endpoints(&connection)?;

        if connection == **current {
            return Ok(Vec::new());
        }
        let mut next = self.model.clone();
        next.connections.insert(id.clone(), Arc::new(connection));
        Ok(self.commit(next))
    }

    pub fn delete_connection(&mut self, id: &ConnectionId) -> Vec<Change> {
        if !self.model.connections.contains_key(id) {
            return Vec::new();
        }
        let mut next = self.model.clone();
        next.connections.shift_remove(id);
        self.selection.connections.shift_remove(id);
        self.commit(next)
    }

    // ─── Comments ─────────────────────────────────────────────────────

    pub fn add_comment(&mut self, comment: Comment) -> Result<Vec<Change>, CommandError> {
        if comment.id.is_empty() {
            return Err(CommandError::EmptyId("comment"));
        }
        if self.model.comments.contains_key(&comment.id) {
            return Err(CommandError::DuplicateComment(comment.id));
        }
        if comment.message.trim().is_empty() {
            return Err(CommandError::EmptyComment);
        }
        if let Some(parent) = &comment.parent_id {
            if !self.model.comments.contains_key(parent) {
                return Err(CommandError::UnknownParent {
                    comment: comment.id.clone(),
                    parent: parent.clone(),
                });
            }
        }

        let mut next = self.model.clone();
        next.comments.insert(comment.id.clone(), Arc::new(comment));
        Ok(self.commit(next))
    }

    pub fn update_comment(&mut self, id: &CommentId, patch: CommentPatch) -> Result<Vec<Change>, CommandError> {
        let Some(current) = self.model.comment(id.as_str()) else {
            return Ok(Vec::new());
        };
        let mut comment = Comment::clone(current);
        if let Some(message) = patch.message {
            if message.trim().is_empty() {
                return Err(CommandError::EmptyComment);
            }
            comment.message = message;
        }
        if let Some(position) = patch.position {
            comment.position = position;
        }
        if let Some(resolved) = patch.resolved {
            comment.resolved = resolved;
        }
        if comment == **current {
            return Ok(Vec::new());
        }
        let mut next = self.model.clone();
        next.comments.insert(id.clone(), Arc::new(comment));
        Ok(self.commit(next))
    }

    pub fn resolve_comment(&mut self, id: &CommentId, resolved: bool) -> Vec<Change> {
        self.update_comment(id, CommentPatch { resolved: Some(resolved), ..CommentPatch::default() })
            .unwrap_or_default()
    }

    /// Delete a comment together with its replies.
    pub fn delete_comment(&mut self, id: &CommentId) -> Vec<Change> {
        if !self.model.comments.contains_key(id) {
            return Vec::new();
        }
        let mut next = self.model.clone();
        for doomed in self.model.comment_thread(id) {
            next.comments.shift_remove(&doomed);
        }
        self.commit(next)
    }

    // ─── Selection ────────────────────────────────────────────────────

    /// Select nodes; unknown ids are ignored. Returns whether the selection
    /// changed.
    pub fn select_nodes(&mut self, ids: &[NodeId], additive: bool) -> bool {
        let before = self.selection.clone();
        if !additive {
            self.selection.clear();
        }
        for id in ids {
            if self.model.contains_node(id.as_str()) {
                self.selection.nodes.insert(id.clone());
            }
        }
        self.finish_selection(before)
    }

    pub fn select_connections(&mut self, ids: &[ConnectionId], additive: bool) -> bool {
        let before = self.selection.clone();
        if !additive {
            self.selection.clear();
        }
        for id in ids {
            if self.model.connections.contains_key(id) {
                self.selection.connections.insert(id.clone());
            }
        }
        self.finish_selection(before)
    }

    pub fn clear_selection(&mut self) -> bool {
        let before = self.selection.clone();
        self.selection.clear();
        self.finish_selection(before)
    }

    pub fn select_all(&mut self) -> bool {
        let before = self.selection.clone();
        self.selection.nodes = self.model.nodes.keys().cloned().collect();
        self.selection.connections = self.model.connections.keys().cloned().collect();
        self.finish_selection(before)
    }

    pub fn set_selecting(&mut self, selecting: bool) -> bool {
        let changed = self.selection.selecting != selecting;
        self.selection.selecting = selecting;
        changed
    }

    /// Delete every selected node and connection.
    pub fn delete_selection(&mut self) -> Vec<Change> {
        let mut next = self.model.clone();
        for id in &self.selection.connections {
            next.connections.shift_remove(id);
        }
        for id in &self.selection.nodes {
            next.nodes.shift_remove(id);
        }
        self.cascade(next)
    }

    // ─── Viewport ─────────────────────────────────────────────────────

    /// Non-finite coordinates are rejected.
    pub fn set_viewport(&mut self, viewport: Viewport) -> bool {
        if !viewport.x.is_finite() || !viewport.y.is_finite() {
            log::debug!("set_viewport: non-finite position, ignoring");
            return false;
        }
        let viewport = Viewport::new(viewport.x, viewport.y, viewport.zoom);
        let changed = viewport != self.viewport;
        self.viewport = viewport;
        changed
    }

    pub fn pan_by(&mut self, dx: f64, dy: f64) -> bool {
        self.viewport.pan_by(dx, dy)
    }

    pub fn zoom_at(&mut self, factor: f64, anchor: Point) -> bool {
        self.viewport.zoom_at(factor, anchor)
    }

    // ─── History ──────────────────────────────────────────────────────

    /// Push the current model onto the history ring.
    pub fn save_state(&mut self) -> u64 {
        self.history.save(&self.model)
    }

    /// Step back one snapshot. `None` at the start of the ring.
    pub fn undo(&mut self) -> Option<Vec<Change>> {
        let snapshot = self.history.undo()?.model.clone();
        Some(self.restore_snapshot(&snapshot))
    }

    /// Step forward one snapshot. `None` at the end of the ring.
    pub fn redo(&mut self) -> Option<Vec<Change>> {
        let snapshot = self.history.redo()?.model.clone();
        Some(self.restore_snapshot(&snapshot))
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    // ─── Remote state ─────────────────────────────────────────────────

    /// Replace the live model with one materialized from the replicated
    /// document. Selection entries for vanished records are dropped.
    /// Returns whether the selection changed.
    pub fn replace_model(&mut self, model: GraphModel) -> bool {
        let before = self.selection.clone();
        self.model = model;
        self.prune_selection();
        self.sync_selection_flags();
        before != self.selection
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn commit(&mut self, mut next: GraphModel) -> Vec<Change> {
        let changes = diff_models(&self.model, &next);
        std::mem::swap(&mut self.model, &mut next);
        self.sync_selection_flags();
        changes
    }

    fn restore_snapshot(&mut self, snapshot: &GraphModel) -> Vec<Change> {
        let changes = diff_models(&self.model, snapshot);
        self.model = snapshot.clone();
        self.prune_selection();
        self.sync_selection_flags();
        changes
    }

    /// Drop connections left without an endpoint, then commit.
    fn cascade(&mut self, mut next: GraphModel) -> Vec<Change> {
        let before = next.connections.len();
        next.connections
            .retain(|_, c| next.nodes.contains_key(&c.source) && next.nodes.contains_key(&c.target));
        log::debug!("Cascaded {} connections", before - next.connections.len());
        let changes = self.commit(next);
        self.prune_selection();
        self.sync_selection_flags();
        changes
    }

    fn prune_selection(&mut self) {
        let model = &self.model;
        self.selection.nodes.retain(|id| model.nodes.contains_key(id));
        self.selection.connections.retain(|id| model.connections.contains_key(id));
    }

    fn finish_selection(&mut self, before: SelectionState) -> bool {
        self.sync_selection_flags();
        before != self.selection
    }

    /// Make the `selected` flags mirror the selection state, cloning only
    /// the records whose flag flips.
    fn sync_selection_flags(&mut self) {
        for (id, node) in self.model.nodes.iter_mut() {
            let selected = self.selection.nodes.contains(id);
            if node.selected != selected {
                Arc::make_mut(node).selected = selected;
            }
        }
        for (id, connection) in self.model.connections.iter_mut() {
            let selected = self.selection.connections.contains(id);
            if connection.selected != selected {
                Arc::make_mut(connection).selected = selected;
            }
        }
    }

    fn check_endpoints(&self, connection: &Connection) -> Result<(), CommandError> {
        for endpoint in [&connection.source, &connection.target] {
            if !self.model.contains_node(endpoint.as_str()) {
                return Err(CommandError::MissingEndpoint {
                    connection: connection.id.clone(),
                    node: endpoint.clone(),
                });
            }
        }
        Ok(())
    }
}

fn check_geometry(node: &Node) -> Result<(), CommandError> {
    if !node.position.is_finite() {
        return Err(CommandError::InvalidGeometry { node: node.id.clone(), reason: "position is not finite" });
    }
    if !node.size.is_valid() {
        return Err(CommandError::InvalidGeometry {
            node: node.id.clone(),
            reason: "size must be finite and non-negative",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeKind;
    use crate::model::Size;

    fn store() -> CommandStore {
        CommandStore::new(Arc::new(NodeTypeRegistry::with_defaults()))
    }

    fn node(id: &str, x: f64) -> Node {
        Node::with_id(id, "action", Point::new(x, 0.0))
    }

    #[test]
    fn test_add_node_fills_default_size() {
        let mut s = store();
        let changes = s.add_node(Node::with_id("n1", "start", Point::ORIGIN)).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind(), ChangeKind::Added);
        assert_eq!(s.model().node("n1").unwrap().size, Size::new(120.0, 48.0));
    }

    #[test]
    fn test_add_node_rejects_malformed() {
        let mut s = store();
        s.add_node(node("n1", 0.0)).unwrap();

        assert_eq!(s.add_node(node("n1", 5.0)), Err(CommandError::DuplicateNode("n1".into())));
        assert_eq!(s.add_node(node("", 5.0)), Err(CommandError::EmptyId("node")));
        assert!(matches!(
            s.add_node(node("n2", f64::NAN)),
            Err(CommandError::InvalidGeometry { .. })
        ));
        assert!(matches!(
            s.add_node(node("n3", 0.0).with_size(Size::new(-1.0, 10.0))),
            Err(CommandError::InvalidGeometry { .. })
        ));
        assert_eq!(s.model().node_count(), 1);
    }

    #[test]
    fn test_update_unknown_node_is_noop() {
        let mut s = store();
        let changes = s.update_node(&"ghost".into(), NodePatch::position(Point::new(1.0, 1.0))).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_update_node_merges_data_and_removes_nulls() {
        let mut s = store();
        s.add_node(node("n1", 0.0).with_data("label", "A").with_data("retries", 2)).unwrap();

        let patch = NodePatch::data("label", "B").with_data("retries", serde_json::Value::Null);
        let changes = s.update_node(&"n1".into(), patch).unwrap();
        assert_eq!(changes[0].field_names(), vec!["data.label", "data.retries"]);

        let n1 = s.model().node("n1").unwrap();
        assert_eq!(n1.label(), Some("B"));
        assert!(!n1.data.contains_key("retries"));
    }

    #[test]
    fn test_dragging_flag_produces_no_change() {
        let mut s = store();
        s.add_node(node("n1", 0.0)).unwrap();
        let changes = s.update_node(&"n1".into(), NodePatch::dragging(true)).unwrap();
        assert!(changes.is_empty());
        assert!(s.model().node("n1").unwrap().dragging);
    }

    #[test]
    fn test_delete_node_cascades_connections() {
        let mut s = store();
        for id in ["a", "b", "c"] {
            s.add_node(node(id, 0.0)).unwrap();
        }
        s.add_connection(Connection::with_id("ab", "a", "b")).unwrap();
        s.add_connection(Connection::with_id("bc", "b", "c")).unwrap();
        s.add_connection(Connection::with_id("ac", "a", "c")).unwrap();
        s.select_connections(&["bc".into()], false);

        let changes = s.delete_node(&"b".into());
        assert_eq!(changes.len(), 3);
        assert_eq!(s.model().connection_count(), 1);
        assert!(s.model().connection("ac").is_some());
        assert!(s.model().dangling_connections().is_empty());
        assert!(s.selection().connections.is_empty());
    }

    #[test]
    fn test_delete_unknown_is_noop() {
        let mut s = store();
        assert!(s.delete_node(&"ghost".into()).is_empty());
        assert!(s.delete_connection(&"ghost".into()).is_empty());
        assert!(s.delete_comment(&"ghost".into()).is_empty());
    }

    #[test]
    fn test_add_connection_requires_endpoints() {
        let mut s = store();
        s.add_node(node("a", 0.0)).unwrap();
        let err = s.add_connection(Connection::with_id("c", "a", "ghost")).unwrap_err();
        assert_eq!(
            err,
            CommandError::MissingEndpoint { connection: "c".into(), node: "ghost".into() }
        );
    }

    #[test]
    fn test_update_connection_validates_new_endpoints() {
        let mut s = store();
        s.add_node(node("a", 0.0)).unwrap();
        s.add_node(node("b", 0.0)).unwrap();
        s.add_connection(Connection::with_id("c", "a", "b")).unwrap();

        assert!(s.update_connection(&"c".into(), ConnectionPatch::endpoints("a", "ghost")).is_err());
        let changes = s.update_connection(&"c".into(), ConnectionPatch::label(Some("yes".into()))).unwrap();
        assert_eq!(changes[0].field_names(), vec!["label"]);
    }

    #[test]
    fn test_selection_mirrors_flags() {
        let mut s = store();
        s.add_node(node("a", 0.0)).unwrap();
        s.add_node(node("b", 0.0)).unwrap();

        assert!(s.select_nodes(&["a".into(), "ghost".into()], false));
        assert!(s.model().node("a").unwrap().selected);
        assert_eq!(s.selection().nodes.len(), 1);

        assert!(s.select_nodes(&["b".into()], true));
        assert_eq!(s.selection().nodes.len(), 2);
        assert!(!s.select_nodes(&["b".into()], true));

        assert!(s.clear_selection());
        assert!(!s.model().node("a").unwrap().selected);
    }

    #[test]
    fn test_select_all_and_delete_selection() {
        let mut s = store();
        s.add_node(node("a", 0.0)).unwrap();
        s.add_node(node("b", 0.0)).unwrap();
        s.add_connection(Connection::with_id("ab", "a", "b")).unwrap();

        s.select_all();
        assert_eq!(s.selection().connections.len(), 1);
        let changes = s.delete_selection();
        assert_eq!(changes.len(), 3);
        assert!(s.model().is_empty());
        assert!(s.selection().is_empty());
    }

    #[test]
    fn test_selection_is_not_a_change() {
        let mut s = store();
        s.add_node(node("a", 0.0)).unwrap();
        let before = s.model().node("a").unwrap().clone();
        s.select_nodes(&["a".into()], false);
        // Structural sharing: the old record is untouched.
        assert!(!before.selected);
    }

    #[test]
    fn test_comment_thread_lifecycle() {
        let mut s = store();
        let root = Comment::new("ana", "Check this branch", Point::ORIGIN).with_id("root");
        let reply = Comment::reply_to(&root, "ben", "Done").with_id("reply");
        s.add_comment(root).unwrap();
        s.add_comment(reply).unwrap();

        let orphan = Comment::new("ben", "?", Point::ORIGIN).with_id("orphan");
        let mut orphan = orphan;
        orphan.parent_id = Some("missing".into());
        assert!(matches!(s.add_comment(orphan), Err(CommandError::UnknownParent { .. })));
        assert_eq!(
            s.add_comment(Comment::new("ana", "  ", Point::ORIGIN)),
            Err(CommandError::EmptyComment)
        );

        assert_eq!(s.resolve_comment(&"root".into(), true).len(), 1);
        assert!(s.model().comment("root").unwrap().resolved);

        let changes = s.delete_comment(&"root".into());
        assert_eq!(changes.len(), 2);
        assert_eq!(s.model().comment_count(), 0);
    }

    #[test]
    fn test_undo_redo_restores_snapshots() {
        let mut s = store();
        for i in 0..5 {
            s.add_node(node(&format!("n{i}"), i as f64)).unwrap();
            s.save_state();
        }
        for _ in 0..3 {
            assert!(s.undo().is_some());
        }
        assert_eq!(s.model().node_count(), 2);
        for _ in 0..3 {
            assert!(s.redo().is_some());
        }
        assert_eq!(s.model().node_count(), 5);
        assert!(s.redo().is_none());
    }

    #[test]
    fn test_undo_reports_changes_and_trims_selection() {
        let mut s = store();
        s.add_node(node("a", 0.0)).unwrap();
        s.save_state();
        s.select_nodes(&["a".into()], false);

        let changes = s.undo().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind(), ChangeKind::Removed);
        assert!(s.selection().is_empty());
        assert!(s.undo().is_none());
    }

    #[test]
    fn test_undo_resyncs_selection_flags() {
        let mut s = store();
        s.add_node(node("a", 0.0)).unwrap();
        s.save_state();
        s.add_node(node("b", 0.0)).unwrap();
        s.save_state();
        s.select_nodes(&["a".into()], false);

        s.undo().unwrap();
        assert!(s.model().node("a").unwrap().selected);
    }

    #[test]
    fn test_replace_model_drops_missing_selection() {
        let mut s = store();
        s.add_node(node("a", 0.0)).unwrap();
        s.select_nodes(&["a".into()], false);
        assert!(s.replace_model(GraphModel::new()));
        assert!(s.selection().is_empty());
    }

    #[test]
    fn test_viewport_ops() {
        let mut s = store();
        assert!(s.set_viewport(Viewport::new(10.0, 20.0, 2.0)));
        assert!(!s.set_viewport(Viewport::new(10.0, 20.0, 2.0)));
        s.pan_by(5.0, 5.0);
        assert_eq!(s.viewport().x, 15.0);
        s.zoom_at(100.0, Point::ORIGIN);
        assert_eq!(s.viewport().zoom, crate::model::MAX_ZOOM);

        let before = *s.viewport();
        assert!(!s.set_viewport(Viewport { x: f64::NAN, y: 0.0, zoom: 1.0 }));
        assert!(!s.pan_by(f64::INFINITY, 0.0));
        assert_eq!(*s.viewport(), before);
    }

    #[test]
    fn test_apply_dispatches() {
        let mut s = store();
        s.apply(Command::AddNode { node: node("a", 0.0) }).unwrap();
        s.apply(Command::DeleteNodes { ids: vec!["a".into()] }).unwrap();
        assert!(s.model().is_empty());
    }
}
