//! Append-only log of semantic operations.
//!
//! One [`Operation`] per committed record change. Entries are immutable
//! once appended; [`OperationLog::prune`] under a [`RetentionPolicy`] is the
//! only way anything leaves the log.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::change::{Change, ChangeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    NodeAdded,
    NodeUpdated,
    NodeRemoved,
    ConnectionAdded,
    ConnectionUpdated,
    ConnectionRemoved,
    CommentAdded,
    CommentUpdated,
    CommentRemoved,
}

impl OperationKind {
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::NodeAdded => "node added",
            OperationKind::NodeUpdated => "node updated",
            OperationKind::NodeRemoved => "node removed",
            OperationKind::ConnectionAdded => "connection added",
            OperationKind::ConnectionUpdated => "connection updated",
            OperationKind::ConnectionRemoved => "connection removed",
            OperationKind::CommentAdded => "comment added",
            OperationKind::CommentUpdated => "comment updated",
            OperationKind::CommentRemoved => "comment removed",
        }
    }

    fn of(change: &Change) -> Self {
        use OperationKind::*;
        match (change, change.kind()) {
            (Change::Node { .. }, ChangeKind::Added) => NodeAdded,
            (Change::Node { .. }, ChangeKind::Updated) => NodeUpdated,
            (Change::Node { .. }, ChangeKind::Removed) => NodeRemoved,
            (Change::Connection { .. }, ChangeKind::Added) => ConnectionAdded,
            (Change::Connection { .. }, ChangeKind::Updated) => ConnectionUpdated,
            (Change::Connection { .. }, ChangeKind::Removed) => ConnectionRemoved,
            (Change::Comment { .. }, ChangeKind::Added) => CommentAdded,
            (Change::Comment { .. }, ChangeKind::Updated) => CommentUpdated,
            (Change::Comment { .. }, ChangeKind::Removed) => CommentRemoved,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What made the change happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCause {
    Command,
    Undo,
    Redo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub target: String,
    pub user_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub cause: OperationCause,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default)]
    pub before: Option<Value>,
    #[serde(default)]
    pub after: Option<Value>,
}

impl Operation {
    pub fn from_change(change: &Change, user_id: &str, cause: OperationCause, timestamp: u64) -> Self {
        let (before, after) = change.payloads();
        Self {
            id: Uuid::new_v4(),
            kind: OperationKind::of(change),
            target: change.target().to_string(),
            user_id: user_id.to_string(),
            timestamp,
            cause,
            fields: change.field_names(),
            before,
            after,
        }
    }

    /// One human readable line, e.g. `alice: node updated n1 (position) [undo]`.
    pub fn describe(&self) -> String {
        let mut line = format!("{}: {} {}", self.user_id, self.kind, self.target);
        if !self.fields.is_empty() {
            line.push_str(&format!(" ({})", self.fields.join(", ")));
        }
        match self.cause {
            OperationCause::Command => {}
            OperationCause::Undo => line.push_str(" [undo]"),
            OperationCause::Redo => line.push_str(" [redo]"),
        }
        line
    }
}

/// Bounds on what the log keeps. `None` disables a bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub max_entries: Option<usize>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: None,
            max_entries: Some(10_000),
        }
    }
}

impl RetentionPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_age: None,
            max_entries: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OperationLogError {
    #[error("Operation log serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    entries: VecDeque<Operation>,
    retention: RetentionPolicy,
}

impl OperationLog {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            retention,
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Append and enforce the entry bound.
    pub fn append(&mut self, operation: Operation) {
        self.entries.push_back(operation);
        if let Some(max) = self.retention.max_entries {
            while self.entries.len() > max {
                self.entries.pop_front();
            }
        }
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &Operation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&Operation> {
        self.entries.back()
    }

    pub fn for_target<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a Operation> + 'a {
        self.entries.iter().filter(move |op| op.target == target)
    }

    /// Entries with `timestamp >= since_ms`.
    pub fn since(&self, since_ms: u64) -> impl Iterator<Item = &Operation> {
        self.entries.iter().filter(move |op| op.timestamp >= since_ms)
    }

    pub fn by_user<'a>(&'a self, user_id: &'a str) -> impl Iterator<Item = &'a Operation> + 'a {
        self.entries.iter().filter(move |op| op.user_id == user_id)
    }

    /// Drop entries older than the age bound relative to `now_ms`, then
    /// enforce the entry bound. Returns how many were removed.
    pub fn prune(&mut self, now_ms: u64) -> usize {
        let before = self.entries.len();
        if let Some(max_age) = self.retention.max_age {
            let cutoff = now_ms.saturating_sub(max_age.as_millis() as u64);
            self.entries.retain(|op| op.timestamp >= cutoff);
        }
        if let Some(max) = self.retention.max_entries {
            while self.entries.len() > max {
                self.entries.pop_front();
            }
        }
        let removed = before - self.entries.len();
        if removed > 0 {
            log::debug!("Pruned {removed} operations");
        }
        removed
    }

    pub fn export_json(&self) -> Result<String, OperationLogError> {
        Ok(serde_json::to_string(&self.entries)?)
    }

    /// Append entries from an export. Operations whose id is already
    /// present are skipped. Returns how many were added.
    pub fn import_json(&mut self, json: &str) -> Result<usize, OperationLogError> {
        let incoming: Vec<Operation> = serde_json::from_str(json)?;
        let known: std::collections::HashSet<Uuid> = self.entries.iter().map(|op| op.id).collect();
        let mut added = 0;
        for op in incoming {
            if !known.contains(&op.id) {
                self.append(op);
                added += 1;
            }
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::NodeField;
    use crate::model::{Node, Point};
    use std::sync::Arc;

    fn moved() -> Change {
        Change::Node {
            id: "n1".into(),
            before: Some(Arc::new(Node::with_id("n1", "action", Point::ORIGIN))),
            after: Some(Arc::new(Node::with_id("n1", "action", Point::new(5.0, 0.0)))),
            fields: vec![NodeField::Position],
        }
    }

    #[test]
    fn test_operation_from_change() {
        let op = Operation::from_change(&moved(), "alice", OperationCause::Undo, 42);
        assert_eq!(op.kind, OperationKind::NodeUpdated);
        assert_eq!(op.target, "n1");
        assert_eq!(op.fields, vec!["position".to_string()]);
        assert_eq!(op.after.as_ref().unwrap()["position"]["x"], 5.0);
        assert_eq!(op.describe(), "alice: node updated n1 (position) [undo]");
    }

    #[test]
    fn test_entry_bound() {
        let mut log = OperationLog::new(RetentionPolicy {
            max_age: None,
            max_entries: Some(3),
        });
        for ts in 0..5 {
            log.append(Operation::from_change(&moved(), "alice", OperationCause::Command, ts));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.entries().next().unwrap().timestamp, 2);
    }

    #[test]
    fn test_prune_by_age() {
        let mut log = OperationLog::new(RetentionPolicy {
            max_age: Some(Duration::from_secs(1)),
            max_entries: None,
        });
        log.append(Operation::from_change(&moved(), "alice", OperationCause::Command, 1_000));
        log.append(Operation::from_change(&moved(), "bob", OperationCause::Command, 5_000));
        assert_eq!(log.prune(5_500), 1);
        assert_eq!(log.last().unwrap().user_id, "bob");
    }

    #[test]
    fn test_queries() {
        let mut log = OperationLog::default();
        log.append(Operation::from_change(&moved(), "alice", OperationCause::Command, 10));
        log.append(Operation::from_change(&moved(), "bob", OperationCause::Command, 20));
        assert_eq!(log.for_target("n1").count(), 2);
        assert_eq!(log.for_target("n2").count(), 0);
        assert_eq!(log.since(15).count(), 1);
        assert_eq!(log.by_user("alice").count(), 1);
    }

    #[test]
    fn test_export_import_skips_known_ids() {
        let mut log = OperationLog::default();
        log.append(Operation::from_change(&moved(), "alice", OperationCause::Command, 10));
        let json = log.export_json().unwrap();

        let mut other = OperationLog::default();
        assert_eq!(other.import_json(&json).unwrap(), 1);
        assert_eq!(other.import_json(&json).unwrap(), 0);
        assert_eq!(other.entries().next(), log.entries().next());
    }

    #[test]
    fn test_import_rejects_garbage() {
        let mut log = OperationLog::default();
        assert!(log.import_json("{not json").is_err());
        assert!(log.is_empty());
    }
}
