//! Bounded undo/redo ring of full model snapshots.
//!
//! ```text
//!   entries:  [ s0 | s1 | s2 | s3 ]        capacity = 50
//!                          ▲
//!                        cursor
//!   undo → cursor-1    redo → cursor+1    save → truncate after cursor, push
//! ```
//!
//! The ring is seeded with the model the store starts from, so undoing every
//! saved step returns to that model. Snapshots share records by `Arc`, so a
//! full ring costs pointers rather than copies.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::model::GraphModel;

pub const HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Monotonic save counter.
    pub seq: u64,
    pub model: Arc<GraphModel>,
}

#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    cursor: usize,
    capacity: usize,
    next_seq: u64,
}

impl History {
    pub fn new(initial: GraphModel) -> Self {
        Self::with_capacity(initial, HISTORY_CAPACITY)
    }

    pub fn with_capacity(initial: GraphModel, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut entries = VecDeque::with_capacity(capacity);
        entries.push_back(HistoryEntry { seq: 0, model: Arc::new(initial) });
        Self { entries, cursor: 0, capacity, next_seq: 1 }
    }

    /// Record `model` after the cursor, dropping any redo tail and evicting
    /// the oldest entry past capacity. Returns the entry's sequence number.
    pub fn save(&mut self, model: &GraphModel) -> u64 {
        self.entries.truncate(self.cursor + 1);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(HistoryEntry { seq, model: Arc::new(model.clone()) });
        if self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        self.cursor = self.entries.len() - 1;
        seq
    }

    pub fn undo(&mut self) -> Option<&HistoryEntry> {
        if !self.can_undo() {
            return None;
        }
        self.cursor -= 1;
        self.entries.get(self.cursor)
    }

    pub fn redo(&mut self) -> Option<&HistoryEntry> {
        if !self.can_redo() {
            return None;
        }
        self.cursor += 1;
        self.entries.get(self.cursor)
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor + 1 < self.entries.len()
    }

    pub fn current(&self) -> Option<&HistoryEntry> {
        self.entries.get(self.cursor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Node, Point};

    fn model_with(n: usize) -> GraphModel {
        let mut model = GraphModel::new();
        for i in 0..n {
            let node = Node::with_id(format!("n{i}"), "action", Point::ORIGIN);
            model.nodes.insert(node.id.clone(), Arc::new(node));
        }
        model
    }

    #[test]
    fn test_fresh_history_has_nothing_to_undo() {
        let mut history = History::new(GraphModel::new());
        assert!(!history.can_undo());
        assert!(!history.can_redo());
        assert!(history.undo().is_none());
        assert!(history.redo().is_none());
    }

    #[test]
    fn test_undo_redo_walk() {
        let mut history = History::new(model_with(0));
        for i in 1..=3 {
            history.save(&model_with(i));
        }

        assert_eq!(history.undo().unwrap().model.node_count(), 2);
        assert_eq!(history.undo().unwrap().model.node_count(), 1);
        assert!(history.can_redo());
        assert_eq!(history.redo().unwrap().model.node_count(), 2);
    }

    #[test]
    fn test_save_truncates_redo_tail() {
        let mut history = History::new(model_with(0));
        history.save(&model_with(1));
        history.save(&model_with(2));
        history.undo();
        history.save(&model_with(5));

        assert!(!history.can_redo());
        assert_eq!(history.len(), 3);
        assert_eq!(history.current().unwrap().model.node_count(), 5);
    }

    #[test]
    fn test_capacity_evicts_oldest_and_keeps_cursor_valid() {
        let mut history = History::new(model_with(0));
        for i in 1..=HISTORY_CAPACITY + 10 {
            history.save(&model_with(i % 7));
        }
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history.cursor(), HISTORY_CAPACITY - 1);

        let mut steps = 0;
        while history.undo().is_some() {
            steps += 1;
        }
        assert_eq!(steps, HISTORY_CAPACITY - 1);
        // The oldest surviving snapshot is save #11.
        assert_eq!(history.current().unwrap().seq, 11);
    }
}
