//! Buffers document updates between store writes.
//!
//! ```text
//!  push(update) ──► [ (seq, bytes) | (seq, bytes) | ... ]
//!
//!  flush when:
//!    1. count  ≥ max_updates
//!    2. bytes  ≥ max_bytes
//!    3. oldest buffered update is older than max_delay
//! ```
//!
//! Sequence numbers are assigned on push and never reused, so a batch that
//! failed to write can be put back and retried without renumbering.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct WriteCoalescer {
    max_updates: usize,
    max_bytes: usize,
    max_delay: Duration,
    buffer: VecDeque<(u64, Vec<u8>)>,
    buffered_bytes: usize,
    next_seq: u64,
    oldest: Option<Instant>,
}

impl WriteCoalescer {
    pub fn new(max_updates: usize, max_bytes: usize, max_delay: Duration, next_seq: u64) -> Self {
        Self {
            max_updates: max_updates.max(1),
            max_bytes,
            max_delay,
            buffer: VecDeque::new(),
            buffered_bytes: 0,
            next_seq,
            oldest: None,
        }
    }

    /// Buffer an update; returns its sequence number.
    pub fn push(&mut self, update: Vec<u8>, now: Instant) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.buffered_bytes += update.len();
        self.buffer.push_back((seq, update));
        self.oldest.get_or_insert(now);
        seq
    }

    /// Size thresholds reached.
    pub fn needs_flush(&self) -> bool {
        self.buffer.len() >= self.max_updates || self.buffered_bytes >= self.max_bytes
    }

    /// Size thresholds reached, or the oldest update waited long enough.
    pub fn due(&self, now: Instant) -> bool {
        self.needs_flush()
            || self
                .oldest
                .is_some_and(|oldest| now.saturating_duration_since(oldest) >= self.max_delay)
    }

    /// Drain everything buffered.
    pub fn take(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.buffered_bytes = 0;
        self.oldest = None;
        self.buffer.drain(..).collect()
    }

    /// Put a failed batch back in front of anything pushed since.
    pub fn restore(&mut self, batch: Vec<(u64, Vec<u8>)>, now: Instant) {
        if batch.is_empty() {
            return;
        }
        for entry in batch.into_iter().rev() {
            self.buffered_bytes += entry.1.len();
            self.buffer.push_front(entry);
        }
        self.oldest = Some(self.oldest.map_or(now, |oldest| oldest.min(now)));
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}
