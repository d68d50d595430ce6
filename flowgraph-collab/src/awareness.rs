//! Ephemeral presence: cursors, selections and status of everyone in a room.
//!
//! ```text
//! set_cursor() ──(throttled 33ms)──┐
//! set_selection() / set_status() ──┼──► AwarenessUpdate ──► transport
//! heartbeat() ─────(every 15s)─────┘
//!
//! transport ──► apply_remote() ──► connected_users()   (stale after 30s)
//! ```
//!
//! Awareness never touches the document or the undo history. Every update
//! carries the full local state and a per-client clock, so a lost update is
//! repaired by the next one and stale or duplicate clocks are ignored.
//!
//! Time is always passed in as an [`Instant`], which keeps the throttling and
//! staleness rules deterministic under test.

use flowgraph_core::{NodeId, Point, Viewport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::ProtocolError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwarenessConfig {
    pub heartbeat_interval: Duration,
    pub cursor_throttle: Duration,
    /// Remote entries silent for longer than this are dropped.
    pub stale_after: Duration,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            cursor_throttle: Duration::from_millis(33),
            stale_after: Duration::from_secs(30),
        }
    }
}

impl AwarenessConfig {
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            cursor_throttle: Duration::from_millis(33),
            stale_after: Duration::from_millis(500),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// State
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PresenceStatus {
    #[default]
    Online,
    Away,
    /// Reported for users that left or went silent.
    Offline,
}

/// Caret or range inside a text field of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSelection {
    pub node_id: NodeId,
    pub field: String,
    pub anchor: u32,
    pub head: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub user_id: String,
    pub name: String,
    /// `#rrggbb`
    pub color: String,
    /// Canvas coordinates.
    pub cursor: Option<Point>,
    pub selection: Vec<NodeId>,
    pub text_selection: Option<TextSelection>,
    pub status: PresenceStatus,
    pub viewport: Option<Viewport>,
}

impl AwarenessState {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, color: Option<String>) -> Self {
        let user_id = user_id.into();
        let color = color.unwrap_or_else(|| user_color(&user_id).to_string());
        Self {
            user_id,
            name: name.into(),
            color,
            cursor: None,
            selection: Vec::new(),
            text_selection: None,
            status: PresenceStatus::Online,
            viewport: None,
        }
    }
}

/// One client's awareness broadcast. `state: None` means the client left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub client_id: Uuid,
    pub clock: u64,
    pub state: Option<AwarenessState>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(update)
    }
}

/// A remote client as currently known.
#[derive(Debug, Clone)]
pub struct UserPresence {
    pub client_id: Uuid,
    pub clock: u64,
    pub state: AwarenessState,
    pub last_seen: Instant,
}

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

pub const PALETTE: [&str; 12] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#42d4f4", "#f032e6", "#bfef45", "#469990",
    "#9a6324", "#800000", "#000075",
];

/// Stable palette color for a user id (FNV-1a).
pub fn user_color(user_id: &str) -> &'static str {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in user_id.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    PALETTE[(hash % PALETTE.len() as u32) as usize]
}

// ───────────────────────────────────────────────────────────────────
// Awareness
// ───────────────────────────────────────────────────────────────────

pub struct Awareness {
    config: AwarenessConfig,
    client_id: Uuid,
    clock: u64,
    local: AwarenessState,
    last_cursor_broadcast: Option<Instant>,
    cursor_pending: bool,
    last_broadcast: Option<Instant>,
    remote: HashMap<Uuid, UserPresence>,
    departed: Vec<UserPresence>,
}

impl Awareness {
    pub fn new(config: AwarenessConfig, client_id: Uuid, local: AwarenessState) -> Self {
        Self {
            config,
            client_id,
            clock: 0,
            local,
            last_cursor_broadcast: None,
            cursor_pending: false,
            last_broadcast: None,
            remote: HashMap::new(),
            departed: Vec::new(),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// The transport assigns a new id on every reconnect.
    pub fn set_client_id(&mut self, client_id: Uuid) {
        self.client_id = client_id;
    }

    pub fn local_state(&self) -> &AwarenessState {
        &self.local
    }

    pub fn config(&self) -> &AwarenessConfig {
        &self.config
    }

    // ─── Local state ───

    /// Move the local cursor. Returns an update unless throttled; a throttled
    /// move is sent later by [`flush_pending`](Self::flush_pending).
    pub fn set_cursor(&mut self, cursor: Option<Point>, now: Instant) -> Option<AwarenessUpdate> {
        if self.local.cursor == cursor {
            return None;
        }
        self.local.cursor = cursor;
        let throttled = self
            .last_cursor_broadcast
            .is_some_and(|last| now.saturating_duration_since(last) < self.config.cursor_throttle);
        if throttled {
            self.cursor_pending = true;
            return None;
        }
        Some(self.full_update(now))
    }

    /// Send a cursor move held back by the throttle, once it has elapsed.
    pub fn flush_pending(&mut self, now: Instant) -> Option<AwarenessUpdate> {
        if !self.cursor_pending {
            return None;
        }
        let ready = self
            .last_cursor_broadcast
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.cursor_throttle);
        ready.then(|| self.full_update(now))
    }

    pub fn set_selection(&mut self, selection: Vec<NodeId>, now: Instant) -> Option<AwarenessUpdate> {
        if self.local.selection == selection {
            return None;
        }
        self.local.selection = selection;
        Some(self.full_update(now))
    }

    pub fn set_text_selection(&mut self, text: Option<TextSelection>, now: Instant) -> Option<AwarenessUpdate> {
        if self.local.text_selection == text {
            return None;
        }
        self.local.text_selection = text;
        Some(self.full_update(now))
    }

    pub fn set_status(&mut self, status: PresenceStatus, now: Instant) -> Option<AwarenessUpdate> {
        if self.local.status == status {
            return None;
        }
        self.local.status = status;
        Some(self.full_update(now))
    }

    pub fn set_viewport(&mut self, viewport: Option<Viewport>, now: Instant) -> Option<AwarenessUpdate> {
        if self.local.viewport == viewport {
            return None;
        }
        self.local.viewport = viewport;
        Some(self.full_update(now))
    }

    /// Periodic re-broadcast so peers do not consider us stale.
    pub fn heartbeat(&mut self, now: Instant) -> Option<AwarenessUpdate> {
        let due = self
            .last_broadcast
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.heartbeat_interval);
        due.then(|| self.full_update(now))
    }

    /// Current local state with a fresh clock.
    pub fn full_update(&mut self, now: Instant) -> AwarenessUpdate {
        self.clock += 1;
        self.last_broadcast = Some(now);
        self.last_cursor_broadcast = Some(now);
        self.cursor_pending = false;
        AwarenessUpdate {
            client_id: self.client_id,
            clock: self.clock,
            state: Some(self.local.clone()),
        }
    }

    pub fn leave_update(&mut self) -> AwarenessUpdate {
        self.clock += 1;
        AwarenessUpdate {
            client_id: self.client_id,
            clock: self.clock,
            state: None,
        }
    }

    // ─── Remote state ───

    /// Merge a remote update. Returns `true` when the visible set changed.
    pub fn apply_remote(&mut self, update: AwarenessUpdate, now: Instant) -> bool {
        if update.client_id == self.client_id {
            return false;
        }
        if let Some(known) = self.remote.get(&update.client_id) {
            if update.clock <= known.clock {
                log::trace!("Stale awareness clock {} from {}", update.clock, update.client_id);
                return false;
            }
        }

        match update.state {
            None => self.depart(&update.client_id).is_some(),
            Some(state) => {
                self.remote.insert(
                    update.client_id,
                    UserPresence {
                        client_id: update.client_id,
                        clock: update.clock,
                        state,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    pub fn remove(&mut self, client_id: &Uuid) -> bool {
        self.depart(client_id).is_some()
    }

    /// Everyone goes offline, e.g. when our own link drops.
    pub fn remove_all(&mut self) -> usize {
        let ids: Vec<Uuid> = self.remote.keys().copied().collect();
        for id in &ids {
            self.depart(id);
        }
        ids.len()
    }

    /// Users that left since the last call, reported with status
    /// [`PresenceStatus::Offline`].
    pub fn take_departed(&mut self) -> Vec<UserPresence> {
        std::mem::take(&mut self.departed)
    }

    fn depart(&mut self, client_id: &Uuid) -> Option<UserPresence> {
        let mut presence = self.remote.remove(client_id)?;
        presence.state.status = PresenceStatus::Offline;
        self.departed.push(presence.clone());
        Some(presence)
    }

    pub fn get(&self, client_id: &Uuid) -> Option<&UserPresence> {
        self.remote.get(client_id)
    }

    /// Remote users heard from within the staleness window.
    pub fn connected_users(&self, now: Instant) -> Vec<UserPresence> {
        let mut users: Vec<UserPresence> = self
            .remote
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) <= self.config.stale_after)
            .cloned()
            .collect();
        users.sort_by(|a, b| a.state.name.cmp(&b.state.name).then(a.client_id.cmp(&b.client_id)));
        users
    }

    /// Drop silent entries. Returns the removed client ids.
    pub fn expire_stale(&mut self, now: Instant) -> Vec<Uuid> {
        let stale_after = self.config.stale_after;
        let expired: Vec<Uuid> = self
            .remote
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) > stale_after)
            .map(|p| p.client_id)
            .collect();
        for id in &expired {
            self.depart(id);
            log::debug!("Awareness entry {id} expired");
        }
        expired
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }
}
