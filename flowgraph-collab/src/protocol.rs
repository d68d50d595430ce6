//! Binary wire protocol for signaling, relaying and direct peer links.
//!
//! Every WebSocket binary message carries one bincode-encoded [`Frame`].
//!
//! ```text
//!   peer ──Join──────────► relay           relay ──Welcome / Rejected──► peer
//!   peer ──Relay{to}─────► relay ──Relay──► peer(s)
//!                          relay ──PeerJoined / PeerLeft──► room
//!   peer ──Hello─────────► peer            peer ──HelloAck / Rejected──► peer
//!   peer ──Direct────────► peer
//! ```
//!
//! Document and awareness traffic travels as [`SyncMessage`]s inside
//! `Relay` and `Direct` frames. The relay never looks inside them.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type RoomId = String;

/// Room access key: `blake3(room_id || password)`.
///
/// Rooms without a password have no key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomKey([u8; 32]);

impl RoomKey {
    pub fn derive(room_id: &str, password: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(room_id.as_bytes());
        hasher.update(password.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn for_room(room_id: &str, password: Option<&str>) -> Option<Self> {
        password.map(|p| Self::derive(room_id, p))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoomKey({:02x}{:02x}{:02x}{:02x}…)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Peer identity announced through signaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Transport-assigned id, fresh per connection.
    pub peer_id: Uuid,
    pub user_id: String,
    pub name: String,
    /// `host:port` where this peer accepts direct links.
    pub direct_addr: Option<String>,
    /// ICE/STUN hints, carried verbatim.
    pub ice_hints: Vec<String>,
}

impl PeerInfo {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), user_id, name)
    }

    pub fn with_id(peer_id: Uuid, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            user_id: user_id.into(),
            name: name.into(),
            direct_addr: None,
            ice_hints: Vec::new(),
        }
    }
}

/// Document and awareness traffic between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// "Here is what I have": an encoded yrs state vector.
    SyncStep1 { state_vector: Vec<u8> },
    /// "Here is what you are missing": an encoded yrs update.
    SyncStep2 { update: Vec<u8> },
    /// Incremental update pushed as it happens.
    Update { clock: u64, update: Vec<u8> },
    /// Encoded [`AwarenessUpdate`](crate::awareness::AwarenessUpdate).
    Awareness { payload: Vec<u8> },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
}

impl SyncMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::SyncStep1 { .. } => "sync_step1",
            SyncMessage::SyncStep2 { .. } => "sync_step2",
            SyncMessage::Update { .. } => "update",
            SyncMessage::Awareness { .. } => "awareness",
            SyncMessage::Ping { .. } => "ping",
            SyncMessage::Pong { .. } => "pong",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    WrongKey,
    RoomFull,
    WrongRoom,
    NotJoined,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectReason::WrongKey => "wrong room key",
            RejectReason::RoomFull => "room is full",
            RejectReason::WrongRoom => "wrong room",
            RejectReason::NotJoined => "not joined",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    // ─── Signaling ───
    Join {
        room: RoomId,
        peer: PeerInfo,
        key: Option<RoomKey>,
    },
    Leave,
    Welcome {
        peers: Vec<PeerInfo>,
    },
    Rejected {
        reason: RejectReason,
    },
    PeerJoined {
        peer: PeerInfo,
    },
    PeerLeft {
        peer_id: Uuid,
    },
    /// The relay dropped `skipped` frames meant for this peer; it should
    /// re-run the state-vector exchange.
    Resync {
        skipped: u64,
    },

    // ─── Relay ───
    /// `to: None` addresses the whole room.
    Relay {
        room: RoomId,
        from: Uuid,
        to: Option<Uuid>,
        message: SyncMessage,
    },

    // ─── Direct links ───
    Hello {
        room: RoomId,
        peer: PeerInfo,
        key: Option<RoomKey>,
    },
    HelloAck {
        peer: PeerInfo,
    },
    Direct {
        message: SyncMessage,
    },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }

    pub fn relay(room: &str, from: Uuid, to: Option<Uuid>, message: SyncMessage) -> Self {
        Frame::Relay {
            room: room.to_string(),
            from,
            to,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
}
