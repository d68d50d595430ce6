use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Who caused a replica transaction.
///
/// Every write into the replicated document carries one. Only local
/// origins are forwarded to peers, which is what keeps merged remote
/// updates from echoing back into the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnOrigin {
    /// A command issued on this client.
    Local,
    /// An undo or redo step on this client.
    History,
    /// An update received from the given peer.
    Remote(Uuid),
    /// State loaded from local persistence.
    Restore,
}

impl TxnOrigin {
    /// Whether updates with this origin should be published to peers.
    pub fn is_local(&self) -> bool {
        matches!(self, TxnOrigin::Local | TxnOrigin::History)
    }

    /// Tag attached to the yrs transaction.
    pub fn tag(&self) -> String {
        match self {
            TxnOrigin::Local => "local".to_string(),
            TxnOrigin::History => "history".to_string(),
            TxnOrigin::Remote(peer) => format!("remote:{peer}"),
            TxnOrigin::Restore => "restore".to_string(),
        }
    }
}

impl fmt::Display for TxnOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// A committed replica transaction, as seen by observers.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub origin: TxnOrigin,
    /// yrs v1 update bytes.
    pub update: Arc<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_local_origins_are_published() {
        assert!(TxnOrigin::Local.is_local());
        assert!(TxnOrigin::History.is_local());
        assert!(!TxnOrigin::Remote(Uuid::new_v4()).is_local());
        assert!(!TxnOrigin::Restore.is_local());
    }

    #[test]
    fn test_remote_tag_carries_peer() {
        let peer = Uuid::new_v4();
        assert_eq!(TxnOrigin::Remote(peer).tag(), format!("remote:{peer}"));
    }
}
