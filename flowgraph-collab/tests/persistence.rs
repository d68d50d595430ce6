//! Local persistence across session restarts.

use flowgraph_collab::relay::{RelayConfig, RelayServer};
use flowgraph_collab::session::{Session, SessionConfig};
use flowgraph_collab::storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig};
use flowgraph_core::{Connection, Node, NodeTypeRegistry, Point};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::Duration;

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = RelayServer::new(RelayConfig::for_testing());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    url
}

/// Config pointing at a port nobody listens on.
async fn offline_config(user: &str) -> SessionConfig {
    let url = format!("ws://127.0.0.1:{}", free_port().await);
    let mut config = SessionConfig::for_testing("doc", user, &url);
    config.reconnect_initial = Duration::from_secs(60);
    config
}

async fn start(config: SessionConfig, store: Arc<dyn DocumentStore>) -> Session {
    Session::start(config, Arc::new(NodeTypeRegistry::with_defaults()), Some(store))
        .await
        .unwrap()
}

fn open_rocks(dir: &TempDir) -> Arc<dyn DocumentStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap())
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "Timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_rocks_restart_restores_document() {
    let dir = TempDir::new().unwrap();
    {
        let session = start(offline_config("alice").await, open_rocks(&dir)).await;
        session.with_engine(|e| {
            e.add_node(Node::with_id("a", "start", Point::new(0.0, 0.0))).unwrap();
            e.add_node(Node::with_id("b", "action", Point::new(200.0, 0.0))).unwrap();
            e.add_connection(Connection::with_id("ab", "a", "b")).unwrap();
        });
        session.shutdown().await.unwrap();
    }

    let session = start(offline_config("alice").await, open_rocks(&dir)).await;
    session.with_engine(|e| {
        assert_eq!(e.model().node_count(), 2);
        assert_eq!(e.model().connection_count(), 1);
        // Restored state is the start of history, not an undoable edit.
        assert!(!e.can_undo());
    });
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_compaction_keeps_document_intact() {
    let dir = TempDir::new().unwrap();
    let mut config = offline_config("alice").await;
    config.persistence.flush_max_updates = 4;
    config.persistence.compact_every = 8;

    let store = open_rocks(&dir);
    let session = start(config.clone(), store.clone()).await;
    for i in 0..20 {
        session
            .with_engine(|e| e.add_node(Node::with_id(format!("n{i}"), "action", Point::new(i as f64, 0.0))))
            .unwrap();
    }
    session.flush_persistence().await.unwrap();
    session.shutdown().await.unwrap();

    let meta = store.metadata("doc").unwrap().unwrap();
    assert!(meta.snapshot_seq > 0, "no snapshot written: {meta:?}");
    assert!(meta.delta_count < 20);
    drop(store);

    let session = start(config, open_rocks(&dir)).await;
    assert_eq!(session.with_engine(|e| e.model().node_count()), 20);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_continues_sequence() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    for round in 0..3 {
        let session = start(offline_config("alice").await, store.clone()).await;
        session
            .with_engine(|e| e.add_node(Node::with_id(format!("n{round}"), "action", Point::new(0.0, 0.0))))
            .unwrap();
        session.shutdown().await.unwrap();
    }
    let meta = store.metadata("doc").unwrap().unwrap();
    assert_eq!(meta.last_seq, 3);

    let session = start(offline_config("alice").await, store).await;
    assert_eq!(session.with_engine(|e| e.model().node_count()), 3);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_store_failure_keeps_session_live() {
    let url = start_relay().await;
    let memory = Arc::new(MemoryStore::new());
    memory.fail_next_writes(3);
    let store: Arc<dyn DocumentStore> = memory.clone();

    let registry = Arc::new(NodeTypeRegistry::with_defaults());
    let a = Session::start(SessionConfig::for_testing("doc", "alice", &url), registry.clone(), Some(store))
        .await
        .unwrap();
    let b = Session::start(SessionConfig::for_testing("doc", "bob", &url), registry, None)
        .await
        .unwrap();

    a.with_engine(|e| e.add_node(Node::with_id("n1", "action", Point::new(0.0, 0.0))))
        .unwrap();
    eventually("peer received the edit", || {
        b.with_engine(|e| e.model().node("n1").is_some())
    })
    .await;
    eventually("store recovered", || memory.load_updates("doc").map(|u| !u.is_empty()).unwrap_or(false)).await;
}

#[tokio::test]
async fn test_restored_peer_catches_up() {
    let url = start_relay().await;
    let registry = Arc::new(NodeTypeRegistry::with_defaults());
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());

    let a = Session::start(SessionConfig::for_testing("doc", "alice", &url), registry.clone(), Some(store.clone()))
        .await
        .unwrap();
    a.with_engine(|e| e.add_node(Node::with_id("n1", "action", Point::new(0.0, 0.0))))
        .unwrap();
    a.shutdown().await.unwrap();

    // Bob edits while Alice is away.
    let b = Session::start(SessionConfig::for_testing("doc", "bob", &url), registry.clone(), None)
        .await
        .unwrap();
    b.with_engine(|e| e.add_node(Node::with_id("n2", "action", Point::new(0.0, 0.0))))
        .unwrap();

    let a = Session::start(SessionConfig::for_testing("doc", "alice", &url), registry, Some(store))
        .await
        .unwrap();
    assert!(a.with_engine(|e| e.model().node("n1").is_some()));
    eventually("alice sees bob's edit", || a.with_engine(|e| e.model().node("n2").is_some())).await;
    eventually("bob sees alice's edit", || b.with_engine(|e| e.model().node("n1").is_some())).await;
}
