//! End-to-end collaboration through a real relay.
//!
//! Every test starts a relay on a free loopback port and connects real
//! transports or sessions to it.

use flowgraph_collab::protocol::{Frame, PeerInfo, RejectReason, SyncMessage};
use flowgraph_collab::relay::{RelayConfig, RelayServer};
use flowgraph_collab::session::{Session, SessionConfig, SessionError, SessionEvent};
use flowgraph_collab::transport::{
    ConnectionState, MeshTransport, RelayPolicy, Route, TransportConfig, TransportError, TransportEvent,
};
use flowgraph_core::{Connection, EngineConfig, GraphEngine, Node, NodeTypeRegistry, Point};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type ServerWs = WebSocketStream<tokio::net::TcpStream>;

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on `port`, return its URL.
async fn start_relay_on(port: u16) -> String {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let server = RelayServer::new(RelayConfig::for_testing());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://127.0.0.1:{port}")
}

async fn start_relay() -> String {
    start_relay_on(free_port().await).await
}

async fn start_session(room: &str, user: &str, url: &str) -> Session {
    Session::start(
        SessionConfig::for_testing(room, user, url),
        Arc::new(NodeTypeRegistry::with_defaults()),
        None,
    )
    .await
    .unwrap()
}

fn node(id: &str, x: f64, y: f64) -> Node {
    Node::with_id(id, "action", Point::new(x, y))
}

fn node_count(session: &Session) -> usize {
    session.with_engine(|engine| engine.model().node_count())
}

fn has_node(session: &Session, id: &str) -> bool {
    session.with_engine(|engine| engine.model().node(id).is_some())
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "Timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Admit one client as if `peers` were already in the room, then hand the
/// server side of its socket to the test.
async fn scripted_signaling(peers: Vec<PeerInfo>) -> (String, tokio::task::JoinHandle<ServerWs>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let accepted = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        assert!(matches!(read_frame(&mut ws).await, Frame::Join { .. }));
        write_frame(&mut ws, Frame::Welcome { peers }).await;
        ws
    });
    (url, accepted)
}

async fn write_frame(ws: &mut ServerWs, frame: Frame) {
    ws.send(Message::Binary(frame.encode().unwrap().into())).await.unwrap();
}

async fn read_frame(ws: &mut ServerWs) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Binary(data) = msg {
            let bytes: Vec<u8> = data.into();
            return Frame::decode(&bytes).unwrap();
        }
    }
}

/// Skip ahead to the client's next state vector.
async fn next_state_vector(ws: &mut ServerWs) -> Vec<u8> {
    loop {
        if let Frame::Relay {
            message: SyncMessage::SyncStep1 { state_vector },
            ..
        } = read_frame(ws).await
        {
            return state_vector;
        }
    }
}

async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<TransportEvent>) -> TransportEvent {
    timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_transport_sees_peer_join_and_leave() {
    let url = start_relay().await;
    let a = MeshTransport::new(TransportConfig::for_testing(&url), "room", None, "a", "Alice");
    let mut a_rx = a.take_event_rx().unwrap();
    assert!(a.connect().await.unwrap().is_empty());
    assert_eq!(a.state(), ConnectionState::Connected);
    assert!(matches!(next_event(&mut a_rx).await, TransportEvent::Connected { .. }));

    let b = MeshTransport::new(TransportConfig::for_testing(&url), "room", None, "b", "Bob");
    let present = b.connect().await.unwrap();
    assert_eq!(present.len(), 1);
    assert_eq!(present[0].peer_id, a.peer_id());

    match next_event(&mut a_rx).await {
        TransportEvent::PeerJoined(peer) => assert_eq!(peer.peer_id, b.peer_id()),
        other => panic!("Expected PeerJoined, got {other:?}"),
    }

    let b_id = b.peer_id();
    b.disconnect().await;
    match next_event(&mut a_rx).await {
        TransportEvent::PeerLeft(peer_id) => assert_eq!(peer_id, b_id),
        other => panic!("Expected PeerLeft, got {other:?}"),
    }
}

#[tokio::test]
async fn test_targeted_relay_message() {
    let url = start_relay().await;
    let a = MeshTransport::new(TransportConfig::for_testing(&url), "room", None, "a", "Alice");
    let b = MeshTransport::new(TransportConfig::for_testing(&url), "room", None, "b", "Bob");
    let mut b_rx = b.take_event_rx().unwrap();
    a.connect().await.unwrap();
    b.connect().await.unwrap();
    assert!(matches!(next_event(&mut b_rx).await, TransportEvent::Connected { .. }));

    a.send(Some(b.peer_id()), SyncMessage::Ping { nonce: 7 }).await.unwrap();
    loop {
        match next_event(&mut b_rx).await {
            TransportEvent::Message { from, via, message } => {
                assert_eq!(from, a.peer_id());
                assert_eq!(via, Route::Relayed);
                assert_eq!(message, SyncMessage::Ping { nonce: 7 });
                break;
            }
            TransportEvent::Route { .. } => continue,
            other => panic!("Unexpected {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_direct_link_is_preferred() {
    let url = start_relay().await;
    let mut config = TransportConfig::for_testing(&url);
    config.relay_policy = RelayPolicy::Auto;
    config.listen_addr = Some("127.0.0.1:0".to_string());

    let a = MeshTransport::new(config.clone(), "room", None, "a", "Alice");
    let b = MeshTransport::new(config, "room", None, "b", "Bob");
    let mut a_rx = a.take_event_rx().unwrap();
    a.connect().await.unwrap();
    assert!(a.direct_addr().is_some());
    b.connect().await.unwrap();

    let a_id = a.peer_id();
    let b_id = b.peer_id();
    eventually("direct link from b", || b.route(&a_id) == Some(Route::Direct)).await;
    eventually("direct link at a", || a.route(&b_id) == Some(Route::Direct)).await;

    b.send(Some(a_id), SyncMessage::Ping { nonce: 1 }).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        assert!(Instant::now() < deadline, "Ping never arrived");
        if let TransportEvent::Message { from, via, .. } = next_event(&mut a_rx).await {
            assert_eq!(from, b_id);
            assert_eq!(via, Route::Direct);
            break;
        }
    }
}

#[tokio::test]
async fn test_relay_only_never_dials() {
    let url = start_relay().await;
    let mut direct = TransportConfig::for_testing(&url);
    direct.listen_addr = Some("127.0.0.1:0".to_string());
    let mut relay_only = TransportConfig::for_testing(&url);
    relay_only.relay_policy = RelayPolicy::RelayOnly;

    let a = MeshTransport::new(direct, "room", None, "a", "Alice");
    let b = MeshTransport::new(relay_only, "room", None, "b", "Bob");
    a.connect().await.unwrap();
    b.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(b.route(&a.peer_id()), Some(Route::Relayed));
    assert!(b.direct_addr().is_none());
}

#[tokio::test]
async fn test_second_endpoint_used_when_first_is_down() {
    let url = start_relay().await;
    let dead = format!("ws://127.0.0.1:{}", free_port().await);
    let mut config = TransportConfig::for_testing(&dead);
    config.signaling_urls.push(url.clone());
    let a = MeshTransport::new(config, "room", None, "a", "Alice");
    let mut rx = a.take_event_rx().unwrap();
    a.connect().await.unwrap();
    match next_event(&mut rx).await {
        TransportEvent::Connected { endpoint, .. } => assert_eq!(endpoint, url),
        other => panic!("Expected Connected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_two_sessions_converge() {
    let url = start_relay().await;
    let a = start_session("flow", "alice", &url).await;
    let b = start_session("flow", "bob", &url).await;

    a.with_engine(|e| e.add_node(node("n1", 100.0, 100.0))).unwrap();
    b.with_engine(|e| e.add_node(node("n2", 300.0, 100.0))).unwrap();

    eventually("both nodes at a", || has_node(&a, "n1") && has_node(&a, "n2")).await;
    eventually("both nodes at b", || has_node(&b, "n1") && has_node(&b, "n2")).await;

    a.with_engine(|e| e.add_connection(Connection::with_id("c1", "n1", "n2"))).unwrap();
    eventually("connection at b", || {
        b.with_engine(|e| e.model().connection_count() == 1)
    })
    .await;

    // Deleting a node removes its connections on every replica.
    b.with_engine(|e| e.delete_node(&"n2".into())).unwrap();
    eventually("cascade at a", || {
        a.with_engine(|e| e.model().node_count() == 1 && e.model().connection_count() == 0)
    })
    .await;

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_undo_is_published_as_edit() {
    let url = start_relay().await;
    let a = start_session("flow", "alice", &url).await;
    let b = start_session("flow", "bob", &url).await;

    a.with_engine(|e| e.add_node(node("n1", 0.0, 0.0))).unwrap();
    eventually("node at b", || has_node(&b, "n1")).await;

    assert!(a.with_engine(|e| e.undo()).unwrap());
    eventually("undo at b", || !has_node(&b, "n1")).await;
    // Remote merges never enter the local history.
    assert!(!b.with_engine(|e| e.can_undo()));
}

#[tokio::test]
async fn test_offline_edits_sync_on_reconnect() {
    let port = free_port().await;
    let url = format!("ws://127.0.0.1:{port}");

    let a = start_session("flow", "alice", &url).await;
    assert_ne!(a.connection_state(), ConnectionState::Connected);
    for i in 0..10 {
        a.with_engine(|e| e.add_node(node(&format!("a{i}"), i as f64 * 50.0, 0.0))).unwrap();
    }

    let synced = Arc::new(Mutex::new(Vec::new()));
    let seen = synced.clone();
    let _sub = a.subscribe(move |event| {
        if let SessionEvent::Synced { peer_id } = event {
            seen.lock().unwrap().push(*peer_id);
        }
    });

    start_relay_on(port).await;
    let b = start_session("flow", "bob", &url).await;

    eventually("a reconnected", || a.connection_state() == ConnectionState::Connected).await;
    eventually("b caught up", || node_count(&b) == 10).await;
    eventually("a synced with b", || synced.lock().unwrap().contains(&b.peer_id())).await;
    assert_eq!(node_count(&a), 10);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let url = start_relay().await;
    let a = start_session("room-1", "alice", &url).await;
    let b = start_session("room-2", "bob", &url).await;

    a.with_engine(|e| e.add_node(node("n1", 0.0, 0.0))).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(node_count(&b), 0);
    assert!(a.peers().is_empty());
    assert!(b.peers().is_empty());
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let url = start_relay().await;
    let mut config = SessionConfig::for_testing("secret", "alice", &url);
    config.password = Some("hunter2".to_string());
    let registry = Arc::new(NodeTypeRegistry::with_defaults());
    let _a = Session::start(config.clone(), registry.clone(), None).await.unwrap();

    config.user_id = "mallory".to_string();
    config.password = Some("guess".to_string());
    let err = Session::start(config.clone(), registry.clone(), None).await.err().unwrap();
    assert!(matches!(
        err,
        SessionError::Transport(TransportError::Rejected(RejectReason::WrongKey))
    ));

    config.password = None;
    let err = Session::start(config, registry, None).await.err().unwrap();
    assert!(matches!(
        err,
        SessionError::Transport(TransportError::Rejected(RejectReason::WrongKey))
    ));
}

#[tokio::test]
async fn test_resync_recovers_dropped_relay_frames() {
    let ghost = PeerInfo::new("ghost", "Ghost");
    let (url, accepted) = scripted_signaling(vec![ghost.clone()]).await;
    let mut config = SessionConfig::for_testing("room", "alice", &url);
    config.sync_interval = Duration::from_secs(60);
    let session = Session::start(config, Arc::new(NodeTypeRegistry::with_defaults()), None)
        .await
        .unwrap();
    let mut ws = accepted.await.unwrap();
    next_state_vector(&mut ws).await;

    // Two edits by the ghost; the relay loses the first.
    let mut remote = GraphEngine::new(EngineConfig::for_testing("ghost"), Arc::new(NodeTypeRegistry::with_defaults()));
    remote.add_node(node("n1", 0.0, 0.0)).unwrap();
    let after_first = remote.state_vector();
    remote.add_node(node("n2", 100.0, 0.0)).unwrap();
    let second = remote.encode_diff(&after_first).unwrap();
    write_frame(
        &mut ws,
        Frame::relay("room", ghost.peer_id, None, SyncMessage::Update { clock: 2, update: second }),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node_count(&session), 0, "update applied without its dependency");

    write_frame(&mut ws, Frame::Resync { skipped: 1 }).await;
    let state_vector = next_state_vector(&mut ws).await;
    let missing = remote.encode_diff(&state_vector).unwrap();
    write_frame(
        &mut ws,
        Frame::relay("room", ghost.peer_id, Some(session.peer_id()), SyncMessage::SyncStep2 { update: missing }),
    )
    .await;
    eventually("both ghost edits", || has_node(&session, "n1") && has_node(&session, "n2")).await;
}

#[tokio::test]
async fn test_state_vector_is_reannounced_periodically() {
    let (url, accepted) = scripted_signaling(vec![PeerInfo::new("ghost", "Ghost")]).await;
    let mut config = SessionConfig::for_testing("room", "alice", &url);
    config.sync_interval = Duration::from_millis(100);
    let _session = Session::start(config, Arc::new(NodeTypeRegistry::with_defaults()), None)
        .await
        .unwrap();
    let mut ws = accepted.await.unwrap();

    // One on connect, then the periodic ones.
    for _ in 0..3 {
        next_state_vector(&mut ws).await;
    }
}

#[tokio::test]
async fn test_burst_through_tiny_relay_buffer_converges() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = RelayServer::new(RelayConfig {
        broadcast_capacity: 4,
        ..RelayConfig::for_testing()
    });
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    let registry = Arc::new(NodeTypeRegistry::with_defaults());
    let mut configs = [
        SessionConfig::for_testing("room", "alice", &url),
        SessionConfig::for_testing("room", "bob", &url),
    ];
    for config in &mut configs {
        config.transport.relay_policy = RelayPolicy::RelayOnly;
    }
    let [alice, bob] = configs;
    let a = Session::start(alice, registry.clone(), None).await.unwrap();
    let b = Session::start(bob, registry, None).await.unwrap();
    eventually("peers see each other", || !a.peers().is_empty() && !b.peers().is_empty()).await;

    for i in 0..300 {
        a.with_engine(|e| e.add_node(node(&format!("n{i}"), i as f64, 0.0))).unwrap();
    }
    eventually("bob has every node", || node_count(&b) == 300).await;
}
