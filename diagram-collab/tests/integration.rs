//! End-to-end tests: a real hub on a local port and real sessions talking
//! to it over WebSocket.

use diagram_collab::{
    BackendKind, CollabSession, Collaborator, ConnectionState, DiagramSnapshot, Envelope,
    EnvelopeBody, Hub, HubConfig, SnapshotPatch, SyncConfig, SyncEvent,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a hub on a free port, return it with the port.
async fn start_test_hub(max_peers_per_room: usize) -> (Arc<Hub>, u16) {
    let port = free_port().await;
    let hub = Arc::new(Hub::new(HubConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        max_peers_per_room,
    }));
    let server = hub.clone();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the hub time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (hub, port)
}

fn relay_config(port: u16, room: &str) -> SyncConfig {
    SyncConfig {
        update_debounce: Duration::from_millis(20),
        cursor_interval: Duration::from_millis(10),
        ..SyncConfig::new(format!("ws://127.0.0.1:{port}"), room)
    }
}

/// Poll `check` until it holds or two seconds pass.
async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Next snapshot event, skipping everything else.
async fn next_snapshot(events: &mut broadcast::Receiver<SyncEvent>) -> (String, DiagramSnapshot) {
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::SnapshotReceived { sender_id, snapshot }) => {
                    return (sender_id, snapshot)
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("Session closed"),
            }
        }
    })
    .await
    .expect("No snapshot arrived")
}

/// Count the snapshot events arriving within `window`.
async fn count_snapshots(events: &mut broadcast::Receiver<SyncEvent>, window: Duration) -> usize {
    let mut count = 0;
    let _ = timeout(window, async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::SnapshotReceived { .. }) => count += 1,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await;
    count
}

/// Start two relay sessions in `room` and wait until they see each other.
async fn pair(port: u16, room: &str) -> (CollabSession, CollabSession) {
    let alice = CollabSession::start(relay_config(port, room), Collaborator::new("alice", "Alice"));
    let bob = CollabSession::start(relay_config(port, room), Collaborator::new("bob", "Bob"));
    assert!(
        wait_until(|| alice.collaborators().len() == 1 && bob.collaborators().len() == 1).await,
        "Sessions should discover each other"
    );
    (alice, bob)
}

fn node(id: &str) -> serde_json::Value {
    json!({ "id": id, "label": id })
}

#[tokio::test]
async fn test_hub_accepts_room_routes() {
    let (_hub, port) = start_test_hub(10).await;

    let relay = connect_async(format!("ws://127.0.0.1:{port}/relay/r1")).await;
    assert!(relay.is_ok(), "Relay route should accept");
    let crdt = connect_async(format!("ws://127.0.0.1:{port}/crdt/r1")).await;
    assert!(crdt.is_ok(), "CRDT route should accept");
}

#[tokio::test]
async fn test_hub_rejects_unknown_path() {
    let (_hub, port) = start_test_hub(10).await;

    let result = connect_async(format!("ws://127.0.0.1:{port}/somewhere/else")).await;
    assert!(result.is_err(), "Unknown paths should fail the handshake");
}

#[tokio::test]
async fn test_room_full_gets_error_and_close() {
    let (_hub, port) = start_test_hub(1).await;
    let url = format!("ws://127.0.0.1:{port}/relay/tiny");

    let (_first, _) = connect_async(&url).await.unwrap();
    let (mut second, _) = connect_async(&url).await.unwrap();

    let msg = timeout(Duration::from_secs(2), second.next())
        .await
        .expect("Hub should answer")
        .expect("Stream should yield")
        .unwrap();
    let text = msg.into_text().unwrap();
    let envelope = Envelope::from_json(text.as_str()).unwrap().unwrap();
    assert!(matches!(envelope.body, EnvelopeBody::Error(_)));

    // Then the hub closes
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match second.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn test_session_connects_over_relay() {
    let (hub, port) = start_test_hub(10).await;
    let session = CollabSession::start(relay_config(port, "solo"), Collaborator::new("u1", "Una"));
    assert_eq!(session.backend(), BackendKind::Relay);

    let mut state = session.watch_state();
    let connected = timeout(Duration::from_secs(2), state.wait_for(|s| s.is_connected)).await;
    assert!(connected.is_ok());

    let current = session.state();
    assert_eq!(current.connection, ConnectionState::Connected);
    assert!(current.is_synced, "Relay is synced as soon as it is connected");
    assert!(current.error.is_none());
    assert_eq!(hub.active_rooms().await, vec!["relay/solo"]);
}

#[tokio::test]
async fn test_update_reaches_peer() {
    let (_hub, port) = start_test_hub(10).await;
    let (alice, bob) = pair(port, "updates").await;
    let mut bob_events = bob.subscribe();

    alice.send_update(
        SnapshotPatch::default()
            .with_nodes(vec![node("a")])
            .with_title("Flow"),
    );

    let (sender, snapshot) = next_snapshot(&mut bob_events).await;
    assert_eq!(sender, "alice");
    assert_eq!(snapshot.nodes, vec![node("a")]);
    assert_eq!(snapshot.title.as_deref(), Some("Flow"));
}

#[tokio::test]
async fn test_burst_is_debounced_into_one_message() {
    let (_hub, port) = start_test_hub(10).await;
    let (alice, bob) = pair(port, "burst").await;
    let mut bob_events = bob.subscribe();

    for i in 0..10 {
        alice.send_update(SnapshotPatch::default().with_nodes(vec![node(&format!("n{i}"))]));
    }

    let (_, snapshot) = next_snapshot(&mut bob_events).await;
    assert_eq!(snapshot.nodes, vec![node("n9")], "Only the latest state is sent");
    assert_eq!(count_snapshots(&mut bob_events, Duration::from_millis(200)).await, 0);
}

#[tokio::test]
async fn test_applied_remote_update_is_not_echoed() {
    let (_hub, port) = start_test_hub(10).await;
    let (alice, bob) = pair(port, "echo").await;
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    let nodes = vec![node("a"), node("b")];
    alice.send_update(SnapshotPatch::default().with_nodes(nodes.clone()));
    let (_, received) = next_snapshot(&mut bob_events).await;

    // The editor re-reports the state it was just handed
    bob.send_update(SnapshotPatch::from(received));

    assert_eq!(
        count_snapshots(&mut alice_events, Duration::from_millis(200)).await,
        0,
        "Re-reporting a remote state must not bounce it back"
    );

    // A genuine edit afterwards goes out
    bob.send_update(SnapshotPatch::default().with_nodes(vec![node("c")]));
    let (sender, snapshot) = next_snapshot(&mut alice_events).await;
    assert_eq!(sender, "bob");
    assert_eq!(snapshot.nodes, vec![node("c")]);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (_hub, port) = start_test_hub(10).await;
    let (alice, _bob) = pair(port, "room-a").await;
    let carol = CollabSession::start(relay_config(port, "room-b"), Collaborator::new("carol", "Carol"));
    let mut carol_events = carol.subscribe();

    let mut state = carol.watch_state();
    timeout(Duration::from_secs(2), state.wait_for(|s| s.is_connected))
        .await
        .unwrap()
        .unwrap();

    alice.send_update(SnapshotPatch::default().with_nodes(vec![node("secret")]));
    assert_eq!(count_snapshots(&mut carol_events, Duration::from_millis(200)).await, 0);
    assert!(carol.collaborators().is_empty());
}

#[tokio::test]
async fn test_disconnect_is_final() {
    let (hub, port) = start_test_hub(10).await;
    let (alice, bob) = pair(port, "bye").await;

    alice.disconnect();
    let mut state = alice.watch_state();
    timeout(Duration::from_secs(2), state.wait_for(|s| s.connection == ConnectionState::Disconnected))
        .await
        .unwrap()
        .unwrap();

    assert!(wait_until(|| bob.collaborators().is_empty()).await);
    assert!(alice.collaborators().is_empty());

    // No retry happens on its own
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(alice.state().connection, ConnectionState::Disconnected);
    assert_eq!(alice.state().reconnect_attempt, 0);

    drop(bob);
    let drained = timeout(Duration::from_secs(2), async {
        while hub.stats().await.active_connections != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "Hub should release both connections");
    assert!(hub.active_rooms().await.is_empty());
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let (_hub, port) = start_test_hub(10).await;
    let (alice, bob) = pair(port, "again").await;

    alice.disconnect();
    assert!(wait_until(|| bob.collaborators().is_empty()).await);

    alice.reconnect();
    assert!(wait_until(|| alice.state().is_connected).await);
    assert!(wait_until(|| bob.collaborators().len() == 1 && alice.collaborators().len() == 1).await);
}

#[tokio::test]
async fn test_raw_client_sees_session_traffic() {
    let (_hub, port) = start_test_hub(10).await;
    let (mut raw, _) = connect_async(format!("ws://127.0.0.1:{port}/relay/mixed"))
        .await
        .unwrap();

    let session = CollabSession::start(relay_config(port, "mixed"), Collaborator::new("s1", "Sam"));

    // First thing the session says is its join
    let text = timeout(Duration::from_secs(2), raw.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .into_text()
        .unwrap();
    let envelope = Envelope::from_json(text.as_str()).unwrap().unwrap();
    assert_eq!(envelope.sender_id, "s1");
    assert!(matches!(envelope.body, EnvelopeBody::Join(_)));

    // A hand-written update is rendered by the session
    let update = Envelope::diagram_update("raw", DiagramSnapshot::new(vec![node("x")], vec![]));
    let mut events = session.subscribe();
    raw.send(Message::Text(update.to_json().unwrap().into()))
        .await
        .unwrap();
    let (sender, snapshot) = next_snapshot(&mut events).await;
    assert_eq!(sender, "raw");
    assert_eq!(snapshot.nodes, vec![node("x")]);
}

#[tokio::test]
async fn test_malformed_frames_are_survived() {
    let (_hub, port) = start_test_hub(10).await;
    let (mut raw, _) = connect_async(format!("ws://127.0.0.1:{port}/relay/noise"))
        .await
        .unwrap();
    let session = CollabSession::start(relay_config(port, "noise"), Collaborator::new("s1", "Sam"));
    assert!(wait_until(|| session.state().is_connected).await);

    raw.send(Message::Text("{not json".into())).await.unwrap();
    raw.send(Message::Text(r#"{"type":"teleport","senderId":"raw","timestamp":1}"#.into()))
        .await
        .unwrap();

    let update = Envelope::diagram_update("raw", DiagramSnapshot::new(vec![node("ok")], vec![]));
    let mut events = session.subscribe();
    raw.send(Message::Text(update.to_json().unwrap().into()))
        .await
        .unwrap();

    let (_, snapshot) = next_snapshot(&mut events).await;
    assert_eq!(snapshot.nodes, vec![node("ok")]);
    assert!(session.state().is_connected);
}
