//! Integration tests for message classification and the event channel.
//!
//! These tests drive a dispatcher with raw wire payloads, the way a
//! transport layer would, and validate what reaches the application
//! through the typed event stream.

use std::sync::Once;

use serde_json::json;
use tokio::sync::mpsc;

use meshwire::{
    ConnectionRegistry, Dispatcher, FirstEligible, MeshEvent, MessageBody, PeerDirectory, PeerId,
    RelayConfig,
};

/// One-time tracing initialization
static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("warn")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn spawn_node(id: &str) -> (Dispatcher, mpsc::Receiver<MeshEvent>) {
    init_tracing();
    Dispatcher::spawn(id.into(), PeerDirectory::new(), RelayConfig::default())
}

async fn feed_json(dispatcher: &Dispatcher, from: &str, value: serde_json::Value) {
    dispatcher
        .handle_peer_data(&serde_json::to_vec(&value).unwrap(), &from.into())
        .await;
}

// ============================================================================
// Classification stream
// ============================================================================

#[tokio::test]
async fn mixed_traffic_produces_the_expected_event_stream() {
    let (dispatcher, mut events) = spawn_node("node-b");

    // 1. unstructured text
    dispatcher
        .handle_peer_data(b"not json at all", &"node-a".into())
        .await;
    // 2. gossip
    feed_json(&dispatcher, "node-a", json!({"type": "gossip", "topic": "t", "seq": 1})).await;
    // 3. consumed protocol traffic: ack, failure, optimizer confirmation
    feed_json(
        &dispatcher,
        "node-a",
        json!({"type": "relay_ack", "to": "x", "from": "y", "originalTimestamp": 1, "receivedTimestamp": 2, "relayPath": []}),
    )
    .await;
    feed_json(
        &dispatcher,
        "node-a",
        json!({"type": "relay_failure", "to": "x", "from": "y", "targetPeer": "z", "reason": "Peer not connected", "timestamp": 3}),
    )
    .await;
    feed_json(
        &dispatcher,
        "node-a",
        json!({"type": "optimized_relay_confirmation", "id": 9}),
    )
    .await;
    // 4. internal kademlia rpc
    feed_json(&dispatcher, "node-a", json!({"type": "kademlia_rpc", "method": "PING"})).await;
    // 5. structured application message
    feed_json(&dispatcher, "node-a", json!({"type": "chat", "text": "hi"})).await;

    // consumed messages leave no trace between the surfaced ones
    match events.recv().await {
        Some(MeshEvent::Message {
            body: MessageBody::Text(text),
            ..
        }) => assert_eq!(text, "not json at all"),
        other => panic!("expected text message, got {other:?}"),
    }
    assert!(matches!(
        events.recv().await,
        Some(MeshEvent::Gossip { ack: false, .. })
    ));
    assert!(matches!(
        events.recv().await,
        Some(MeshEvent::KademliaRpc { .. })
    ));
    match events.recv().await {
        Some(MeshEvent::Message {
            body: MessageBody::Structured(value),
            ..
        }) => assert_eq!(value["type"], "chat"),
        other => panic!("expected structured message, got {other:?}"),
    }
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn malformed_input_takes_no_protocol_path() {
    let (dispatcher, mut events) = spawn_node("node-b");

    // looks almost like a relay signal, but is not valid JSON
    dispatcher
        .handle_peer_data(b"{\"type\": \"relay_signal\", ", &"node-a".into())
        .await;

    match events.try_recv() {
        Ok(MeshEvent::Message {
            from,
            body: MessageBody::Text(_),
        }) => assert_eq!(from.as_str(), "node-a"),
        other => panic!("expected text message event, got {other:?}"),
    }
    assert_eq!(dispatcher.pending_relays().await, 0, "no relay state created");
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn batched_signals_fan_out_under_the_batch_origin() {
    let (dispatcher, mut events) = spawn_node("node-b");

    feed_json(
        &dispatcher,
        "relay-peer",
        json!({
            "type": "batched_signals",
            "from": "node-a",
            "signals": [{"sdp": "one"}, {"sdp": "two"}, {"sdp": "three"}],
        }),
    )
    .await;

    for expected in ["one", "two", "three"] {
        match events.recv().await {
            Some(MeshEvent::Signal { from, signal }) => {
                assert_eq!(from.as_str(), "node-a", "batch origin, not transport sender");
                assert_eq!(signal["sdp"], expected);
            }
            other => panic!("expected signal event, got {other:?}"),
        }
    }
    assert!(events.try_recv().is_err());
}

// ============================================================================
// Ancillary handlers
// ============================================================================

#[tokio::test]
async fn rejection_with_alternatives_cleans_up_and_notifies() {
    init_tracing();
    let connections = ConnectionRegistry::new();
    connections.record_pending("node-x".into());
    connections.record_attempt("node-x".into());

    let (dispatcher, mut events) = Dispatcher::spawn_with(
        "node-b".into(),
        PeerDirectory::new(),
        RelayConfig::default(),
        std::sync::Arc::new(FirstEligible),
        None,
        connections.clone(),
    );

    feed_json(
        &dispatcher,
        "node-x",
        json!({
            "type": "connection_rejected",
            "from": "node-x",
            "reason": "at capacity",
            "alternativePeers": ["node-m", "node-n"],
        }),
    )
    .await;

    assert!(!connections.has_pending(&"node-x".into()));
    assert_eq!(connections.attempts_for(&"node-x".into()), 0);

    match events.recv().await {
        Some(MeshEvent::ConnectionRejected {
            rejected_by,
            reason,
            alternative_peers,
        }) => {
            assert_eq!(rejected_by.as_str(), "node-x");
            assert_eq!(reason, "at capacity");
            assert_eq!(
                alternative_peers,
                vec![PeerId::from("node-m"), PeerId::from("node-n")]
            );
        }
        other => panic!("expected rejection event, got {other:?}"),
    }
}

#[tokio::test]
async fn reconnection_data_is_surfaced_to_both_consumers() {
    let (dispatcher, mut events) = spawn_node("node-b");

    feed_json(
        &dispatcher,
        "node-a",
        json!({
            "type": "reconnection_data",
            "reason": "peer rebalancing",
            "peers": ["node-m", "node-n"],
        }),
    )
    .await;

    match events.recv().await {
        Some(MeshEvent::ReconnectionData { from, reason, peers }) => {
            assert_eq!(from.as_str(), "node-a");
            assert_eq!(reason, "peer rebalancing");
            assert_eq!(peers.len(), 2);
        }
        other => panic!("expected reconnection data event, got {other:?}"),
    }
    match events.recv().await {
        Some(MeshEvent::PeerEvicted {
            reason,
            alternative_peers,
        }) => {
            assert_eq!(reason, "peer rebalancing");
            assert_eq!(alternative_peers.len(), 2);
        }
        other => panic!("expected eviction event, got {other:?}"),
    }
}
