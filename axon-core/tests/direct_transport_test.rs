//! Direct (point-to-point TCP) transport tests.

use std::time::Duration;

use axon_core::transport::{direct::DirectTransport, Transport, TransportError};
use axon_types::{Envelope, BROADCAST};
use serde_json::json;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_point_to_point_roundtrip() {
    let (alice_tx, _alice_rx) = mpsc::channel(16);
    let (bob_tx, mut bob_rx) = mpsc::channel(16);

    let alice = DirectTransport::start("127.0.0.1:0", alice_tx).await.unwrap();
    let bob = DirectTransport::start("127.0.0.1:0", bob_tx).await.unwrap();
    alice.add_peer("bob", bob.local_addr()).await;

    let envelope = Envelope::request("alice", "bob", json!({"ping": 1}));
    alice.send(&envelope).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), bob_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, envelope);
}

#[tokio::test]
async fn test_unknown_peer_is_an_error() {
    let (tx, _rx) = mpsc::channel(16);
    let alice = DirectTransport::start("127.0.0.1:0", tx).await.unwrap();

    let envelope = Envelope::request("alice", "nobody", json!({}));
    let err = alice.send(&envelope).await.unwrap_err();
    assert!(matches!(err, TransportError::UnknownPeer { peer, .. } if peer == "nobody"));
}

#[tokio::test]
async fn test_broadcast_fans_out_to_known_peers() {
    let (alice_tx, _alice_rx) = mpsc::channel(16);
    let (bob_tx, mut bob_rx) = mpsc::channel(16);
    let (carol_tx, mut carol_rx) = mpsc::channel(16);

    let alice = DirectTransport::start("127.0.0.1:0", alice_tx).await.unwrap();
    let bob = DirectTransport::start("127.0.0.1:0", bob_tx).await.unwrap();
    let carol = DirectTransport::start("127.0.0.1:0", carol_tx).await.unwrap();
    alice.add_peer("bob", bob.local_addr()).await;
    alice.add_peer("carol", carol.local_addr()).await;

    let envelope = Envelope::request("alice", BROADCAST, json!({"hello": "all"}));
    alice.send(&envelope).await.unwrap();

    let b = tokio::time::timeout(Duration::from_secs(2), bob_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let c = tokio::time::timeout(Duration::from_secs(2), carol_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.payload, json!({"hello": "all"}));
    assert_eq!(c.payload, json!({"hello": "all"}));
}

#[tokio::test]
async fn test_broadcast_with_no_peers_fails() {
    let (tx, _rx) = mpsc::channel(16);
    let alice = DirectTransport::start("127.0.0.1:0", tx).await.unwrap();
    let envelope = Envelope::request("alice", BROADCAST, json!({}));
    assert!(alice.send(&envelope).await.is_err());
}

#[tokio::test]
async fn test_probe_follows_listener_lifetime() {
    let (tx, _rx) = mpsc::channel(16);
    let alice = DirectTransport::start("127.0.0.1:0", tx).await.unwrap();
    assert!(alice.probe().await);

    alice.shutdown().await;
    assert!(!alice.probe().await);
}

#[tokio::test]
async fn test_garbage_connection_does_not_break_listener() {
    let (bob_tx, mut bob_rx) = mpsc::channel(16);
    let bob = DirectTransport::start("127.0.0.1:0", bob_tx).await.unwrap();

    // A stray client sends a non-envelope line; the listener shrugs it off.
    {
        use tokio::io::AsyncWriteExt;
        let mut stream = tokio::net::TcpStream::connect(bob.local_addr()).await.unwrap();
        stream.write_all(b"definitely not json\n").await.unwrap();
        stream.shutdown().await.unwrap();
    }

    let (alice_tx, _alice_rx) = mpsc::channel(16);
    let alice = DirectTransport::start("127.0.0.1:0", alice_tx).await.unwrap();
    alice.add_peer("bob", bob.local_addr()).await;
    let envelope = Envelope::request("alice", "bob", json!({"still": "alive"}));
    alice.send(&envelope).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), bob_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, envelope);
}
