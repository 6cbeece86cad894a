//! Shared-storage mailbox transport tests: file-per-message delivery,
//! broadcast fan-out, durability for not-yet-started peers, and malformed
//! files being dropped without wedging the poller.

use std::time::Duration;

use axon_core::transport::{mailbox::MailboxTransport, Transport};
use axon_types::{Envelope, BROADCAST};
use serde_json::json;
use tokio::sync::mpsc;

const POLL: Duration = Duration::from_millis(25);

async fn recv_one(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for mailbox delivery")
        .expect("intake closed")
}

#[tokio::test]
async fn test_point_to_point_delivery() {
    let root = tempfile::tempdir().unwrap();
    let (alice_tx, _alice_rx) = mpsc::channel(16);
    let (bob_tx, mut bob_rx) = mpsc::channel(16);

    let alice = MailboxTransport::start("alice", root.path(), POLL, alice_tx)
        .await
        .unwrap();
    let _bob = MailboxTransport::start("bob", root.path(), POLL, bob_tx)
        .await
        .unwrap();

    let envelope = Envelope::request("alice", "bob", json!({"hello": "bob"}));
    alice.send(&envelope).await.unwrap();

    let received = recv_one(&mut bob_rx).await;
    assert_eq!(received, envelope);

    // Consumed: the message file is gone.
    tokio::time::sleep(POLL * 3).await;
    assert!(tokio::time::timeout(Duration::from_millis(100), bob_rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_broadcast_reaches_every_peer_but_not_sender() {
    let root = tempfile::tempdir().unwrap();
    let (alice_tx, mut alice_rx) = mpsc::channel(16);
    let (bob_tx, mut bob_rx) = mpsc::channel(16);
    let (carol_tx, mut carol_rx) = mpsc::channel(16);

    let alice = MailboxTransport::start("alice", root.path(), POLL, alice_tx)
        .await
        .unwrap();
    let _bob = MailboxTransport::start("bob", root.path(), POLL, bob_tx)
        .await
        .unwrap();
    let _carol = MailboxTransport::start("carol", root.path(), POLL, carol_tx)
        .await
        .unwrap();

    let envelope = Envelope::request("alice", BROADCAST, json!({"all": true}));
    alice.send(&envelope).await.unwrap();

    assert_eq!(recv_one(&mut bob_rx).await.payload, json!({"all": true}));
    assert_eq!(recv_one(&mut carol_rx).await.payload, json!({"all": true}));
    assert!(
        tokio::time::timeout(Duration::from_millis(150), alice_rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_delivery_to_peer_that_starts_later() {
    let root = tempfile::tempdir().unwrap();
    let (alice_tx, _alice_rx) = mpsc::channel(16);

    let alice = MailboxTransport::start("alice", root.path(), POLL, alice_tx)
        .await
        .unwrap();

    // Dave's mailbox does not exist yet; the message waits on disk.
    let envelope = Envelope::request("alice", "dave", json!({"queued": true}));
    alice.send(&envelope).await.unwrap();

    let (dave_tx, mut dave_rx) = mpsc::channel(16);
    let _dave = MailboxTransport::start("dave", root.path(), POLL, dave_tx)
        .await
        .unwrap();
    assert_eq!(recv_one(&mut dave_rx).await, envelope);
}

#[tokio::test]
async fn test_malformed_file_dropped_and_polling_continues() {
    let root = tempfile::tempdir().unwrap();
    let (bob_tx, mut bob_rx) = mpsc::channel(16);
    let _bob = MailboxTransport::start("bob", root.path(), POLL, bob_tx)
        .await
        .unwrap();

    let inbox = root.path().join("bob");
    tokio::fs::write(inbox.join("00000000000000000000000000.json"), b"not json")
        .await
        .unwrap();

    let (alice_tx, _alice_rx) = mpsc::channel(16);
    let alice = MailboxTransport::start("alice", root.path(), POLL, alice_tx)
        .await
        .unwrap();
    let envelope = Envelope::request("alice", "bob", json!({"after": "junk"}));
    alice.send(&envelope).await.unwrap();

    // The junk file never surfaces; the valid one does.
    let received = recv_one(&mut bob_rx).await;
    assert_eq!(received, envelope);
    assert!(!inbox.join("00000000000000000000000000.json").exists());
}

#[tokio::test]
async fn test_probe_reflects_root_writability() {
    let root = tempfile::tempdir().unwrap();
    let (tx, _rx) = mpsc::channel(16);
    let mailbox = MailboxTransport::start("alice", root.path(), POLL, tx)
        .await
        .unwrap();
    assert!(mailbox.probe().await);
}

#[tokio::test]
async fn test_temp_files_are_not_consumed() {
    let root = tempfile::tempdir().unwrap();
    let (bob_tx, mut bob_rx) = mpsc::channel(16);
    let _bob = MailboxTransport::start("bob", root.path(), POLL, bob_tx)
        .await
        .unwrap();

    // An in-progress write (dotted temp name) must be ignored by the scan.
    let inbox = root.path().join("bob");
    tokio::fs::write(inbox.join(".partial.tmp"), b"{").await.unwrap();
    tokio::time::sleep(POLL * 3).await;
    assert!(tokio::time::timeout(Duration::from_millis(100), bob_rx.recv())
        .await
        .is_err());
    assert!(inbox.join(".partial.tmp").exists());
}
