//! Ack/retry engine tests:
//! - at-most-once is a single send
//! - at-least-once resends the same message id with incremented retry
//!   counts, backing off exponentially
//! - exhaustion surfaces DeliveryFailed (scenario: ack never arrives)
//! - an ack, even one arriving after retries, completes the send

mod common;

use std::sync::Arc;
use std::time::Duration;

use axon_core::delivery::{DeliveryEngine, DeliveryError, RetryPolicy};
use axon_core::transport::{failover::Failover, Transport};
use axon_types::{Envelope, QosLevel};
use common::MockTransport;
use serde_json::json;

fn engine(transport: Arc<MockTransport>) -> Arc<DeliveryEngine> {
    let failover = Failover::new(vec![transport as Arc<dyn Transport>]);
    DeliveryEngine::new(
        failover,
        RetryPolicy {
            ack_timeout: Duration::from_millis(80),
            max_retries: 2,
            backoff_cap: Duration::from_millis(500),
        },
    )
}

#[tokio::test]
async fn test_at_most_once_sends_exactly_once() {
    let transport = MockTransport::new("mock");
    let delivery = engine(transport.clone());

    let envelope = Envelope::request("a", "b", json!({})).with_qos(QosLevel::AtMostOnce);
    delivery.send(envelope).await.unwrap();
    assert_eq!(transport.sent_count(), 1);
}

#[tokio::test]
async fn test_prompt_ack_avoids_retries() {
    let transport = MockTransport::new("mock");
    let delivery = engine(transport.clone());

    let envelope = Envelope::request("a", "b", json!({}));
    let message_id = envelope.message_id.clone();

    let acker = {
        let delivery = delivery.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(delivery.ack_received(&message_id).await);
        })
    };

    delivery.send(envelope).await.unwrap();
    acker.await.unwrap();
    assert_eq!(transport.sent_count(), 1);
}

#[tokio::test]
async fn test_exhaustion_reports_delivery_failed() {
    let transport = MockTransport::new("mock");
    let delivery = engine(transport.clone());

    let envelope = Envelope::request("a", "b", json!({}));
    let message_id = envelope.message_id.clone();

    let err = delivery.send(envelope).await.unwrap_err();
    match err {
        DeliveryError::DeliveryFailed {
            message_id: failed,
            attempts,
        } => {
            assert_eq!(failed, message_id);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected DeliveryFailed, got {other}"),
    }

    // Same message id every time, retry_count incremented per resend.
    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|e| e.message_id == message_id));
    let counts: Vec<u32> = sent.iter().map(|e| e.retry_count).collect();
    assert_eq!(counts, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_ack_after_retry_completes_send() {
    let transport = MockTransport::new("mock");
    let delivery = engine(transport.clone());

    let envelope = Envelope::request("a", "b", json!({}));
    let message_id = envelope.message_id.clone();

    let acker = {
        let delivery = delivery.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            // Ack only once the first resend is observed.
            loop {
                if transport.sent_count() >= 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(delivery.ack_received(&message_id).await);
        })
    };

    delivery.send(envelope).await.unwrap();
    acker.await.unwrap();
    assert!(transport.sent_count() >= 2);
}

#[tokio::test]
async fn test_unknown_ack_is_ignored() {
    let transport = MockTransport::new("mock");
    let delivery = engine(transport);
    assert!(!delivery.ack_received("no-such-correlation").await);
}

#[tokio::test]
async fn test_retries_survive_transport_outage() {
    // The transport rejects the first attempt, then a probe revives it
    // before the retry budget runs out; the ack completes the send.
    let transport = MockTransport::new("mock");
    transport.set_fail_sends(true);
    let failover = Failover::new(vec![transport.clone() as Arc<dyn Transport>]);
    let delivery = DeliveryEngine::new(
        failover.clone(),
        RetryPolicy {
            ack_timeout: Duration::from_millis(80),
            max_retries: 2,
            backoff_cap: Duration::from_millis(500),
        },
    );

    let envelope = Envelope::request("a", "b", json!({}));
    let message_id = envelope.message_id.clone();

    let recoverer = {
        let delivery = delivery.clone();
        let transport = transport.clone();
        let failover = failover.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            transport.set_fail_sends(false);
            failover.probe_all().await;
            loop {
                if transport.sent_count() >= 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(delivery.ack_received(&message_id).await);
        })
    };

    delivery.send(envelope).await.unwrap();
    recoverer.await.unwrap();
    assert!(transport.sent_count() >= 1);
}
