//! Inbound dispatch: one loop, one queue.
//!
//! Every transport enqueues decoded envelopes onto the intake channel; this
//! single consumer dedupes, acknowledges, and routes them. Results and
//! errors resolve pending correlations registered via
//! [`MessageRouter::expect_result`]; requests are enqueued for whoever took
//! the request receiver; advertisements feed the capability registry; acks
//! feed the delivery engine. Nothing here ever creates a second dispatch
//! path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axon_types::{CapabilityAdvertisement, Envelope, MessageType, QosLevel};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::delivery::{DedupeWindow, DeliveryEngine};
use crate::registry::CapabilityRegistry;
use crate::transport::failover::Failover;

const REQUEST_QUEUE_DEPTH: usize = 256;

pub struct MessageRouter {
    node_id: String,
    delivery: Arc<DeliveryEngine>,
    dedupe: Arc<DedupeWindow>,
    registry: Arc<CapabilityRegistry>,
    failover: Arc<Failover>,
    pending_results: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    requests_tx: mpsc::Sender<Envelope>,
    requests_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl MessageRouter {
    pub fn new(
        node_id: impl Into<String>,
        delivery: Arc<DeliveryEngine>,
        dedupe: Arc<DedupeWindow>,
        registry: Arc<CapabilityRegistry>,
        failover: Arc<Failover>,
    ) -> Arc<Self> {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        Arc::new(Self {
            node_id: node_id.into(),
            delivery,
            dedupe,
            registry,
            failover,
            pending_results: Mutex::new(HashMap::new()),
            requests_tx,
            requests_rx: Mutex::new(Some(requests_rx)),
            consumer: Mutex::new(None),
        })
    }

    /// Start consuming the intake channel.
    pub async fn spawn(self: &Arc<Self>, mut intake: mpsc::Receiver<Envelope>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(envelope) = intake.recv().await {
                this.handle_inbound(envelope).await;
            }
        });
        *self.consumer.lock().await = Some(handle);
    }

    /// The application-facing request stream. Yields `request`-type
    /// envelopes addressed to this node, including `control.cancel`
    /// notices. Can be taken exactly once.
    pub async fn take_requests(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.requests_rx.lock().await.take()
    }

    /// Register interest in the result for a correlation id.
    pub async fn expect_result(&self, correlation_id: &str) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.pending_results
            .lock()
            .await
            .insert(correlation_id.to_string(), tx);
        rx
    }

    /// Drop a registered expectation; its receiver resolves with an error.
    pub async fn cancel_expectation(&self, correlation_id: &str) {
        self.pending_results.lock().await.remove(correlation_id);
    }

    async fn handle_inbound(&self, envelope: Envelope) {
        if envelope.is_expired(Utc::now()) {
            debug!(message_id = %envelope.message_id, "dropping expired envelope");
            return;
        }

        if envelope.qos == QosLevel::AtLeastOnce && envelope.message_type != MessageType::Ack {
            let ttl = Duration::from_secs(envelope.ttl_seconds.max(1));
            let first_sight = self.dedupe.observe(&envelope.message_id, ttl).await;
            // Duplicates are re-acked — the sender may have missed the
            // first ack — but produce no further effect.
            self.send_ack(&envelope).await;
            if !first_sight {
                debug!(message_id = %envelope.message_id, "duplicate delivery suppressed");
                return;
            }
        }

        match envelope.message_type {
            MessageType::Ack => {
                if !self.delivery.ack_received(&envelope.correlation_id).await {
                    debug!(
                        correlation_id = %envelope.correlation_id,
                        "ack without pending send"
                    );
                }
            }
            MessageType::Advertisement => {
                match serde_json::from_value::<CapabilityAdvertisement>(envelope.payload) {
                    Ok(ad) => self.registry.register(ad).await,
                    Err(e) => {
                        warn!(
                            sender = %envelope.sender_id,
                            error = %e,
                            "dropping malformed advertisement"
                        );
                    }
                }
            }
            MessageType::Result | MessageType::Error => {
                let waiter = self
                    .pending_results
                    .lock()
                    .await
                    .remove(&envelope.correlation_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(envelope);
                    }
                    None => {
                        debug!(
                            correlation_id = %envelope.correlation_id,
                            "result without waiter dropped"
                        );
                    }
                }
            }
            MessageType::Request => {
                if let Err(e) = self.requests_tx.try_send(envelope) {
                    warn!(error = %e, "request queue full, dropping request");
                }
            }
        }
    }

    async fn send_ack(&self, envelope: &Envelope) {
        let ack = Envelope::ack_for(envelope, &self.node_id);
        if let Err(e) = self.failover.send(&ack).await {
            warn!(
                message_id = %envelope.message_id,
                error = %e,
                "could not deliver ack"
            );
        }
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.consumer.lock().await.take() {
            handle.abort();
        }
        self.pending_results.lock().await.clear();
    }
}
