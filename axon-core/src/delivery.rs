//! At-least-once delivery on top of the fallback coordinator.
//!
//! A `qos = at_least_once` send registers an ack waiter keyed by the
//! envelope's message id, then resends the same message id with an
//! incremented retry count on an exponential backoff until the ack arrives
//! or the retry budget is exhausted. Exhaustion is reported as
//! [`DeliveryError::DeliveryFailed`], never silently dropped.
//!
//! The receiving side pairs this with a [`DedupeWindow`]: duplicates of one
//! message id inside its TTL produce exactly one logical effect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axon_types::{Envelope, QosLevel};
use chrono::Utc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::transport::{failover::Failover, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery of {message_id} failed: no ack after {attempts} attempts")]
    DeliveryFailed { message_id: String, attempts: u32 },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Ack wait for the first attempt; doubles per retry
    pub ack_timeout: Duration,
    /// Resends after the initial attempt
    pub max_retries: u32,
    /// Ceiling for the doubled ack wait
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.ack_timeout
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }
}

pub struct DeliveryEngine {
    failover: Arc<Failover>,
    policy: RetryPolicy,
    pending_acks: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl DeliveryEngine {
    pub fn new(failover: Arc<Failover>, policy: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            failover,
            policy,
            pending_acks: Mutex::new(HashMap::new()),
        })
    }

    /// Send an envelope honoring its qos level.
    pub async fn send(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        match envelope.qos {
            QosLevel::AtMostOnce => {
                self.failover.send(&envelope).await?;
                Ok(())
            }
            QosLevel::AtLeastOnce => self.send_acknowledged(envelope).await,
        }
    }

    async fn send_acknowledged(&self, mut envelope: Envelope) -> Result<(), DeliveryError> {
        let message_id = envelope.message_id.clone();
        let (tx, mut rx) = oneshot::channel();
        self.pending_acks
            .lock()
            .await
            .insert(message_id.clone(), tx);

        let attempts = self.policy.max_retries + 1;
        for attempt in 0..attempts {
            envelope.retry_count = attempt;
            envelope.sent_at = Utc::now();

            if let Err(e) = self.failover.send(&envelope).await {
                // The backoff window still runs: a probe may revive a
                // transport before the retry budget is gone.
                warn!(
                    message_id = %message_id,
                    attempt,
                    error = %e,
                    "send attempt failed"
                );
            }

            match tokio::time::timeout(self.policy.backoff(attempt), &mut rx).await {
                Ok(Ok(())) => {
                    debug!(message_id = %message_id, attempt, "ack received");
                    return Ok(());
                }
                Ok(Err(_)) => break,
                Err(_) => {
                    debug!(message_id = %message_id, attempt, "ack timeout, retrying");
                }
            }
        }

        self.pending_acks.lock().await.remove(&message_id);
        Err(DeliveryError::DeliveryFailed {
            message_id,
            attempts,
        })
    }

    /// Resolve a pending ack waiter. Returns false for unknown correlations
    /// (late or duplicate acks).
    pub async fn ack_received(&self, correlation_id: &str) -> bool {
        match self.pending_acks.lock().await.remove(correlation_id) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// Receiver-side duplicate suppression, bounded by each envelope's TTL.
pub struct DedupeWindow {
    seen: Mutex<HashMap<String, tokio::time::Instant>>,
    purger: Mutex<Option<JoinHandle<()>>>,
}

impl DedupeWindow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(HashMap::new()),
            purger: Mutex::new(None),
        })
    }

    /// Record a message id. Returns true on first sight within the window.
    pub async fn observe(&self, message_id: &str, ttl: Duration) -> bool {
        let now = tokio::time::Instant::now();
        let mut seen = self.seen.lock().await;
        match seen.get(message_id) {
            Some(expires) if *expires > now => false,
            _ => {
                seen.insert(message_id.to_string(), now + ttl.max(Duration::from_secs(1)));
                true
            }
        }
    }

    pub async fn purge_expired(&self) {
        let now = tokio::time::Instant::now();
        self.seen.lock().await.retain(|_, expires| *expires > now);
    }

    pub async fn spawn_purge_loop(self: &Arc<Self>, interval: Duration) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.purge_expired().await;
            }
        });
        *self.purger.lock().await = Some(handle);
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.purger.lock().await.take() {
            handle.abort();
        }
    }
}
