//! Interchangeable delivery mechanisms.
//!
//! Every transport speaks the same envelope codec, so a message published
//! through one transport can be consumed through another after a failover.
//! Inbound envelopes from all transports funnel into a single intake
//! channel consumed by the [`crate::router::MessageRouter`] loop.

pub mod broker;
pub mod direct;
pub mod failover;
pub mod mailbox;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use axon_types::Envelope;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("all transports unhealthy")]
    Unavailable,
    #[error("{transport}: no known address for peer '{peer}'")]
    UnknownPeer {
        transport: &'static str,
        peer: String,
    },
    #[error("{transport}: not connected")]
    Disconnected { transport: &'static str },
    #[error("{transport}: i/o failure: {message}")]
    Io {
        transport: &'static str,
        message: String,
    },
    #[error("envelope encoding failed: {0}")]
    Encode(#[from] axon_types::EncodeError),
}

/// A delivery mechanism.
///
/// Implementations push everything they receive into the intake sender they
/// were constructed with; malformed inbound bytes are logged and dropped,
/// never surfaced as a crash.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deliver one envelope. Broadcast recipients fan out best-effort.
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Liveness probe. A transport is only re-marked healthy after this
    /// returns true, never merely because time has passed.
    async fn probe(&self) -> bool;

    /// Stop background loops and release resources.
    async fn shutdown(&self);

    fn stats(&self) -> StatsSnapshot;
}

/// Per-transport delivery counters.
#[derive(Debug, Default)]
pub struct TransportStats {
    sent: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
    last_activity_micros: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl TransportStats {
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn touch(&self) {
        self.last_activity_micros
            .store(Utc::now().timestamp_micros(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let micros = self.last_activity_micros.load(Ordering::Relaxed);
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_activity: (micros != 0)
                .then(|| DateTime::<Utc>::from_timestamp_micros(micros))
                .flatten(),
        }
    }
}
