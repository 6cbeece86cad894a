//! Fallback coordination across the transport set.
//!
//! Transports are statically priority-ordered; `send` walks the list from
//! the top, skipping transports currently marked unhealthy. A send failure
//! marks that transport unhealthy and the walk continues. A transport is
//! re-marked healthy only after a successful liveness probe — never merely
//! because a timeout elapsed — which keeps flapping transports parked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axon_types::Envelope;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{StatsSnapshot, Transport, TransportError};

struct TransportSlot {
    transport: RwLock<Arc<dyn Transport>>,
    healthy: AtomicBool,
}

/// Health state of one slot, as reported by [`Failover::transports`].
#[derive(Debug, Clone)]
pub struct TransportHealth {
    pub name: &'static str,
    pub healthy: bool,
    pub stats: StatsSnapshot,
}

pub struct Failover {
    slots: Vec<TransportSlot>,
    prober: Mutex<Option<JoinHandle<()>>>,
}

impl Failover {
    /// Build from transports in descending priority order. Slots start
    /// healthy; the first failed send or probe corrects that.
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Arc<Self> {
        Arc::new(Self {
            slots: transports
                .into_iter()
                .map(|transport| TransportSlot {
                    transport: RwLock::new(transport),
                    healthy: AtomicBool::new(true),
                })
                .collect(),
            prober: Mutex::new(None),
        })
    }

    /// Deliver through the highest-priority healthy transport, failing over
    /// down the list. Returns the name of the transport that carried the
    /// envelope.
    pub async fn send(&self, envelope: &Envelope) -> Result<&'static str, TransportError> {
        for slot in &self.slots {
            if !slot.healthy.load(Ordering::Acquire) {
                continue;
            }
            let transport = slot.transport.read().await.clone();
            match transport.send(envelope).await {
                Ok(()) => return Ok(transport.name()),
                Err(e) => {
                    slot.healthy.store(false, Ordering::Release);
                    warn!(
                        transport = transport.name(),
                        message_id = %envelope.message_id,
                        error = %e,
                        "transport send failed, switching to next transport"
                    );
                }
            }
        }
        Err(TransportError::Unavailable)
    }

    /// Probe every slot once, updating health flags.
    pub async fn probe_all(&self) {
        for slot in &self.slots {
            let transport = slot.transport.read().await.clone();
            let alive = transport.probe().await;
            let was = slot.healthy.swap(alive, Ordering::AcqRel);
            if alive && !was {
                info!(transport = transport.name(), "transport recovered, marked healthy");
            } else if !alive && was {
                warn!(transport = transport.name(), "transport probe failed, marked unhealthy");
            }
        }
    }

    /// Run `probe_all` on a fixed interval until shutdown.
    pub async fn spawn_probe_loop(self: &Arc<Self>, interval: Duration) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick gives a fresh health picture at startup.
            loop {
                ticker.tick().await;
                this.probe_all().await;
            }
        });
        *self.prober.lock().await = Some(handle);
    }

    /// Hot-swap a slot's transport. The write lock blocks new sends on that
    /// slot until the swap completes — callers wait, they are not failed.
    /// The old instance is drained via `shutdown`.
    pub async fn swap(
        &self,
        name: &str,
        replacement: Arc<dyn Transport>,
    ) -> Result<(), TransportError> {
        for slot in &self.slots {
            let mut guard = slot.transport.write().await;
            if guard.name() != name {
                continue;
            }
            let old = guard.clone();
            *guard = replacement.clone();
            drop(guard);

            old.shutdown().await;
            let alive = replacement.probe().await;
            slot.healthy.store(alive, Ordering::Release);
            info!(transport = name, healthy = alive, "transport instance swapped");
            return Ok(());
        }
        Err(TransportError::Io {
            transport: "failover",
            message: format!("no transport slot named '{name}'"),
        })
    }

    pub fn is_healthy(&self, name: &str) -> Option<bool> {
        // Slot names are stable for the slot's lifetime, so the cheap
        // blocking read is fine here.
        for slot in &self.slots {
            if let Ok(guard) = slot.transport.try_read() {
                if guard.name() == name {
                    return Some(slot.healthy.load(Ordering::Acquire));
                }
            }
        }
        None
    }

    pub async fn transports(&self) -> Vec<TransportHealth> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let transport = slot.transport.read().await;
            out.push(TransportHealth {
                name: transport.name(),
                healthy: slot.healthy.load(Ordering::Acquire),
                stats: transport.stats(),
            });
        }
        out
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.prober.lock().await.take() {
            handle.abort();
        }
        for slot in &self.slots {
            slot.transport.read().await.shutdown().await;
        }
    }
}
