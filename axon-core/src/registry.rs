//! Scoped, TTL-based service discovery.
//!
//! Advertisements are upserted by `(agent_id, capability_id)`; re-publishing
//! the same pair resets the TTL and doubles as a heartbeat. `find` suspends
//! only its caller — other registry operations proceed — until enough
//! online providers exist or the timeout lapses.
//!
//! The registry never inspects process state directly: it learns of agents
//! through their advertisements, plus one narrow hook ([`AgentStatusSource`])
//! the evictor uses to spare an agent that is confirmed starting or ready
//! but merely slow to re-advertise.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use axon_types::CapabilityAdvertisement;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no provider for capability '{name}' within {timeout:?}")]
    CapabilityNotFound { name: String, timeout: Duration },
}

/// Lifecycle confirmation hook consulted by the evictor's grace check.
#[async_trait]
pub trait AgentStatusSource: Send + Sync {
    async fn is_starting_or_ready(&self, agent_id: &str) -> bool;
}

struct Entry {
    ad: CapabilityAdvertisement,
    expires_at: tokio::time::Instant,
}

pub struct CapabilityRegistry {
    entries: RwLock<HashMap<(String, String), Entry>>,
    changed: Notify,
    eviction_grace: Duration,
    // Weak: the lifecycle manager holds this registry, so a strong
    // reference here would form a cycle.
    status_source: RwLock<Option<Weak<dyn AgentStatusSource>>>,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl CapabilityRegistry {
    pub fn new(eviction_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            changed: Notify::new(),
            eviction_grace,
            status_source: RwLock::new(None),
            evictor: Mutex::new(None),
        })
    }

    /// Wire in the lifecycle manager once it exists; the registry works
    /// without one (the grace check just never spares anyone).
    pub async fn set_status_source(&self, source: Arc<dyn AgentStatusSource>) {
        *self.status_source.write().await = Some(Arc::downgrade(&source));
    }

    /// Upsert by `(agent_id, capability_id)`, resetting the TTL. An
    /// `offline` advertisement removes the entry instead.
    pub async fn register(&self, ad: CapabilityAdvertisement) {
        let key = (ad.agent_id.clone(), ad.capability_id.clone());
        let mut entries = self.entries.write().await;
        if ad.availability_status == axon_types::AvailabilityStatus::Offline {
            if entries.remove(&key).is_some() {
                info!(agent = %key.0, capability = %key.1, "capability withdrawn");
            }
        } else {
            let expires_at =
                tokio::time::Instant::now() + Duration::from_secs(ad.ttl_seconds.max(1));
            debug!(agent = %ad.agent_id, capability = %ad.name, "capability registered");
            entries.insert(key, Entry { ad, expires_at });
        }
        drop(entries);
        self.changed.notify_waiters();
    }

    /// Snapshot of every live, online advertisement matching `name`.
    async fn providers(&self, name: &str) -> Vec<CapabilityAdvertisement> {
        let now = tokio::time::Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.expires_at > now)
            .filter(|entry| entry.ad.name == name && entry.ad.is_online())
            .map(|entry| entry.ad.clone())
            .collect()
    }

    /// Suspend until at least `min_count` online providers for `name`
    /// exist, or fail with `CapabilityNotFound` at the deadline.
    pub async fn find(
        &self,
        name: &str,
        min_count: usize,
        timeout: Duration,
    ) -> Result<Vec<CapabilityAdvertisement>, RegistryError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);

            let mut found = self.providers(name).await;
            if found.len() >= min_count.max(1) {
                found.sort_by(|a, b| a.capability_id.cmp(&b.capability_id));
                return Ok(found);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(RegistryError::CapabilityNotFound {
                    name: name.to_string(),
                    timeout,
                });
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// All live advertisements, for the reasoner's decomposition prompt.
    pub async fn all(&self) -> Vec<CapabilityAdvertisement> {
        let now = tokio::time::Instant::now();
        let mut ads: Vec<_> = self
            .entries
            .read()
            .await
            .values()
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.ad.clone())
            .collect();
        ads.sort_by(|a, b| a.capability_id.cmp(&b.capability_id));
        ads
    }

    /// True while any live advertisement from this agent exists. Used by
    /// the lifecycle manager's readiness poll.
    pub async fn has_agent(&self, agent_id: &str) -> bool {
        let now = tokio::time::Instant::now();
        self.entries
            .read()
            .await
            .values()
            .any(|entry| entry.ad.agent_id == agent_id && entry.expires_at > now)
    }

    /// One eviction sweep. Lapsed advertisements are removed unless the
    /// owning agent is confirmed starting/ready and the lapse is still
    /// inside the grace window.
    pub async fn evict_expired(&self) {
        let now = tokio::time::Instant::now();
        let source = self
            .status_source
            .read()
            .await
            .as_ref()
            .and_then(Weak::upgrade);

        let candidates: Vec<((String, String), tokio::time::Instant)> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, entry)| (key.clone(), entry.expires_at))
            .collect();

        for (key, expired_at) in candidates {
            let within_grace = now.duration_since(expired_at) <= self.eviction_grace;
            if within_grace {
                if let Some(source) = &source {
                    if source.is_starting_or_ready(&key.0).await {
                        continue;
                    }
                }
            }
            let mut entries = self.entries.write().await;
            // Re-check under the write lock: a fresh heartbeat wins.
            if entries
                .get(&key)
                .map(|entry| entry.expires_at <= now)
                .unwrap_or(false)
            {
                entries.remove(&key);
                info!(agent = %key.0, capability = %key.1, "expired capability evicted");
            }
        }
    }

    pub async fn spawn_evictor(self: &Arc<Self>, interval: Duration) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.evict_expired().await;
            }
        });
        *self.evictor.lock().await = Some(handle);
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.evictor.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_types::AvailabilityStatus;

    fn ad(agent: &str, name: &str, ttl: u64) -> CapabilityAdvertisement {
        CapabilityAdvertisement::new(agent, name, "1.0", ttl)
    }

    #[tokio::test]
    async fn test_register_and_find() {
        let registry = CapabilityRegistry::new(Duration::from_secs(10));
        registry.register(ad("w1", "data_analysis_v1", 60)).await;

        let found = registry
            .find("data_analysis_v1", 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].agent_id, "w1");
    }

    #[tokio::test]
    async fn test_find_times_out_without_provider() {
        let registry = CapabilityRegistry::new(Duration::from_secs(10));
        let err = registry
            .find("missing_v1", 1, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::CapabilityNotFound { .. }));
    }

    #[tokio::test]
    async fn test_find_unblocks_on_late_registration() {
        let registry = CapabilityRegistry::new(Duration::from_secs(10));
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .find("late_v1", 1, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.register(ad("w1", "late_v1", 60)).await;

        let found = waiter.await.unwrap().unwrap();
        assert_eq!(found[0].agent_id, "w1");
    }

    #[tokio::test]
    async fn test_min_count_respected() {
        let registry = CapabilityRegistry::new(Duration::from_secs(10));
        registry.register(ad("w1", "cap_v1", 60)).await;
        let err = registry
            .find("cap_v1", 2, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::CapabilityNotFound { .. }));

        registry.register(ad("w2", "cap_v1", 60)).await;
        let found = registry
            .find("cap_v1", 2, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn test_draining_provider_not_returned() {
        let registry = CapabilityRegistry::new(Duration::from_secs(10));
        let mut draining = ad("w1", "cap_v1", 60);
        draining.availability_status = AvailabilityStatus::Draining;
        registry.register(draining).await;

        assert!(registry
            .find("cap_v1", 1, Duration::from_millis(50))
            .await
            .is_err());
        // Still visible to the decomposition snapshot and readiness poll.
        assert_eq!(registry.all().await.len(), 1);
        assert!(registry.has_agent("w1").await);
    }

    #[tokio::test]
    async fn test_offline_advertisement_withdraws() {
        let registry = CapabilityRegistry::new(Duration::from_secs(10));
        registry.register(ad("w1", "cap_v1", 60)).await;
        assert!(registry.has_agent("w1").await);

        let mut offline = ad("w1", "cap_v1", 60);
        offline.availability_status = AvailabilityStatus::Offline;
        registry.register(offline).await;
        assert!(!registry.has_agent("w1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_after_ttl_and_grace() {
        let registry = CapabilityRegistry::new(Duration::from_secs(5));
        registry.register(ad("w1", "cap_v1", 10)).await;

        tokio::time::advance(Duration::from_secs(11)).await;
        registry.evict_expired().await;
        // No status source: expired entries go even inside the grace window.
        assert!(registry.all().await.is_empty());
    }

    struct AlwaysStarting;

    #[async_trait]
    impl AgentStatusSource for AlwaysStarting {
        async fn is_starting_or_ready(&self, _agent_id: &str) -> bool {
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_spares_confirmed_agent() {
        let registry = CapabilityRegistry::new(Duration::from_secs(20));
        let source: Arc<dyn AgentStatusSource> = Arc::new(AlwaysStarting);
        registry.set_status_source(source.clone()).await;
        registry.register(ad("w1", "cap_v1", 10)).await;

        tokio::time::advance(Duration::from_secs(15)).await;
        registry.evict_expired().await;
        assert_eq!(registry.all().await.len(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        registry.evict_expired().await;
        assert!(registry.all().await.is_empty());
    }
}
