//! Shared fixtures for the integration tests: a scriptable mock transport,
//! a deterministic reasoner, and an in-process echo worker speaking the
//! real wire protocol.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axon_core::config::CoreConfig;
use axon_core::context::CoreContext;
use axon_core::reasoner::{Reasoner, ReasonerError};
use axon_core::transport::{StatsSnapshot, Transport, TransportError, TransportStats};
use axon_types::{
    topic, CapabilityAdvertisement, Envelope, QosLevel, SubtaskSpec, TaskRequest, TaskResult,
};

/// Opt-in test logging: `RUST_LOG=axon_core=debug cargo test -- --nocapture`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ─── Mock transport ──────────────────────────────────────────────────────────

pub struct MockTransport {
    name: &'static str,
    fail_sends: AtomicBool,
    probe_ok: AtomicBool,
    shutdown_called: AtomicBool,
    sent: Mutex<Vec<Envelope>>,
    stats: TransportStats,
}

impl MockTransport {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            fail_sends: AtomicBool::new(false),
            probe_ok: AtomicBool::new(true),
            shutdown_called: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            stats: TransportStats::default(),
        })
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_probe_ok(&self, ok: bool) {
        self.probe_ok.store(ok, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn was_shut_down(&self) -> bool {
        self.shutdown_called.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            self.stats.record_error();
            return Err(TransportError::Io {
                transport: self.name,
                message: "mock send failure".to_string(),
            });
        }
        self.sent.lock().unwrap().push(envelope.clone());
        self.stats.record_sent();
        Ok(())
    }

    async fn probe(&self) -> bool {
        self.probe_ok.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.shutdown_called.store(true, Ordering::SeqCst);
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

// ─── Test configuration ──────────────────────────────────────────────────────

/// Timings tuned for tests: fast mailbox polling, short ack/discovery
/// windows, and a broker address that refuses connections immediately.
pub fn test_config(node_id: &str, root: &Path) -> CoreConfig {
    let mut cfg = CoreConfig::with_node_id(node_id);
    cfg.broker_addr = "127.0.0.1:9".to_string();
    cfg.direct_bind_addr = "127.0.0.1:0".to_string();
    cfg.mailbox_dir = root.join("mailbox");
    cfg.agents_dir = root.join("agents");
    cfg.probe_interval = Duration::from_secs(30);
    cfg.mailbox_poll_interval = Duration::from_millis(25);
    cfg.ack_timeout = Duration::from_millis(150);
    cfg.max_retries = 2;
    cfg.retry_backoff_cap = Duration::from_secs(1);
    cfg.eviction_interval = Duration::from_secs(30);
    cfg.eviction_grace = Duration::from_secs(5);
    cfg.launch_grace = Duration::from_secs(3);
    cfg.ready_poll_interval = Duration::from_millis(50);
    cfg.discovery_timeout = Duration::from_millis(400);
    cfg.node_timeout = Duration::from_secs(5);
    cfg.run_timeout = Duration::from_secs(20);
    cfg.shutdown_grace = Duration::from_secs(2);
    cfg
}

// ─── Deterministic reasoner ──────────────────────────────────────────────────

pub struct StaticReasoner {
    subtasks: Vec<SubtaskSpec>,
    integrated_result_count: Mutex<Option<usize>>,
}

impl StaticReasoner {
    pub fn new(subtasks: Vec<SubtaskSpec>) -> Arc<Self> {
        Arc::new(Self {
            subtasks,
            integrated_result_count: Mutex::new(None),
        })
    }

    /// How many results integration received, if it ran.
    pub fn integrated_result_count(&self) -> Option<usize> {
        *self.integrated_result_count.lock().unwrap()
    }
}

#[async_trait]
impl Reasoner for StaticReasoner {
    async fn decompose(
        &self,
        _request: &str,
        _available: &[CapabilityAdvertisement],
    ) -> Result<Vec<SubtaskSpec>, ReasonerError> {
        Ok(self.subtasks.clone())
    }

    async fn integrate(
        &self,
        request: &str,
        results: &BTreeMap<usize, serde_json::Value>,
    ) -> Result<String, ReasonerError> {
        *self.integrated_result_count.lock().unwrap() = Some(results.len());
        Ok(format!("{request}: integrated {} results", results.len()))
    }
}

pub fn subtask(capability: &str, params: serde_json::Value) -> SubtaskSpec {
    SubtaskSpec {
        capability_needed: capability.to_string(),
        task_parameters: params.as_object().cloned().unwrap_or_default(),
        task_description: format!("run {capability}"),
    }
}

// ─── In-process echo worker ──────────────────────────────────────────────────

/// Requests the worker has served, in arrival order.
pub type RequestLog = Arc<Mutex<Vec<TaskRequest>>>;

/// Serve this context's inbound requests: echo capabilities reply with
/// their own parameters after `delay`; capabilities containing "sinkhole"
/// are received (and acked by the router) but never answered.
pub async fn spawn_echo_worker(ctx: Arc<CoreContext>, delay: Duration) -> RequestLog {
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let mut requests = ctx
        .router
        .take_requests()
        .await
        .expect("request receiver already taken");

    let worker_log = log.clone();
    tokio::spawn(async move {
        while let Some(envelope) = requests.recv().await {
            if envelope.topic != topic::TASK_REQUEST {
                continue;
            }
            let request: TaskRequest = match serde_json::from_value(envelope.payload.clone()) {
                Ok(request) => request,
                Err(_) => continue,
            };
            worker_log.lock().unwrap().push(request.clone());

            if request.capability_id.contains("sinkhole") {
                continue;
            }

            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let result = TaskResult::success(serde_json::Value::Object(
                    request.parameters.clone(),
                ));
                let payload = serde_json::to_value(&result).expect("result payload");
                let reply = Envelope::result_for(&envelope, ctx.node_id(), payload)
                    .with_qos(QosLevel::AtLeastOnce);
                let _ = ctx.delivery.send(reply).await;
            });
        }
    });

    log
}

/// Advertise a capability from this context and also seed it into the
/// coordinator-local registry the way an inbound advertisement would.
pub fn advertisement(agent_id: &str, name: &str) -> CapabilityAdvertisement {
    CapabilityAdvertisement::new(agent_id, name, "1.0", 300)
}
