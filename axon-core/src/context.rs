//! Explicit wiring of the coordination core.
//!
//! One `CoreContext::start` call constructs every component and hands out
//! shared handles — there are no module-level globals anywhere in this
//! crate. Hot-swapping a transport goes through [`Failover::swap`] on the
//! context's coordinator: construct the new instance, swap the slot, the
//! old one is drained.

use std::sync::Arc;
use std::time::Duration;

use axon_types::{CapabilityAdvertisement, Envelope};
use ractor::{Actor, ActorRef, SpawnErr};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::CoreConfig;
use crate::delivery::{DedupeWindow, DeliveryEngine, DeliveryError, RetryPolicy};
use crate::lifecycle::{AgentManager, LaunchOptions};
use crate::orchestrator::{
    DispatchServices, OrchestratorActor, OrchestratorArguments, OrchestratorMsg, RunTiming,
};
use crate::reasoner::Reasoner;
use crate::registry::CapabilityRegistry;
use crate::router::MessageRouter;
use crate::transport::{
    broker::BrokerTransport, direct::DirectTransport, failover::Failover,
    mailbox::MailboxTransport, Transport, TransportError,
};

const INTAKE_DEPTH: usize = 1024;
const DEDUPE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("agent discovery failed: {0}")]
    Discovery(std::io::Error),
}

pub struct CoreContext {
    pub config: CoreConfig,
    pub broker: Arc<BrokerTransport>,
    pub direct: Arc<DirectTransport>,
    pub mailbox: Arc<MailboxTransport>,
    pub failover: Arc<Failover>,
    pub dedupe: Arc<DedupeWindow>,
    pub delivery: Arc<DeliveryEngine>,
    pub registry: Arc<CapabilityRegistry>,
    pub router: Arc<MessageRouter>,
    pub agents: Option<Arc<AgentManager>>,
}

impl CoreContext {
    pub async fn start(config: CoreConfig) -> Result<Arc<Self>, ContextError> {
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_DEPTH);

        let broker = BrokerTransport::start(
            &config.node_id,
            &config.broker_addr,
            intake_tx.clone(),
        )
        .await;
        let direct = DirectTransport::start(&config.direct_bind_addr, intake_tx.clone()).await?;
        let mailbox = MailboxTransport::start(
            &config.node_id,
            &config.mailbox_dir,
            config.mailbox_poll_interval,
            intake_tx,
        )
        .await?;

        let failover = Failover::new(vec![
            broker.clone() as Arc<dyn Transport>,
            direct.clone() as Arc<dyn Transport>,
            mailbox.clone() as Arc<dyn Transport>,
        ]);
        failover.spawn_probe_loop(config.probe_interval).await;

        let dedupe = DedupeWindow::new();
        dedupe.spawn_purge_loop(DEDUPE_PURGE_INTERVAL).await;

        let delivery = DeliveryEngine::new(
            failover.clone(),
            RetryPolicy {
                ack_timeout: config.ack_timeout,
                max_retries: config.max_retries,
                backoff_cap: config.retry_backoff_cap,
            },
        );

        let registry = CapabilityRegistry::new(config.eviction_grace);
        registry.spawn_evictor(config.eviction_interval).await;

        let router = MessageRouter::new(
            &config.node_id,
            delivery.clone(),
            dedupe.clone(),
            registry.clone(),
            failover.clone(),
        );
        router.spawn(intake_rx).await;

        let agents = if config.agents_dir.is_dir() {
            let catalog = AgentManager::discover(&config.agents_dir)
                .await
                .map_err(ContextError::Discovery)?;
            let manager = AgentManager::new(
                catalog,
                registry.clone(),
                LaunchOptions {
                    launch_grace: config.launch_grace,
                    ready_poll_interval: config.ready_poll_interval,
                    shutdown_grace: config.shutdown_grace,
                    env: vec![
                        (
                            "AXON_MAILBOX_DIR".to_string(),
                            config.mailbox_dir.to_string_lossy().to_string(),
                        ),
                        ("AXON_BROKER_ADDR".to_string(), config.broker_addr.clone()),
                    ],
                },
            );
            registry.set_status_source(manager.clone()).await;
            Some(manager)
        } else {
            debug!(dir = %config.agents_dir.display(), "no agents directory, launches disabled");
            None
        };

        Ok(Arc::new(Self {
            config,
            broker,
            direct,
            mailbox,
            failover,
            dedupe,
            delivery,
            registry,
            router,
            agents,
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Spawn the task graph engine against this context's services.
    pub async fn spawn_orchestrator(
        &self,
        reasoner: Arc<dyn Reasoner>,
    ) -> Result<(ActorRef<OrchestratorMsg>, tokio::task::JoinHandle<()>), SpawnErr> {
        let services = DispatchServices {
            node_id: self.config.node_id.clone(),
            registry: self.registry.clone(),
            agents: self.agents.clone(),
            delivery: self.delivery.clone(),
            router: self.router.clone(),
            timing: RunTiming {
                discovery_timeout: self.config.discovery_timeout,
                launch_grace: self.config.launch_grace,
                node_timeout: self.config.node_timeout,
                run_timeout: self.config.run_timeout,
            },
        };
        Actor::spawn(
            None,
            OrchestratorActor,
            OrchestratorArguments { services, reasoner },
        )
        .await
    }

    /// Broadcast a capability advertisement from this node.
    pub async fn advertise(&self, ad: &CapabilityAdvertisement) -> Result<(), DeliveryError> {
        let envelope =
            Envelope::advertisement(&self.config.node_id, ad).map_err(TransportError::Encode)?;
        self.delivery.send(envelope).await
    }

    /// Stop the messaging loops and drain the transports. Agent processes
    /// are not touched; call `agents.shutdown_all()` for that.
    pub async fn shutdown(&self) {
        self.router.shutdown().await;
        self.registry.shutdown().await;
        self.dedupe.shutdown().await;
        self.failover.shutdown().await;
    }
}
