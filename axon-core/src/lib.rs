//! axon-core — the inter-agent coordination core.
//!
//! Moves requests and results between a coordinator and a pool of
//! independently running agent processes, and turns a single high-level
//! request into a dependency-ordered set of subtasks executed across them.
//!
//! Layers, leaf-first:
//! - [`transport`]: three interchangeable delivery mechanisms (broker
//!   pub/sub, direct TCP, shared-storage mailbox) behind one trait, plus
//!   the health-tracking fallback coordinator
//! - [`delivery`]: at-least-once sends with ack/retry and receiver-side
//!   deduplication
//! - [`router`]: the single inbound dispatch loop
//! - [`registry`]: TTL-based capability discovery
//! - [`lifecycle`]: agent process launch, readiness, and shutdown
//! - [`orchestrator`]: the task graph engine
//! - [`context`]: explicit one-shot wiring of all of the above
//!
//! There is no CLI or HTTP surface here; the core is embedded
//! programmatically via [`context::CoreContext`].

pub mod config;
pub mod context;
pub mod delivery;
pub mod lifecycle;
pub mod orchestrator;
pub mod reasoner;
pub mod registry;
pub mod router;
pub mod transport;

pub use config::{ConfigError, CoreConfig};
pub use context::{ContextError, CoreContext};
pub use delivery::{DedupeWindow, DeliveryEngine, DeliveryError, RetryPolicy};
pub use lifecycle::{AgentManager, AgentStatus, LaunchOptions, LifecycleError};
pub use orchestrator::{
    run_request, NodeFailure, OrchestratorMsg, RunOutcome, RunPhase, RunPolicy,
};
pub use reasoner::{Reasoner, ReasonerError};
pub use registry::{AgentStatusSource, CapabilityRegistry, RegistryError};
pub use router::MessageRouter;
pub use transport::{failover::Failover, Transport, TransportError};
