//! Orchestrator message and outcome types.

use std::collections::BTreeMap;

use ractor::RpcReplyPort;
use serde::Serialize;

use axon_types::SubtaskSpec;

/// What a node failure means for the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPolicy {
    /// First node failure fails the run and cancels in-flight nodes.
    #[default]
    FailFast,
    /// Keep executing every node whose dependencies still complete;
    /// report the full failed set at the end.
    ContinueOnFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Decomposing,
    GraphBuilt,
    Executing,
    Integrating,
    Done,
    Failed,
}

/// Why one node failed. Surfaced per index in [`RunOutcome::failed_nodes`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeFailure {
    #[error("ack retries exhausted")]
    DeliveryFailed,
    #[error("no provider found, even after an attempted launch")]
    CapabilityNotFound,
    #[error("agent process failed to start or never became ready")]
    AgentLaunchFailed,
    #[error("no result within the node timeout")]
    Timeout,
    #[error("agent reported an error: {0}")]
    Remote(String),
}

/// Terminal report for one run. A failed request returns the failed node
/// indices and their error kinds, never a bare stack trace.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub phase: RunPhase,
    /// The integrated answer, present only when the run reached `Done`.
    pub answer: Option<String>,
    /// Decomposition-, graph- or integration-level failure description.
    pub error: Option<String>,
    pub node_results: BTreeMap<usize, serde_json::Value>,
    pub failed_nodes: BTreeMap<usize, NodeFailure>,
}

/// Messages handled by the orchestrator actor.
///
/// `StartRun` replies with the run id as soon as the run is registered;
/// `WaitRun` parks until the run reaches a terminal phase (or answers
/// immediately for an already-finished or unknown run).
pub enum OrchestratorMsg {
    StartRun {
        request: String,
        policy: RunPolicy,
        reply: RpcReplyPort<String>,
    },
    WaitRun {
        run_id: String,
        reply: RpcReplyPort<Option<RunOutcome>>,
    },
    GetPhase {
        run_id: String,
        reply: RpcReplyPort<Option<RunPhase>>,
    },

    // Internal: cast back by spawned work.
    DecomposeDone {
        run_id: String,
        result: Result<Vec<SubtaskSpec>, String>,
    },
    NodeDispatched {
        run_id: String,
        index: usize,
        correlation_id: String,
        provider: String,
    },
    NodeCompleted {
        run_id: String,
        index: usize,
        result: serde_json::Value,
    },
    NodeFailed {
        run_id: String,
        index: usize,
        failure: NodeFailure,
    },
    IntegrateDone {
        run_id: String,
        result: Result<String, String>,
    },
    RunDeadline {
        run_id: String,
    },
}
