//! The task graph engine.
//!
//! A request enters here, gets decomposed by the external reasoner, runs as
//! a dependency-ordered graph of subtasks dispatched across agents, and
//! leaves as an integrated answer (or a per-node failure report).

pub mod actor;
pub mod dispatch;
pub mod graph;
pub mod protocol;

pub use actor::{OrchestratorActor, OrchestratorArguments};
pub use dispatch::{agent_name_for, DispatchServices, RunTiming};
pub use graph::{GraphError, NodeState, TaskGraph};
pub use protocol::{NodeFailure, OrchestratorMsg, RunOutcome, RunPhase, RunPolicy};

use ractor::ActorRef;

/// Start a run and wait for its terminal outcome.
pub async fn run_request(
    orchestrator: &ActorRef<OrchestratorMsg>,
    request: impl Into<String>,
    policy: RunPolicy,
) -> Result<RunOutcome, ractor::RactorErr<OrchestratorMsg>> {
    let request = request.into();
    let run_id = ractor::call!(orchestrator, |reply| OrchestratorMsg::StartRun {
        request,
        policy,
        reply,
    })?;
    let outcome = ractor::call!(orchestrator, |reply| OrchestratorMsg::WaitRun {
        run_id,
        reply,
    })?;
    // The run was registered by StartRun, so WaitRun always finds it.
    Ok(outcome.expect("run registered by StartRun"))
}
