//! OrchestratorActor - turns one request into a dependency-ordered set of
//! subtasks executed across agents.
//!
//! State machine per run: Decomposing -> GraphBuilt -> Executing ->
//! Integrating -> Done | Failed. The actor's handler loop is the only
//! mutator of run state; decomposition, integration and per-node dispatch
//! run as spawned tasks that report back via messages.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tracing::{debug, info, warn};

use super::dispatch::{dispatch_node, DispatchServices};
use super::graph::{NodeState, TaskGraph};
use super::protocol::{NodeFailure, OrchestratorMsg, RunOutcome, RunPhase, RunPolicy};
use crate::reasoner::Reasoner;
use axon_types::Envelope;

#[derive(Default)]
pub struct OrchestratorActor;

pub struct OrchestratorArguments {
    pub services: DispatchServices,
    pub reasoner: Arc<dyn Reasoner>,
}

pub struct OrchestratorState {
    services: DispatchServices,
    reasoner: Arc<dyn Reasoner>,
    runs: HashMap<String, RunState>,
}

struct RunState {
    run_id: String,
    request: String,
    policy: RunPolicy,
    phase: RunPhase,
    graph: Option<TaskGraph>,
    results: HashMap<usize, serde_json::Value>,
    failures: BTreeMap<usize, NodeFailure>,
    error: Option<String>,
    /// index -> (correlation id, provider agent id) for in-flight nodes
    correlations: HashMap<usize, (String, String)>,
    waiters: Vec<RpcReplyPort<Option<RunOutcome>>>,
    outcome: Option<RunOutcome>,
}

impl RunState {
    fn new(run_id: String, request: String, policy: RunPolicy) -> Self {
        Self {
            run_id,
            request,
            policy,
            phase: RunPhase::Decomposing,
            graph: None,
            results: HashMap::new(),
            failures: BTreeMap::new(),
            error: None,
            correlations: HashMap::new(),
            waiters: Vec::new(),
            outcome: None,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self.phase, RunPhase::Done | RunPhase::Failed)
    }

    fn finalize(&mut self, phase: RunPhase, answer: Option<String>) {
        self.phase = phase;
        let outcome = RunOutcome {
            run_id: self.run_id.clone(),
            phase,
            answer,
            error: self.error.clone(),
            node_results: self.results.iter().map(|(k, v)| (*k, v.clone())).collect(),
            failed_nodes: self.failures.clone(),
        };
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Some(outcome.clone()));
        }
        self.outcome = Some(outcome);
    }
}

#[async_trait]
impl Actor for OrchestratorActor {
    type Msg = OrchestratorMsg;
    type State = OrchestratorState;
    type Arguments = OrchestratorArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!(actor_id = %myself.get_id(), node = %args.services.node_id, "orchestrator starting");
        Ok(OrchestratorState {
            services: args.services,
            reasoner: args.reasoner,
            runs: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            OrchestratorMsg::StartRun {
                request,
                policy,
                reply,
            } => self.handle_start_run(&myself, state, request, policy, reply),
            OrchestratorMsg::WaitRun { run_id, reply } => {
                match state.runs.get_mut(&run_id) {
                    Some(run) if run.is_terminal() => {
                        let _ = reply.send(run.outcome.clone());
                    }
                    Some(run) => run.waiters.push(reply),
                    None => {
                        let _ = reply.send(None);
                    }
                }
            }
            OrchestratorMsg::GetPhase { run_id, reply } => {
                let _ = reply.send(state.runs.get(&run_id).map(|run| run.phase));
            }
            OrchestratorMsg::DecomposeDone { run_id, result } => {
                self.handle_decompose_done(&myself, state, run_id, result);
            }
            OrchestratorMsg::NodeDispatched {
                run_id,
                index,
                correlation_id,
                provider,
            } => {
                if let Some(run) = state.runs.get_mut(&run_id) {
                    if !run.is_terminal() {
                        run.correlations.insert(index, (correlation_id, provider));
                    }
                }
            }
            OrchestratorMsg::NodeCompleted {
                run_id,
                index,
                result,
            } => self.handle_node_completed(&myself, state, run_id, index, result),
            OrchestratorMsg::NodeFailed {
                run_id,
                index,
                failure,
            } => self.handle_node_failed(state, run_id, index, failure).await,
            OrchestratorMsg::IntegrateDone { run_id, result } => {
                if let Some(run) = state.runs.get_mut(&run_id) {
                    if run.is_terminal() {
                        return Ok(());
                    }
                    match result {
                        Ok(answer) => {
                            info!(run_id = %run.run_id, "run complete");
                            run.finalize(RunPhase::Done, Some(answer));
                        }
                        Err(message) => {
                            warn!(run_id = %run.run_id, error = %message, "integration failed");
                            run.error = Some(format!("integration failed: {message}"));
                            run.finalize(RunPhase::Failed, None);
                        }
                    }
                }
            }
            OrchestratorMsg::RunDeadline { run_id } => {
                self.handle_run_deadline(state, run_id).await;
            }
        }
        Ok(())
    }
}

impl OrchestratorActor {
    fn handle_start_run(
        &self,
        myself: &ActorRef<OrchestratorMsg>,
        state: &mut OrchestratorState,
        request: String,
        policy: RunPolicy,
        reply: RpcReplyPort<String>,
    ) {
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(run_id = %run_id, "run accepted, decomposing");
        state
            .runs
            .insert(run_id.clone(), RunState::new(run_id.clone(), request.clone(), policy));
        let _ = reply.send(run_id.clone());

        let reasoner = state.reasoner.clone();
        let registry = state.services.registry.clone();
        let engine = myself.clone();
        let decompose_run = run_id.clone();
        tokio::spawn(async move {
            let available = registry.all().await;
            let result = reasoner
                .decompose(&request, &available)
                .await
                .map_err(|e| e.to_string());
            let _ = engine.cast(OrchestratorMsg::DecomposeDone {
                run_id: decompose_run,
                result,
            });
        });

        let engine = myself.clone();
        let run_timeout = state.services.timing.run_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(run_timeout).await;
            let _ = engine.cast(OrchestratorMsg::RunDeadline { run_id });
        });
    }

    fn handle_decompose_done(
        &self,
        myself: &ActorRef<OrchestratorMsg>,
        state: &mut OrchestratorState,
        run_id: String,
        result: Result<Vec<axon_types::SubtaskSpec>, String>,
    ) {
        let services = state.services.clone();
        let Some(run) = state.runs.get_mut(&run_id) else {
            return;
        };
        if run.is_terminal() {
            return;
        }

        let specs = match result {
            Ok(specs) if specs.is_empty() => {
                run.error = Some("decomposition produced no subtasks".to_string());
                run.finalize(RunPhase::Failed, None);
                return;
            }
            Ok(specs) => specs,
            Err(message) => {
                warn!(run_id = %run.run_id, error = %message, "decomposition failed");
                run.error = Some(format!("decomposition failed: {message}"));
                run.finalize(RunPhase::Failed, None);
                return;
            }
        };

        match TaskGraph::build(&specs) {
            Ok(graph) => {
                run.phase = RunPhase::GraphBuilt;
                debug!(run_id = %run.run_id, nodes = graph.len(), "task graph built");
                run.graph = Some(graph);
                run.phase = RunPhase::Executing;
                dispatch_ready(run, &services, myself);
            }
            Err(e) => {
                // Fails the whole request before any dispatch.
                warn!(run_id = %run.run_id, error = %e, "task graph invalid");
                run.error = Some(e.to_string());
                run.finalize(RunPhase::Failed, None);
            }
        }
    }

    fn handle_node_completed(
        &self,
        myself: &ActorRef<OrchestratorMsg>,
        state: &mut OrchestratorState,
        run_id: String,
        index: usize,
        result: serde_json::Value,
    ) {
        let services = state.services.clone();
        let reasoner = state.reasoner.clone();
        let Some(run) = state.runs.get_mut(&run_id) else {
            return;
        };
        if run.is_terminal() {
            return;
        }
        let Some(graph) = run.graph.as_mut() else {
            return;
        };
        if graph.state(index) != Some(NodeState::Dispatched) {
            return;
        }

        debug!(run_id = %run.run_id, index, "node completed");
        run.results.insert(index, result);
        run.correlations.remove(&index);
        graph.mark_completed(index);

        if graph.all_completed() {
            run.phase = RunPhase::Integrating;
            let request = run.request.clone();
            let results: BTreeMap<usize, serde_json::Value> =
                run.results.iter().map(|(k, v)| (*k, v.clone())).collect();
            let engine = myself.clone();
            let integrate_run = run.run_id.clone();
            info!(run_id = %run.run_id, "all nodes complete, integrating");
            tokio::spawn(async move {
                let result = reasoner
                    .integrate(&request, &results)
                    .await
                    .map_err(|e| e.to_string());
                let _ = engine.cast(OrchestratorMsg::IntegrateDone {
                    run_id: integrate_run,
                    result,
                });
            });
            return;
        }

        if run.policy == RunPolicy::FailFast && !run.failures.is_empty() {
            maybe_finish_failed(run);
            return;
        }
        dispatch_ready(run, &services, myself);
        maybe_finish_failed(run);
    }

    async fn handle_node_failed(
        &self,
        state: &mut OrchestratorState,
        run_id: String,
        index: usize,
        failure: NodeFailure,
    ) {
        let services = state.services.clone();
        let Some(run) = state.runs.get_mut(&run_id) else {
            return;
        };
        if run.is_terminal() {
            return;
        }
        let Some(graph) = run.graph.as_mut() else {
            return;
        };

        warn!(run_id = %run.run_id, index, failure = %failure, "node failed");
        graph.mark_failed(index);
        run.correlations.remove(&index);
        run.failures.insert(index, failure);

        match run.policy {
            RunPolicy::FailFast => {
                cancel_inflight(run, &services).await;
                run.finalize(RunPhase::Failed, None);
            }
            RunPolicy::ContinueOnFailure => {
                maybe_finish_failed(run);
            }
        }
    }

    async fn handle_run_deadline(&self, state: &mut OrchestratorState, run_id: String) {
        let services = state.services.clone();
        let Some(run) = state.runs.get_mut(&run_id) else {
            return;
        };
        if run.is_terminal() {
            return;
        }

        warn!(run_id = %run.run_id, "run deadline exceeded");
        if let Some(graph) = run.graph.as_ref() {
            for index in 0..graph.len() {
                if graph.state(index) == Some(NodeState::Dispatched) {
                    run.failures.entry(index).or_insert(NodeFailure::Timeout);
                }
            }
        }
        cancel_inflight(run, &services).await;
        run.error = Some("request deadline exceeded".to_string());
        run.finalize(RunPhase::Failed, None);
    }
}

/// Dispatch every currently ready node, ascending index order. Spawned
/// tasks report back as messages; node state flips to Dispatched here so a
/// node is never dispatched twice.
fn dispatch_ready(
    run: &mut RunState,
    services: &DispatchServices,
    myself: &ActorRef<OrchestratorMsg>,
) {
    let Some(graph) = run.graph.as_mut() else {
        return;
    };
    for index in graph.frontier() {
        let Some(node) = graph.node(index) else { continue };
        let parameters =
            super::graph::substitute_parameters(&node.spec.task_parameters, &run.results);
        let capability = node.spec.capability_needed.clone();
        let description = node.spec.task_description.clone();
        graph.mark_dispatched(index);

        debug!(run_id = %run.run_id, index, capability = %capability, "dispatching node");
        tokio::spawn(dispatch_node(
            myself.clone(),
            services.clone(),
            run.run_id.clone(),
            index,
            capability,
            parameters,
            description,
        ));
    }
}

/// In ContinueOnFailure mode (or FailFast once draining), the run ends when
/// nothing is in flight and nothing can become ready.
fn maybe_finish_failed(run: &mut RunState) {
    let Some(graph) = run.graph.as_ref() else {
        return;
    };
    if run.failures.is_empty() || graph.has_inflight() || !graph.frontier().is_empty() {
        return;
    }
    run.finalize(RunPhase::Failed, None);
}

/// Cancel pending node waits and notify their providers, best effort.
/// Agent processes are left alone — they may be serving other requests.
async fn cancel_inflight(run: &mut RunState, services: &DispatchServices) {
    for (_, (correlation_id, provider)) in run.correlations.drain() {
        services.router.cancel_expectation(&correlation_id).await;
        let cancel = Envelope::cancellation(&services.node_id, &provider, &correlation_id);
        let delivery = services.delivery.clone();
        tokio::spawn(async move {
            let _ = delivery.send(cancel).await;
        });
    }
}
