//! Per-node dispatch: provider resolution, launch-on-miss, correlated send.
//!
//! Each frontier node runs one of these tasks. The task never touches run
//! state directly — everything flows back to the orchestrator actor as a
//! message, so the actor's handler loop stays the only mutator.

use std::sync::Arc;
use std::time::Duration;

use axon_types::{topic, CapabilityAdvertisement, Envelope, MessageType, TaskRequest, TaskResult, TaskStatus};
use ractor::ActorRef;
use tracing::{debug, info, warn};

use super::protocol::{NodeFailure, OrchestratorMsg};
use crate::delivery::DeliveryEngine;
use crate::lifecycle::{AgentManager, LifecycleError};
use crate::registry::CapabilityRegistry;
use crate::router::MessageRouter;

/// Timeouts governing one node's dispatch.
#[derive(Debug, Clone, Copy)]
pub struct RunTiming {
    /// Wait for an existing provider before attempting a launch
    pub discovery_timeout: Duration,
    /// Wait for a freshly launched agent to advertise
    pub launch_grace: Duration,
    /// Wait for the correlated result
    pub node_timeout: Duration,
    /// Request-level deadline for the whole run
    pub run_timeout: Duration,
}

#[derive(Clone)]
pub struct DispatchServices {
    pub node_id: String,
    pub registry: Arc<CapabilityRegistry>,
    pub agents: Option<Arc<AgentManager>>,
    pub delivery: Arc<DeliveryEngine>,
    pub router: Arc<MessageRouter>,
    pub timing: RunTiming,
}

/// Program name an agent providing `capability` is expected to live under:
/// the capability name minus a trailing `_v<N>` version suffix, plus
/// `_agent`.
pub fn agent_name_for(capability: &str) -> String {
    let base = match capability.rfind("_v") {
        Some(pos) if capability[pos + 2..].chars().all(|c| c.is_ascii_digit())
            && pos + 2 < capability.len() =>
        {
            &capability[..pos]
        }
        _ => capability,
    };
    format!("{base}_agent")
}

/// Drive one node to completion and report back to the actor.
pub async fn dispatch_node(
    orchestrator: ActorRef<OrchestratorMsg>,
    services: DispatchServices,
    run_id: String,
    index: usize,
    capability: String,
    parameters: serde_json::Map<String, serde_json::Value>,
    description: String,
) {
    let message = match drive(&orchestrator, &services, &run_id, index, &capability, parameters, description).await
    {
        Ok(result) => OrchestratorMsg::NodeCompleted {
            run_id,
            index,
            result,
        },
        Err(failure) => OrchestratorMsg::NodeFailed {
            run_id,
            index,
            failure,
        },
    };
    let _ = orchestrator.cast(message);
}

async fn drive(
    orchestrator: &ActorRef<OrchestratorMsg>,
    services: &DispatchServices,
    run_id: &str,
    index: usize,
    capability: &str,
    parameters: serde_json::Map<String, serde_json::Value>,
    description: String,
) -> Result<serde_json::Value, NodeFailure> {
    let provider = resolve_provider(services, capability).await?;
    debug!(
        run_id,
        index,
        capability,
        provider = %provider.agent_id,
        "provider resolved"
    );

    let task = TaskRequest {
        request_id: ulid::Ulid::new().to_string(),
        requester_id: services.node_id.clone(),
        capability_id: provider.capability_id.clone(),
        parameters,
        description,
        callback_topic: topic::TASK_RESULT.to_string(),
    };
    let payload = serde_json::to_value(&task)
        .map_err(|e| NodeFailure::Remote(format!("request payload serialization: {e}")))?;
    let envelope = Envelope::request(&services.node_id, &provider.agent_id, payload);
    let correlation_id = envelope.correlation_id.clone();

    let result_rx = services.router.expect_result(&correlation_id).await;
    let _ = orchestrator.cast(OrchestratorMsg::NodeDispatched {
        run_id: run_id.to_string(),
        index,
        correlation_id: correlation_id.clone(),
        provider: provider.agent_id.clone(),
    });

    if let Err(e) = services.delivery.send(envelope).await {
        warn!(run_id, index, error = %e, "subtask delivery failed");
        services.router.cancel_expectation(&correlation_id).await;
        return Err(NodeFailure::DeliveryFailed);
    }
    if let Some(agents) = &services.agents {
        agents.note_dispatch(&provider.agent_id).await;
    }

    let envelope = match tokio::time::timeout(services.timing.node_timeout, result_rx).await {
        Ok(Ok(envelope)) => envelope,
        Ok(Err(_)) => {
            // Expectation was cancelled out from under us (run deadline).
            return Err(NodeFailure::Timeout);
        }
        Err(_) => {
            services.router.cancel_expectation(&correlation_id).await;
            return Err(NodeFailure::Timeout);
        }
    };

    if envelope.message_type == MessageType::Error {
        let detail = serde_json::from_value::<TaskResult>(envelope.payload)
            .ok()
            .and_then(|result| result.error)
            .map(|error| error.message)
            .unwrap_or_else(|| "unspecified agent error".to_string());
        return Err(NodeFailure::Remote(detail));
    }

    match serde_json::from_value::<TaskResult>(envelope.payload) {
        Ok(result) if result.status == TaskStatus::Success => Ok(result.payload),
        Ok(result) => Err(NodeFailure::Remote(
            result
                .error
                .map(|error| error.message)
                .unwrap_or_else(|| "agent reported failure".to_string()),
        )),
        Err(e) => Err(NodeFailure::Remote(format!("malformed result payload: {e}"))),
    }
}

/// Find an online provider, launching the conventionally named agent when
/// none answers within the discovery window.
async fn resolve_provider(
    services: &DispatchServices,
    capability: &str,
) -> Result<CapabilityAdvertisement, NodeFailure> {
    if let Ok(mut found) = services
        .registry
        .find(capability, 1, services.timing.discovery_timeout)
        .await
    {
        return Ok(found.remove(0));
    }

    let Some(agents) = &services.agents else {
        return Err(NodeFailure::CapabilityNotFound);
    };

    let agent_name = agent_name_for(capability);
    info!(capability, agent = %agent_name, "no provider, attempting launch");
    match agents.launch(&agent_name).await {
        Ok(_) | Err(LifecycleError::AlreadyRunning(_)) => {}
        Err(LifecycleError::UnknownAgent(_)) => return Err(NodeFailure::CapabilityNotFound),
        Err(e) => {
            warn!(agent = %agent_name, error = %e, "agent launch failed");
            return Err(NodeFailure::AgentLaunchFailed);
        }
    }
    if let Err(e) = agents
        .wait_ready(&agent_name, services.timing.launch_grace)
        .await
    {
        warn!(agent = %agent_name, error = %e, "agent never became ready");
        return Err(NodeFailure::AgentLaunchFailed);
    }

    services
        .registry
        .find(capability, 1, services.timing.discovery_timeout)
        .await
        .map(|mut found| found.remove(0))
        .map_err(|_| NodeFailure::CapabilityNotFound)
}
