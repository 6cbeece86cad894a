//! External reasoner seam.
//!
//! Natural-language understanding and generation live outside this core.
//! The orchestrator consumes them as a black box: decomposition turns a
//! request into a subtask list, integration turns subtask results into the
//! final answer.

use std::collections::BTreeMap;

use async_trait::async_trait;
use axon_types::{CapabilityAdvertisement, SubtaskSpec};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ReasonerError(pub String);

#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Break a request into an ordered subtask list, given the capabilities
    /// currently discoverable. String parameters may reference earlier
    /// subtasks via `<output_of_task_N>` placeholders.
    async fn decompose(
        &self,
        request: &str,
        available: &[CapabilityAdvertisement],
    ) -> Result<Vec<SubtaskSpec>, ReasonerError>;

    /// Fold completed subtask results into the final answer.
    async fn integrate(
        &self,
        request: &str,
        results: &BTreeMap<usize, serde_json::Value>,
    ) -> Result<String, ReasonerError>;
}
