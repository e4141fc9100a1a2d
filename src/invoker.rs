//! Single-stage agent invocation with schema enforcement and bounded retry.

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::backend::GenerationBackend;
use crate::error::PipelineError;
use crate::pipeline::{Stage, StageContext, StageResult};
use crate::retry::RetryPolicy;

/// Wraps a [`GenerationBackend`] call for one stage.
///
/// Execution and validation failures are retried with the identical context
/// while the [`RetryPolicy`] allows (one retry by default); the last failure
/// is returned to the caller. The invoker never touches a `Job`.
pub struct AgentInvoker<G> {
    backend: G,
    policy: RetryPolicy,
}

impl<G: GenerationBackend> AgentInvoker<G> {
    pub fn new(backend: G, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn backend(&self) -> &G {
        &self.backend
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn invoke(
        &self,
        stage: Stage,
        context: &StageContext,
    ) -> Result<StageResult, PipelineError> {
        let mut attempt = 0;
        loop {
            match self.attempt(stage, context).await {
                Ok(result) => {
                    debug!(%stage, attempt, confidence = result.confidence, "stage output accepted");
                    return Ok(result);
                }
                Err(e) if self.policy.should_retry(e.class(), attempt) => {
                    let delay = self.policy.backoff_delay(attempt);
                    warn!(%stage, attempt = attempt + 1, error = %e, ?delay, "retrying stage");
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        stage: Stage,
        context: &StageContext,
    ) -> Result<StageResult, PipelineError> {
        let raw = self
            .backend
            .generate(stage, context)
            .await
            .map_err(|e| match e {
                PipelineError::Execution { .. } | PipelineError::Validation { .. } => e,
                other => PipelineError::execution(stage, other.to_string()),
            })?;
        let (output, confidence) = stage
            .parse_output(&raw)
            .map_err(|e| PipelineError::validation(stage, e.0))?;
        Ok(StageResult::new(output, confidence))
    }
}
