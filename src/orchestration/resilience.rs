// Fallback-chain retry for model invocations.
// Only availability failures move on to the next model; anything else is the
// caller's problem and is returned as-is.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collaborators::{ModelClient, ModelRequest, ModelResponse, ModelSelector, ToolDefinition};
use crate::errors::ModelError;
use crate::workflow::WorkflowPhase;

/// A successful invocation and which model served it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInvocation {
    pub model: String,
    pub response: ModelResponse,
    pub attempts: u32,
}

pub struct ModelResilienceLayer {
    client: Arc<dyn ModelClient>,
    selector: Arc<dyn ModelSelector>,
}

impl std::fmt::Debug for ModelResilienceLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelResilienceLayer").finish_non_exhaustive()
    }
}

impl ModelResilienceLayer {
    pub fn new(client: Arc<dyn ModelClient>, selector: Arc<dyn ModelSelector>) -> Self {
        Self { client, selector }
    }

    /// Primary model first, then the fallback chain in order, skipping repeats
    pub fn candidate_models(&self, phase: WorkflowPhase) -> Vec<String> {
        let mut candidates = vec![self.selector.model_for_phase(phase)];
        for model in self.selector.fallback_chain(phase) {
            if !candidates.contains(&model) {
                candidates.push(model);
            }
        }
        candidates
    }

    pub async fn invoke(
        &self,
        phase: WorkflowPhase,
        prompt: &str,
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<ModelInvocation, ModelError> {
        let candidates = self.candidate_models(phase);
        let operation_id = uuid::Uuid::new_v4();
        debug!(
            %operation_id,
            phase = %phase,
            candidates = ?candidates,
            "Starting model invocation"
        );

        let mut last_error = ModelError::Invocation(format!("no model configured for {phase}"));
        let mut attempts = 0u32;

        for model in candidates {
            if cancel.is_cancelled() {
                return Err(ModelError::Cancelled);
            }

            attempts += 1;
            let request = ModelRequest {
                prompt: prompt.to_string(),
                model: model.clone(),
                tools: tools.to_vec(),
            };

            match self.client.invoke(&request, cancel).await {
                Ok(response) => {
                    info!(
                        %operation_id,
                        model = %model,
                        attempts,
                        input_tokens = response.token_usage.input,
                        output_tokens = response.token_usage.output,
                        total_tokens = response.token_usage.total,
                        premium = response.token_usage.is_premium,
                        tool_calls = response.tool_calls_made,
                        "Model invocation succeeded"
                    );
                    return Ok(ModelInvocation {
                        model,
                        response,
                        attempts,
                    });
                }
                Err(e) if e.is_unavailable() => {
                    warn!(
                        %operation_id,
                        model = %model,
                        error = %e,
                        "Model unavailable, trying next in fallback chain"
                    );
                    last_error = e;
                }
                Err(e) => {
                    error!(
                        %operation_id,
                        model = %model,
                        error = %e,
                        "Model invocation failed (not retryable)"
                    );
                    return Err(e);
                }
            }
        }

        error!(%operation_id, attempts, "Fallback chain exhausted");
        Err(last_error)
    }
}
