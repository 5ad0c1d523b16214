//! Back-pressure checks evaluated before every model call.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardrailResult {
    Pass,
    Warn(String),
    Block(String),
}

impl GuardrailResult {
    pub fn is_block(&self) -> bool {
        matches!(self, GuardrailResult::Block(_))
    }
}

/// What a guardrail gets to see about the current iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardrailContext {
    pub module: String,
    pub task_id: Option<String>,
    pub iteration: u32,
    pub retry_count: u32,
}

#[async_trait]
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;

    /// Lower values run first
    fn order(&self) -> i32;

    /// Whether a Block from this guardrail skips the rest of the pipeline
    fn short_circuit(&self) -> bool {
        false
    }

    async fn evaluate(&self, context: &GuardrailContext, cancel: &CancellationToken)
        -> GuardrailResult;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardrailOutcome {
    pub guardrail: String,
    pub result: GuardrailResult,
}

/// Ordered collection of guardrails
#[derive(Default, Clone)]
pub struct GuardrailPipeline {
    guardrails: Vec<Arc<dyn Guardrail>>,
}

impl std::fmt::Debug for GuardrailPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.guardrails.iter().map(|g| g.name()).collect();
        f.debug_struct("GuardrailPipeline").field("guardrails", &names).finish()
    }
}

impl GuardrailPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping ascending order; ties keep registration order
    pub fn register(&mut self, guardrail: Arc<dyn Guardrail>) {
        let position = self
            .guardrails
            .iter()
            .position(|g| g.order() > guardrail.order())
            .unwrap_or(self.guardrails.len());
        self.guardrails.insert(position, guardrail);
    }

    pub fn with_guardrail(mut self, guardrail: Arc<dyn Guardrail>) -> Self {
        self.register(guardrail);
        self
    }

    pub fn len(&self) -> usize {
        self.guardrails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guardrails.is_empty()
    }

    pub async fn evaluate(
        &self,
        context: &GuardrailContext,
        cancel: &CancellationToken,
    ) -> Vec<GuardrailOutcome> {
        let mut outcomes = Vec::with_capacity(self.guardrails.len());

        for guardrail in &self.guardrails {
            let result = guardrail.evaluate(context, cancel).await;
            debug!(
                guardrail = guardrail.name(),
                iteration = context.iteration,
                result = ?result,
                "Guardrail evaluated"
            );

            let stop = result.is_block() && guardrail.short_circuit();
            outcomes.push(GuardrailOutcome {
                guardrail: guardrail.name().to_string(),
                result,
            });

            if stop {
                warn!(
                    guardrail = guardrail.name(),
                    skipped = self.guardrails.len() - outcomes.len(),
                    "Short-circuiting guardrail blocked, skipping the rest"
                );
                break;
            }
        }

        outcomes
    }
}

/// Blocks once the loop has run more than `limit` iterations
#[derive(Debug, Clone)]
pub struct MaxIterationsGuardrail {
    limit: u32,
}

impl MaxIterationsGuardrail {
    pub fn new(limit: u32) -> Self {
        Self { limit }
    }
}

#[async_trait]
impl Guardrail for MaxIterationsGuardrail {
    fn name(&self) -> &str {
        "max-iterations"
    }

    fn order(&self) -> i32 {
        0
    }

    fn short_circuit(&self) -> bool {
        true
    }

    async fn evaluate(&self, context: &GuardrailContext, _cancel: &CancellationToken) -> GuardrailResult {
        if context.iteration > self.limit {
            GuardrailResult::Block(format!(
                "Iteration limit of {} reached for module '{}'",
                self.limit, context.module
            ))
        } else {
            GuardrailResult::Pass
        }
    }
}

/// Warns when the current task keeps failing
#[derive(Debug, Clone)]
pub struct RetryPressureGuardrail {
    warn_after: u32,
}

impl RetryPressureGuardrail {
    pub fn new(warn_after: u32) -> Self {
        Self { warn_after }
    }
}

#[async_trait]
impl Guardrail for RetryPressureGuardrail {
    fn name(&self) -> &str {
        "retry-pressure"
    }

    fn order(&self) -> i32 {
        10
    }

    async fn evaluate(&self, context: &GuardrailContext, _cancel: &CancellationToken) -> GuardrailResult {
        if self.warn_after > 0 && context.retry_count >= self.warn_after {
            let task = context.task_id.as_deref().unwrap_or("current task");
            GuardrailResult::Warn(format!(
                "{task} has failed {} times in a row",
                context.retry_count
            ))
        } else {
            GuardrailResult::Pass
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingGuardrail;

    fn context(iteration: u32, retry_count: u32) -> GuardrailContext {
        GuardrailContext {
            module: "billing".to_string(),
            task_id: Some("IdentifyComponents".to_string()),
            iteration,
            retry_count,
        }
    }

    #[tokio::test]
    async fn test_short_circuit_block_skips_remaining() {
        let warn = Arc::new(CountingGuardrail::new("a", 1, GuardrailResult::Warn("a".into())));
        let block = Arc::new(
            CountingGuardrail::new("b", 2, GuardrailResult::Block("b".into())).short_circuiting(),
        );
        let pass = Arc::new(CountingGuardrail::new("c", 3, GuardrailResult::Pass));

        let pipeline = GuardrailPipeline::new()
            .with_guardrail(pass.clone())
            .with_guardrail(block.clone())
            .with_guardrail(warn.clone());

        let results: Vec<GuardrailResult> = pipeline
            .evaluate(&context(1, 0), &CancellationToken::new())
            .await
            .into_iter()
            .map(|o| o.result)
            .collect();

        assert_eq!(
            results,
            vec![
                GuardrailResult::Warn("a".into()),
                GuardrailResult::Block("b".into())
            ]
        );
        assert_eq!(warn.calls(), 1);
        assert_eq!(block.calls(), 1);
        assert_eq!(pass.calls(), 0);
    }

    #[tokio::test]
    async fn test_non_short_circuit_block_collects_everything() {
        let block = Arc::new(CountingGuardrail::new("b", 1, GuardrailResult::Block("b".into())));
        let pass = Arc::new(CountingGuardrail::new("c", 2, GuardrailResult::Pass));
        let pipeline = GuardrailPipeline::new()
            .with_guardrail(block)
            .with_guardrail(pass.clone());

        let outcomes = pipeline.evaluate(&context(1, 0), &CancellationToken::new()).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[1].guardrail, "c");
        assert_eq!(pass.calls(), 1);
    }

    #[tokio::test]
    async fn test_equal_order_keeps_registration_order() {
        let first = Arc::new(CountingGuardrail::new("first", 5, GuardrailResult::Pass));
        let second = Arc::new(CountingGuardrail::new("second", 5, GuardrailResult::Pass));
        let pipeline = GuardrailPipeline::new()
            .with_guardrail(first)
            .with_guardrail(second);

        let names: Vec<String> = pipeline
            .evaluate(&context(1, 0), &CancellationToken::new())
            .await
            .into_iter()
            .map(|o| o.guardrail)
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_empty_pipeline_yields_nothing() {
        let pipeline = GuardrailPipeline::new();
        assert!(pipeline.is_empty());
        assert!(pipeline
            .evaluate(&context(1, 0), &CancellationToken::new())
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_max_iterations_guardrail() {
        let guardrail = MaxIterationsGuardrail::new(3);
        let cancel = CancellationToken::new();
        assert_eq!(guardrail.evaluate(&context(3, 0), &cancel).await, GuardrailResult::Pass);
        assert!(guardrail.evaluate(&context(4, 0), &cancel).await.is_block());
        assert!(guardrail.short_circuit());
    }

    #[tokio::test]
    async fn test_retry_pressure_guardrail() {
        let guardrail = RetryPressureGuardrail::new(2);
        let cancel = CancellationToken::new();
        assert_eq!(guardrail.evaluate(&context(1, 1), &cancel).await, GuardrailResult::Pass);
        assert_eq!(
            guardrail.evaluate(&context(1, 2), &cancel).await,
            GuardrailResult::Warn("IdentifyComponents has failed 2 times in a row".into())
        );
    }
}
