// Scripted test doubles - no side effects, everything recorded in memory

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::collaborators::{
    Checkpoint, CheckpointSink, CheckpointTrigger, ModelClient, ModelRequest, ModelResponse,
    ModelSelector, OutputRenderer, PlanStore, PromptBuilder, PromptRequest, SessionManager,
    PlanProgress, StateAssessor, TokenUsage, ToolDefinition, ToolRegistry,
};
use crate::errors::{ModelError, OrchestratorError};
use crate::orchestration::{
    CoreServices, Guardrail, GuardrailContext, GuardrailResult, RunOptions, WorkflowOrchestrator,
};
use crate::workflow::{WorkflowPhase, WorkflowStep};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Assessor that answers from a script instead of reading artifacts
#[derive(Debug)]
pub struct ScriptedAssessor {
    step: Option<WorkflowStep>,
    spec_ready: bool,
    component_answers: Mutex<VecDeque<bool>>,
    more_components: bool,
    task_answers: Mutex<VecDeque<bool>>,
    hints: Mutex<Vec<(String, WorkflowStep)>>,
    hint_error: bool,
    progress: PlanProgress,
}

impl ScriptedAssessor {
    pub fn at(step: WorkflowStep) -> Self {
        Self {
            step: Some(step),
            spec_ready: true,
            component_answers: Mutex::new(VecDeque::new()),
            more_components: false,
            task_answers: Mutex::new(VecDeque::new()),
            hints: Mutex::new(Vec::new()),
            hint_error: false,
            progress: PlanProgress::default(),
        }
    }

    /// `current_step` always errors
    pub fn failing() -> Self {
        Self {
            step: None,
            ..Self::at(WorkflowStep::DraftSpecification)
        }
    }

    /// Answer once per `has_more_components` call, then fall back to `false`
    pub fn with_component_answers(self, answers: &[bool]) -> Self {
        *lock(&self.component_answers) = answers.iter().copied().collect();
        self
    }

    /// Answer for `has_more_components` once the scripted answers run out
    pub fn with_more_components(mut self, more: bool) -> Self {
        self.more_components = more;
        self
    }

    pub fn with_task_answers(self, answers: &[bool]) -> Self {
        *lock(&self.task_answers) = answers.iter().copied().collect();
        self
    }

    pub fn with_spec_ready(mut self, ready: bool) -> Self {
        self.spec_ready = ready;
        self
    }

    pub fn with_plan_progress(mut self, progress: PlanProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_failing_hints(mut self) -> Self {
        self.hint_error = true;
        self
    }

    pub fn hints(&self) -> Vec<(String, WorkflowStep)> {
        lock(&self.hints).clone()
    }
}

#[async_trait]
impl StateAssessor for ScriptedAssessor {
    async fn current_step(&self, module: &str) -> Result<WorkflowStep> {
        self.step
            .ok_or_else(|| anyhow!("no artifacts readable for module '{module}'"))
    }

    async fn persist_step_hint(&self, module: &str, step: WorkflowStep) -> Result<()> {
        if self.hint_error {
            return Err(anyhow!("hint storage unavailable"));
        }
        lock(&self.hints).push((module.to_string(), step));
        Ok(())
    }

    async fn is_specification_ready(&self, _module: &str) -> Result<bool> {
        Ok(self.spec_ready)
    }

    async fn has_more_components(&self, _module: &str) -> Result<bool> {
        Ok(lock(&self.component_answers)
            .pop_front()
            .unwrap_or(self.more_components))
    }

    async fn has_more_tasks(&self, _module: &str) -> Result<bool> {
        Ok(lock(&self.task_answers).pop_front().unwrap_or(false))
    }

    async fn plan_progress(&self, _module: &str) -> Result<PlanProgress> {
        Ok(self.progress)
    }
}

type ErrorFactory = Arc<dyn Fn() -> ModelError + Send + Sync>;

/// Model client with scripted availability and failures
pub struct ScriptedModelClient {
    text: String,
    usage: TokenUsage,
    unavailable: Vec<String>,
    failure: Option<ErrorFactory>,
    failures_remaining: Mutex<Option<usize>>,
    cancel_on_invoke: Option<CancellationToken>,
    invoked: Mutex<Vec<String>>,
    prompts: Mutex<Vec<String>>,
}

impl std::fmt::Debug for ScriptedModelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedModelClient")
            .field("text", &self.text)
            .field("unavailable", &self.unavailable)
            .field("invoked", &self.invoked_models())
            .finish_non_exhaustive()
    }
}

impl ScriptedModelClient {
    pub fn succeeding(text: &str) -> Self {
        Self {
            text: text.to_string(),
            usage: TokenUsage {
                input: 60,
                output: 40,
                total: 100,
                context_window: 200_000,
                is_premium: false,
            },
            unavailable: Vec::new(),
            failure: None,
            failures_remaining: Mutex::new(None),
            cancel_on_invoke: None,
            invoked: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Every available model fails with the produced error
    pub fn failing_with(error: impl Fn() -> ModelError + Send + Sync + 'static) -> Self {
        Self {
            failure: Some(Arc::new(error)),
            ..Self::succeeding("")
        }
    }

    /// The first `times` calls to available models fail, later ones succeed
    pub fn failing_times(mut self, times: usize, error: impl Fn() -> ModelError + Send + Sync + 'static) -> Self {
        self.failure = Some(Arc::new(error));
        *lock(&self.failures_remaining) = Some(times);
        self
    }

    pub fn with_unavailable_models(mut self, models: &[&str]) -> Self {
        self.unavailable = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Cancel `token` from inside the first invocation
    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_on_invoke = Some(token);
        self
    }

    pub fn invoked_models(&self) -> Vec<String> {
        lock(&self.invoked).clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    fn scripted_failure(&self) -> Option<ModelError> {
        let factory = self.failure.as_ref()?;
        let mut remaining = lock(&self.failures_remaining);
        match remaining.as_mut() {
            None => Some(factory()),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(factory())
            }
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn invoke(
        &self,
        request: &ModelRequest,
        _cancel: &CancellationToken,
    ) -> Result<ModelResponse, ModelError> {
        lock(&self.invoked).push(request.model.clone());
        lock(&self.prompts).push(request.prompt.clone());

        if let Some(token) = &self.cancel_on_invoke {
            token.cancel();
            return Err(ModelError::Cancelled);
        }

        if self.unavailable.contains(&request.model) {
            return Err(ModelError::unavailable(&request.model, "model is offline"));
        }

        if let Some(error) = self.scripted_failure() {
            return Err(error);
        }

        Ok(ModelResponse {
            text: self.text.clone(),
            token_usage: self.usage,
            tool_calls_made: 0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StaticSelector {
    primary: String,
    fallbacks: Vec<String>,
}

impl StaticSelector {
    pub fn new(primary: &str, fallbacks: &[&str]) -> Self {
        Self {
            primary: primary.to_string(),
            fallbacks: fallbacks.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl ModelSelector for StaticSelector {
    fn model_for_phase(&self, _phase: WorkflowPhase) -> String {
        self.primary.clone()
    }

    fn fallback_chain(&self, _phase: WorkflowPhase) -> Vec<String> {
        self.fallbacks.clone()
    }
}

#[derive(Debug, Default)]
pub struct NoTools;

impl ToolRegistry for NoTools {
    fn tools_for_phase(&self, _phase: WorkflowPhase) -> Vec<ToolDefinition> {
        Vec::new()
    }
}

#[derive(Debug, Default)]
pub struct EchoPromptBuilder;

impl PromptBuilder for EchoPromptBuilder {
    fn build(&self, request: &PromptRequest) -> String {
        match &request.extra_context {
            Some(context) => format!("{} for {}\n{}", request.step, request.module, context),
            None => format!("{} for {}", request.step, request.module),
        }
    }
}

/// Renderer that records output and answers prompts from a script
#[derive(Debug, Default)]
pub struct RecordingRenderer {
    answers: Mutex<VecDeque<String>>,
    progress: Mutex<Vec<WorkflowStep>>,
    errors: Mutex<Vec<String>>,
    results: Mutex<Vec<String>>,
    prompts: Mutex<Vec<String>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_answers(self, answers: &[&str]) -> Self {
        *lock(&self.answers) = answers.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn progress(&self) -> Vec<WorkflowStep> {
        lock(&self.progress).clone()
    }

    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).clone()
    }

    pub fn results(&self) -> Vec<String> {
        lock(&self.results).clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

#[async_trait]
impl OutputRenderer for RecordingRenderer {
    fn render_progress(&self, _phase: WorkflowPhase, step: WorkflowStep, _fraction: f64) {
        lock(&self.progress).push(step);
    }

    fn render_error(&self, message: &str, _cause: Option<&str>) {
        lock(&self.errors).push(message.to_string());
    }

    fn render_result(&self, message: &str) {
        lock(&self.results).push(message.to_string());
    }

    async fn prompt(&self, message: &str, _cancel: &CancellationToken) -> Option<String> {
        lock(&self.prompts).push(message.to_string());
        lock(&self.answers).pop_front()
    }
}

/// Guardrail returning a fixed result and counting evaluations
#[derive(Debug)]
pub struct CountingGuardrail {
    name: String,
    order: i32,
    result: GuardrailResult,
    short_circuit: bool,
    calls: AtomicUsize,
}

impl CountingGuardrail {
    pub fn new(name: &str, order: i32, result: GuardrailResult) -> Self {
        Self {
            name: name.to_string(),
            order,
            result,
            short_circuit: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn short_circuiting(mut self) -> Self {
        self.short_circuit = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Guardrail for CountingGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self) -> i32 {
        self.order
    }

    fn short_circuit(&self) -> bool {
        self.short_circuit
    }

    async fn evaluate(&self, _context: &GuardrailContext, _cancel: &CancellationToken) -> GuardrailResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

#[derive(Debug, Default)]
pub struct RecordingCheckpointSink {
    checkpoints: Mutex<Vec<Checkpoint>>,
}

impl RecordingCheckpointSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        lock(&self.checkpoints).clone()
    }

    pub fn triggers(&self) -> Vec<CheckpointTrigger> {
        lock(&self.checkpoints).iter().map(|c| c.trigger).collect()
    }
}

#[async_trait]
impl CheckpointSink for RecordingCheckpointSink {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        lock(&self.checkpoints).push(checkpoint.clone());
        Ok(())
    }
}

/// Sink whose writes always fail
#[derive(Debug, Default)]
pub struct FailingCheckpointSink {
    attempts: AtomicUsize,
}

impl FailingCheckpointSink {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointSink for FailingCheckpointSink {
    async fn save(&self, _checkpoint: &Checkpoint) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("disk quota exceeded"))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPlanStore {
    plans: Mutex<HashMap<String, String>>,
}

impl InMemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&self, module: &str) -> Option<String> {
        lock(&self.plans).get(module).cloned()
    }
}

#[async_trait]
impl PlanStore for InMemoryPlanStore {
    async fn read(&self, module: &str) -> Result<Option<String>> {
        Ok(self.plan(module))
    }

    async fn append(&self, module: &str, text: &str) -> Result<()> {
        let mut plans = lock(&self.plans);
        let plan = plans.entry(module.to_string()).or_default();
        if !plan.is_empty() {
            plan.push_str("\n\n");
        }
        plan.push_str(text);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FixedSession(pub String);

#[async_trait]
impl SessionManager for FixedSession {
    async fn create_or_resume(&self, _module: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Required services wired to scripted doubles, with handles kept for assertions
pub struct TestHarness {
    pub services: CoreServices,
    pub assessor: Arc<ScriptedAssessor>,
    pub client: Arc<ScriptedModelClient>,
    pub renderer: Arc<RecordingRenderer>,
}

impl TestHarness {
    pub fn new(
        assessor: ScriptedAssessor,
        client: ScriptedModelClient,
        renderer: RecordingRenderer,
    ) -> Self {
        let assessor = Arc::new(assessor);
        let client = Arc::new(client);
        let renderer = Arc::new(renderer);
        let services = CoreServices {
            assessor: assessor.clone(),
            model_client: client.clone(),
            model_selector: Arc::new(StaticSelector::new("primary", &["fallback"])),
            tools: Arc::new(NoTools),
            prompts: Arc::new(EchoPromptBuilder),
            renderer: renderer.clone(),
        };
        Self {
            services,
            assessor,
            client,
            renderer,
        }
    }

    pub fn orchestrator(&self, options: RunOptions) -> Result<WorkflowOrchestrator, OrchestratorError> {
        WorkflowOrchestrator::new(self.services.clone(), options)
    }
}

/// Harness starting at `step` with a model that always succeeds
pub fn services_at(step: WorkflowStep) -> TestHarness {
    TestHarness::new(
        ScriptedAssessor::at(step),
        ScriptedModelClient::succeeding("ok"),
        RecordingRenderer::new(),
    )
}
