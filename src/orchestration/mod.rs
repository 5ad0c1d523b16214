//! Orchestration control plane
//!
//! This module drives one module session through the workflow loop. Each
//! iteration runs, in order:
//!
//! 1. the pause gate (blocks while paused)
//! 2. the budget verdict
//! 3. the guardrail pipeline
//! 4. the specification drift check
//! 5. the phase-specific step, including the model call
//! 6. outcome handling: failure escalation, checkpointing, and the next
//!    transition on the [`WorkflowEngine`]
//!
//! Only the [`OrchestrationResult`] returned from [`WorkflowOrchestrator::run`]
//! tells the caller how the run ended.

pub mod failure;
pub mod guardrails;
pub mod pause;
pub mod resilience;
pub mod result;

pub use failure::{EscalationAction, FailureClassification, FailureHandler, FailureSeverity};
pub use guardrails::{
    Guardrail, GuardrailContext, GuardrailOutcome, GuardrailPipeline, GuardrailResult,
    MaxIterationsGuardrail, RetryPressureGuardrail,
};
pub use pause::PauseGate;
pub use resilience::{ModelInvocation, ModelResilienceLayer};
pub use result::{OrchestrationResult, StepResult, REASON_CANCELLED, REASON_CONFIRMATION_REQUIRED};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::collaborators::{
    BudgetEnforcer, BudgetStatus, Checkpoint, CheckpointMetrics, CheckpointSink, CheckpointTrigger,
    DriftService, GitWorkflowService, ModelClient, ModelSelector, OutputRenderer, PlanStore,
    PlanProgress, PromptBuilder, PromptRequest, SessionManager, StateAssessor, TokenTracker,
    ToolRegistry,
};
use crate::errors::{ModelError, OrchestratorError};
use crate::telemetry::{create_run_span, generate_correlation_id};
use crate::workflow::{
    PhaseReadiness, PhaseTransitionController, WorkflowEngine, WorkflowPhase, WorkflowStep, WorkflowTrigger,
};

/// Per-run knobs supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// No human is available to answer prompts
    pub unattended: bool,
    pub failure_threshold: u32,
    /// Free text appended to every prompt
    pub user_context: Option<String>,
    pub max_iterations: Option<u32>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            unattended: false,
            failure_threshold: 3,
            user_context: None,
            max_iterations: None,
        }
    }
}

/// Collaborators every run needs
#[derive(Clone)]
pub struct CoreServices {
    pub assessor: Arc<dyn StateAssessor>,
    pub model_client: Arc<dyn ModelClient>,
    pub model_selector: Arc<dyn ModelSelector>,
    pub tools: Arc<dyn ToolRegistry>,
    pub prompts: Arc<dyn PromptBuilder>,
    pub renderer: Arc<dyn OutputRenderer>,
}

/// The fixed step → trigger table for a step that completed normally
pub fn step_trigger(step: WorkflowStep) -> WorkflowTrigger {
    match step {
        WorkflowStep::DraftSpecification => WorkflowTrigger::SpecApproved,
        WorkflowStep::DetermineDependencies => WorkflowTrigger::DependenciesDetermined,
        WorkflowStep::IdentifyComponents => WorkflowTrigger::ComponentsIdentified,
        WorkflowStep::SelectNextComponent => WorkflowTrigger::ComponentSelected,
        WorkflowStep::BreakIntoTasks => WorkflowTrigger::TasksBrokenDown,
        WorkflowStep::IterateThroughTasks => WorkflowTrigger::ComponentComplete,
        WorkflowStep::Repeat => WorkflowTrigger::Assess,
    }
}

fn is_affirmative(answer: Option<&str>) -> bool {
    matches!(
        answer.map(|a| a.trim().to_ascii_lowercase()).as_deref(),
        Some("y") | Some("yes")
    )
}

struct RunState {
    module: String,
    session_id: String,
    iteration: u32,
}

enum Preflight {
    Proceed,
    Blocked(String),
    Cancelled,
}

enum Flow {
    Continue,
    Stop(OrchestrationResult),
}

/// Drives one module through the workflow loop
pub struct WorkflowOrchestrator {
    engine: WorkflowEngine,
    transitions: PhaseTransitionController,
    guardrails: GuardrailPipeline,
    failure_handler: Option<FailureHandler>,
    resilience: ModelResilienceLayer,
    pause_gate: Arc<PauseGate>,
    assessor: Arc<dyn StateAssessor>,
    tools: Arc<dyn ToolRegistry>,
    prompts: Arc<dyn PromptBuilder>,
    renderer: Arc<dyn OutputRenderer>,
    drift: Option<Arc<dyn DriftService>>,
    git: Option<Arc<dyn GitWorkflowService>>,
    sessions: Option<Arc<dyn SessionManager>>,
    checkpoints: Option<Arc<dyn CheckpointSink>>,
    tokens: Option<Arc<dyn TokenTracker>>,
    plans: Option<Arc<dyn PlanStore>>,
    budget: Option<Arc<dyn BudgetEnforcer>>,
    /// Operator said yes to the current confirmation-required verdict
    budget_confirmed: bool,
    readiness: PhaseReadiness,
    options: RunOptions,
}

impl std::fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("engine", &self.engine)
            .field("transitions", &self.transitions)
            .field("guardrails", &self.guardrails)
            .field("failure_handler", &self.failure_handler)
            .field("paused", &self.pause_gate.is_paused())
            .field("drift", &self.drift.is_some())
            .field("git", &self.git.is_some())
            .field("sessions", &self.sessions.is_some())
            .field("checkpoints", &self.checkpoints.is_some())
            .field("tokens", &self.tokens.is_some())
            .field("plans", &self.plans.is_some())
            .field("budget", &self.budget.is_some())
            .field("budget_confirmed", &self.budget_confirmed)
            .field("readiness", &self.readiness)
            .field("options", &self.options)
            .finish()
    }
}

impl WorkflowOrchestrator {
    pub fn new(services: CoreServices, options: RunOptions) -> Result<Self, OrchestratorError> {
        let failure_handler = FailureHandler::new(options.failure_threshold)?;

        let mut guardrails = GuardrailPipeline::new();
        if let Some(limit) = options.max_iterations {
            guardrails.register(Arc::new(MaxIterationsGuardrail::new(limit)));
        }

        Ok(Self {
            engine: WorkflowEngine::new(Arc::clone(&services.assessor)),
            transitions: PhaseTransitionController::new(),
            guardrails,
            failure_handler: Some(failure_handler),
            resilience: ModelResilienceLayer::new(services.model_client, services.model_selector),
            pause_gate: Arc::new(PauseGate::new()),
            assessor: services.assessor,
            tools: services.tools,
            prompts: services.prompts,
            renderer: services.renderer,
            drift: None,
            git: None,
            sessions: None,
            checkpoints: None,
            tokens: None,
            plans: None,
            budget: None,
            budget_confirmed: false,
            readiness: PhaseReadiness::default(),
            options,
        })
    }

    pub fn with_guardrail(mut self, guardrail: Arc<dyn Guardrail>) -> Self {
        self.guardrails.register(guardrail);
        self
    }

    pub fn with_failure_handler(mut self, handler: FailureHandler) -> Self {
        self.failure_handler = Some(handler);
        self
    }

    /// Without a failure handler, the first failed step ends the run
    pub fn without_failure_handler(mut self) -> Self {
        self.failure_handler = None;
        self
    }

    pub fn with_pause_gate(mut self, gate: Arc<PauseGate>) -> Self {
        self.pause_gate = gate;
        self
    }

    pub fn with_drift_service(mut self, drift: Arc<dyn DriftService>) -> Self {
        self.drift = Some(drift);
        self
    }

    pub fn with_git_service(mut self, git: Arc<dyn GitWorkflowService>) -> Self {
        self.git = Some(git);
        self
    }

    pub fn with_session_manager(mut self, sessions: Arc<dyn SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_checkpoint_sink(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoints = Some(sink);
        self
    }

    pub fn with_token_tracker(mut self, tracker: Arc<dyn TokenTracker>) -> Self {
        self.tokens = Some(tracker);
        self
    }

    pub fn with_plan_store(mut self, plans: Arc<dyn PlanStore>) -> Self {
        self.plans = Some(plans);
        self
    }

    pub fn with_budget_enforcer(mut self, budget: Arc<dyn BudgetEnforcer>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Shared handle for whoever pauses and resumes the loop
    pub fn pause_gate(&self) -> Arc<PauseGate> {
        Arc::clone(&self.pause_gate)
    }

    pub fn approve_specification(&mut self) {
        self.transitions.approve_specification();
    }

    pub fn reset_approval(&mut self) {
        self.transitions.reset_approval();
    }

    pub fn current_step(&self) -> WorkflowStep {
        self.engine.current_step()
    }

    pub fn current_phase(&self) -> WorkflowPhase {
        self.engine.current_phase()
    }

    pub fn permitted_triggers(&self) -> Vec<WorkflowTrigger> {
        self.engine.permitted_triggers()
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn failure_handler(&self) -> Option<&FailureHandler> {
        self.failure_handler.as_ref()
    }

    /// Advisory phase-change verdicts from the latest run
    pub fn readiness(&self) -> PhaseReadiness {
        self.readiness
    }

    /// Run the workflow loop for `module` until it completes, is interrupted,
    /// or `cancel` fires.
    pub async fn run(
        &mut self,
        module: &str,
        cancel: &CancellationToken,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        let module = module.trim();
        if module.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "module name must not be empty".to_string(),
            ));
        }

        let session_id = self.open_session(module).await;
        let span = create_run_span(module, &session_id, &generate_correlation_id());

        Ok(self
            .run_loop(module.to_string(), session_id, cancel)
            .instrument(span)
            .await)
    }

    async fn open_session(&self, module: &str) -> String {
        if let Some(git) = &self.git {
            match git.ensure_module_branch(module).await {
                Ok(branch) => info!(module = %module, branch = %branch, "Module branch ready"),
                Err(e) => warn!(module = %module, error = %e, "Could not prepare module branch"),
            }
        }

        if let Some(sessions) = &self.sessions {
            match sessions.create_or_resume(module).await {
                Ok(session_id) => return session_id,
                Err(e) => warn!(module = %module, error = %e, "Session unavailable, using a fresh id"),
            }
        }

        uuid::Uuid::new_v4().to_string()
    }

    async fn run_loop(
        &mut self,
        module: String,
        session_id: String,
        cancel: &CancellationToken,
    ) -> OrchestrationResult {
        let mut run = RunState {
            module,
            session_id,
            iteration: 0,
        };

        self.engine.initialize(&run.module).await;
        self.readiness = PhaseReadiness::default();
        self.budget_confirmed = false;
        info!(
            module = %run.module,
            step = %self.engine.current_step(),
            unattended = self.options.unattended,
            "Starting workflow run"
        );

        loop {
            if cancel.is_cancelled() {
                return self.finish_cancelled(&run).await;
            }

            if self.engine.is_completed() {
                return self.finish_completed(&run);
            }

            if self.pause_gate.is_paused() {
                self.renderer.render_result("Paused. Waiting to resume...");
                self.checkpoint(&run, CheckpointTrigger::UserPause).await;
                self.pause_gate.wait_if_paused(cancel).await;
                if cancel.is_cancelled() {
                    continue;
                }
                self.renderer.render_result("Resumed.");
            }

            run.iteration += 1;
            let step = self.engine.current_step();
            self.renderer
                .render_progress(step.phase(), step, step.progress_fraction());
            debug!(iteration = run.iteration, step = %step, "Starting iteration");

            match self.preflight(&run, cancel).await {
                Preflight::Proceed => {}
                Preflight::Cancelled => continue,
                Preflight::Blocked(reason) => {
                    return OrchestrationResult::interrupted(run.iteration, step, reason);
                }
            }

            let outcome = self.execute_step(&run, cancel).await;
            if cancel.is_cancelled() {
                continue;
            }

            match self.handle_outcome(&run, outcome, cancel).await {
                Flow::Continue => {}
                Flow::Stop(result) => return result,
            }
        }
    }

    /// Budget, guardrails and drift, in that order. Nothing downstream of a
    /// block runs.
    async fn preflight(&mut self, run: &RunState, cancel: &CancellationToken) -> Preflight {
        let step = self.engine.current_step();

        if let Some(budget) = self.budget.clone() {
            let usage = self.tokens.as_ref().map(|t| t.usage()).unwrap_or_default();
            let verdict = budget.verdict(usage.total_tokens, usage.premium_requests);
            debug!(status = ?verdict.status, total_tokens = usage.total_tokens, "Budget verdict");
            if verdict.status != BudgetStatus::ConfirmationRequired {
                self.budget_confirmed = false;
            }

            match verdict.status {
                BudgetStatus::Ok => {}
                BudgetStatus::Warning => {
                    self.renderer
                        .render_result(&format!("Budget warning: {}", verdict.message));
                }
                BudgetStatus::ConfirmationRequired if self.options.unattended => {
                    warn!(message = %verdict.message, "Budget confirmation required in unattended mode");
                    return Preflight::Blocked(self.fail_step(run, &verdict.message).await);
                }
                BudgetStatus::ConfirmationRequired if self.budget_confirmed => {
                    debug!("Budget threshold already approved");
                }
                BudgetStatus::ConfirmationRequired => {
                    let question = format!("{} Continue? (yes/no)", verdict.message);
                    let answer = self.renderer.prompt(&question, cancel).await;
                    if cancel.is_cancelled() {
                        return Preflight::Cancelled;
                    }
                    if !is_affirmative(answer.as_deref()) {
                        return Preflight::Blocked(self.fail_step(run, &verdict.message).await);
                    }
                    info!("Operator approved continuing past budget threshold");
                    self.budget_confirmed = true;
                }
                BudgetStatus::Exceeded => {
                    return Preflight::Blocked(self.fail_step(run, &verdict.message).await);
                }
            }
        }

        let context = GuardrailContext {
            module: run.module.clone(),
            task_id: Some(step.name().to_string()),
            iteration: run.iteration,
            retry_count: self
                .failure_handler
                .as_ref()
                .map(|h| h.failure_count(step.name()))
                .unwrap_or(0),
        };
        let outcomes = self.guardrails.evaluate(&context, cancel).await;
        if cancel.is_cancelled() {
            return Preflight::Cancelled;
        }

        for outcome in &outcomes {
            if let GuardrailResult::Warn(message) = &outcome.result {
                warn!(guardrail = %outcome.guardrail, message = %message, "Guardrail warning");
                self.renderer.render_result(&format!("Warning: {message}"));
            }
        }

        let blocked = outcomes.iter().find_map(|outcome| match &outcome.result {
            GuardrailResult::Block(message) => Some(format!(
                "Blocked by guardrail '{}': {}",
                outcome.guardrail, message
            )),
            _ => None,
        });
        if let Some(reason) = blocked {
            return Preflight::Blocked(self.fail_step(run, &reason).await);
        }

        if let Some(drift) = &self.drift {
            match drift.detect(&run.module, cancel).await {
                Ok(report) => {
                    for warning in report.warnings() {
                        warn!(module = %run.module, "{warning}");
                        self.renderer.render_result(&format!("Warning: {warning}"));
                    }
                }
                Err(e) => warn!(module = %run.module, error = %e, "Drift check failed"),
            }
            if cancel.is_cancelled() {
                return Preflight::Cancelled;
            }
        }

        Preflight::Proceed
    }

    async fn fail_step(&self, run: &RunState, message: &str) -> String {
        self.renderer.render_error(message, None);
        self.checkpoint(run, CheckpointTrigger::TaskFailure).await;
        message.to_string()
    }

    async fn execute_step(&mut self, run: &RunState, cancel: &CancellationToken) -> StepResult {
        let step = self.engine.current_step();

        if step == WorkflowStep::DraftSpecification {
            if self.transitions.is_specification_approved() {
                return StepResult::succeeded(
                    WorkflowTrigger::SpecApproved,
                    "Specification approved",
                );
            }

            if let Err(failure) = self.invoke_model(run, step, cancel).await {
                return failure;
            }

            let ready = self
                .assessor
                .is_specification_ready(&run.module)
                .await
                .unwrap_or_else(|e| {
                    warn!(module = %run.module, error = %e, "Could not check specification readiness");
                    false
                });
            let message = if ready {
                format!(
                    "Specification for '{}' is ready for review. Approve it to begin planning.",
                    run.module
                )
            } else {
                format!(
                    "Specification draft for '{}' was updated and needs review.",
                    run.module
                )
            };
            return StepResult::needs_confirmation(message);
        }

        // Module completion is decided here, before Repeat would spend a model call
        if step == WorkflowStep::SelectNextComponent && !self.has_more_components(&run.module).await {
            return StepResult::succeeded(
                WorkflowTrigger::ModuleComplete,
                "No components remain to be built",
            );
        }

        let invocation = match self.invoke_model(run, step, cancel).await {
            Ok(invocation) => invocation,
            Err(failure) => return failure,
        };

        let mut trigger = step_trigger(step);
        match step {
            WorkflowStep::BreakIntoTasks => {
                self.append_plan(&run.module, &invocation.response.text).await;
            }
            WorkflowStep::IterateThroughTasks => {
                let more_tasks = self.assessor.has_more_tasks(&run.module).await.unwrap_or_else(|e| {
                    warn!(module = %run.module, error = %e, "Could not check remaining tasks");
                    false
                });
                if more_tasks {
                    trigger = WorkflowTrigger::TaskIterationComplete;
                }
            }
            WorkflowStep::Repeat => {
                let all_built = !self.has_more_components(&run.module).await;
                let can_complete = self.plan_progress(&run.module).await.map(|progress| {
                    self.transitions
                        .can_auto_transition_to_complete(all_built, progress.all_tasks_done)
                });
                self.readiness.completion = can_complete;
                info!(module = %run.module, all_built, can_complete = ?can_complete, "Component cycle finished");
                if all_built {
                    self.renderer
                        .render_result("All components built. Finishing module.");
                }
            }
            _ => {}
        }

        StepResult::succeeded(
            trigger,
            format!("{step} completed with {}", invocation.model),
        )
    }

    async fn invoke_model(
        &self,
        run: &RunState,
        step: WorkflowStep,
        cancel: &CancellationToken,
    ) -> Result<ModelInvocation, StepResult> {
        let phase = step.phase();
        let tools = self.tools.tools_for_phase(phase);
        let prompt = self.prompts.build(&PromptRequest {
            phase,
            step,
            module: run.module.clone(),
            component: None,
            task: None,
            extra_context: self.options.user_context.clone(),
        });

        match self.resilience.invoke(phase, &prompt, &tools, cancel).await {
            Ok(invocation) => {
                if let Some(tokens) = &self.tokens {
                    tokens.record(&invocation.response.token_usage);
                }
                Ok(invocation)
            }
            Err(ModelError::Cancelled) => Err(StepResult::failed("Model invocation cancelled")),
            Err(e) if e.is_critical() => {
                Err(StepResult::critical(format!("{step} failed: {e}")))
            }
            Err(e) => Err(StepResult::failed(format!("{step} failed: {e}"))),
        }
    }

    async fn has_more_components(&self, module: &str) -> bool {
        self.assessor
            .has_more_components(module)
            .await
            .unwrap_or_else(|e| {
                // Never declare a module finished on a failed check
                warn!(module = %module, error = %e, "Could not check remaining components");
                true
            })
    }

    async fn plan_progress(&self, module: &str) -> Option<PlanProgress> {
        match self.assessor.plan_progress(module).await {
            Ok(progress) => Some(progress),
            Err(e) => {
                warn!(module = %module, error = %e, "Could not read plan progress");
                None
            }
        }
    }

    async fn append_plan(&self, module: &str, text: &str) {
        let Some(plans) = &self.plans else {
            return;
        };
        if text.trim().is_empty() {
            return;
        }
        if let Err(e) = plans.append(module, text).await {
            warn!(module = %module, error = %e, "Failed to append plan output");
        }
    }

    async fn handle_outcome(
        &mut self,
        run: &RunState,
        outcome: StepResult,
        cancel: &CancellationToken,
    ) -> Flow {
        let step = self.engine.current_step();

        if !outcome.success {
            self.renderer.render_error(outcome.message(), None);
            self.checkpoint(run, CheckpointTrigger::TaskFailure).await;

            if outcome.is_critical_error {
                let classification = match &self.failure_handler {
                    Some(handler) => handler.record_critical_error(outcome.message()),
                    None => {
                        error!(message = %outcome.message(), "Critical failure");
                        FailureClassification {
                            severity: FailureSeverity::Critical,
                            action: EscalationAction::Block,
                            message: outcome.message().to_string(),
                            task_id: None,
                            consecutive_failures: 0,
                        }
                    }
                };
                self.renderer.render_error(
                    &format!("Critical error, stopping: {}", classification.message),
                    None,
                );
                self.checkpoint(run, CheckpointTrigger::TaskFailure).await;
                return Flow::Stop(OrchestrationResult::critical(
                    run.iteration,
                    step,
                    classification.message,
                ));
            }

            let Some(handler) = self.failure_handler.as_mut() else {
                return Flow::Stop(OrchestrationResult::interrupted(
                    run.iteration,
                    step,
                    outcome.message(),
                ));
            };

            let classification = handler.record_failure(step.name(), outcome.message());
            return match classification.action {
                EscalationAction::SelfCorrect => Flow::Continue,
                EscalationAction::PromptUser if self.options.unattended => {
                    warn!(
                        task_id = %step.name(),
                        consecutive_failures = classification.consecutive_failures,
                        "Repeated failures in unattended mode, continuing"
                    );
                    Flow::Continue
                }
                EscalationAction::PromptUser => {
                    let question = format!(
                        "Task '{}' failed {} times. Continue?",
                        step.name(),
                        classification.consecutive_failures
                    );
                    let answer = self.renderer.prompt(&question, cancel).await;
                    if cancel.is_cancelled() {
                        return Flow::Continue;
                    }
                    if is_affirmative(answer.as_deref()) {
                        handler.reset_failure_count(step.name());
                        Flow::Continue
                    } else {
                        Flow::Stop(OrchestrationResult::interrupted(
                            run.iteration,
                            step,
                            format!(
                                "Task '{}' stopped after {} consecutive failures",
                                step.name(),
                                classification.consecutive_failures
                            ),
                        ))
                    }
                }
                EscalationAction::Block => Flow::Stop(OrchestrationResult::critical(
                    run.iteration,
                    step,
                    classification.message,
                )),
            };
        }

        if let Some(handler) = self.failure_handler.as_mut() {
            handler.reset_failure_count(step.name());
        }
        self.checkpoint(run, CheckpointTrigger::StepCompletion).await;

        if outcome.requires_user_confirmation {
            self.renderer.render_result(outcome.message());
            self.checkpoint(run, CheckpointTrigger::UserPause).await;
            return Flow::Stop(OrchestrationResult::interrupted(
                run.iteration,
                step,
                REASON_CONFIRMATION_REQUIRED,
            ));
        }

        let Some(trigger) = outcome.next_trigger else {
            return Flow::Continue;
        };

        let phase_before = self.engine.current_phase();
        if !self.engine.fire(trigger) {
            let reason = format!("Transition {trigger} is not permitted from {step}");
            error!(step = %step, trigger = %trigger, "Step resolved an undeclared transition");
            self.renderer.render_error(&reason, None);
            return Flow::Stop(OrchestrationResult::interrupted(run.iteration, step, reason));
        }

        self.persist_step_hint(run).await;

        let phase_after = self.engine.current_phase();
        if phase_before != phase_after {
            if phase_after == WorkflowPhase::Building {
                let ready = self.plan_progress(&run.module).await.map(|progress| {
                    self.transitions
                        .can_auto_transition_to_building(progress.has_components, progress.has_tasks)
                });
                self.readiness.building = ready;
                debug!(ready = ?ready, "Planning to building transition check");
            }
            info!(
                module = %run.module,
                from_phase = %phase_before,
                to_phase = %phase_after,
                "Phase transition"
            );
            self.checkpoint(run, CheckpointTrigger::PhaseTransition).await;
        }

        Flow::Continue
    }

    async fn persist_step_hint(&self, run: &RunState) {
        let step = self.engine.current_step();
        if let Err(e) = self.assessor.persist_step_hint(&run.module, step).await {
            warn!(module = %run.module, step = %step, error = %e, "Failed to persist step hint");
        }
    }

    /// Best effort: failures are logged and dropped
    async fn checkpoint(&self, run: &RunState, trigger: CheckpointTrigger) {
        let Some(sink) = &self.checkpoints else {
            return;
        };

        let step = self.engine.current_step();
        let usage = self.tokens.as_ref().map(|t| t.usage()).unwrap_or_default();
        let checkpoint = Checkpoint {
            trigger,
            session_id: run.session_id.clone(),
            module: run.module.clone(),
            step,
            phase: step.phase(),
            iteration: run.iteration,
            metrics: CheckpointMetrics {
                total_tokens: usage.total_tokens,
                premium_requests: usage.premium_requests,
                consecutive_failures: self
                    .failure_handler
                    .as_ref()
                    .map(|h| h.failure_count(step.name()))
                    .unwrap_or(0),
            },
            created_at: Utc::now(),
        };

        match sink.save(&checkpoint).await {
            Ok(()) => debug!(trigger = ?trigger, step = %step, "Checkpoint saved"),
            Err(e) => warn!(trigger = ?trigger, error = %e, "Checkpoint write failed, continuing"),
        }
    }

    async fn finish_cancelled(&self, run: &RunState) -> OrchestrationResult {
        let step = self.engine.current_step();
        self.checkpoint(run, CheckpointTrigger::UserPause).await;
        self.renderer.render_result("Run cancelled.");
        info!(module = %run.module, step = %step, iterations = run.iteration, "Workflow run cancelled");
        OrchestrationResult::cancelled(run.iteration, step)
    }

    fn finish_completed(&self, run: &RunState) -> OrchestrationResult {
        let step = self.engine.current_step();
        self.renderer.render_result(&format!(
            "Module '{}' complete after {} iterations ({} transitions).",
            run.module,
            run.iteration,
            self.engine.history().len()
        ));
        info!(module = %run.module, iterations = run.iteration, "Workflow run complete");
        OrchestrationResult::completed(run.iteration, step)
    }
}
