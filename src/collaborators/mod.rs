//! Interfaces the orchestrator consumes, plus the concrete implementations the
//! binary wires together.
//!
//! Everything the control loop talks to sits behind one of these traits so
//! that tests can substitute scripted doubles and so that optional services
//! can simply be left out.

pub mod artifacts;
pub mod console;
pub mod defaults;
pub mod git;
pub mod process_client;

pub use artifacts::{ArtifactStateAssessor, SpecDriftDetector};
pub use console::ConsoleRenderer;
pub use defaults::{
    ConfiguredModelSelector, InMemoryTokenTracker, StaticToolRegistry, TemplatePromptBuilder,
    ThresholdBudgetEnforcer,
};
pub use git::Git2WorkflowService;
pub use process_client::ProcessModelClient;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::ModelError;
use crate::workflow::{WorkflowPhase, WorkflowStep};

/// Tool exposed to the model for a phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRequest {
    pub prompt: String,
    pub model: String,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
    pub context_window: u64,
    pub is_premium: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelResponse {
    pub text: String,
    pub token_usage: TokenUsage,
    pub tool_calls_made: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub phase: WorkflowPhase,
    pub step: WorkflowStep,
    pub module: String,
    pub component: Option<String>,
    pub task: Option<String>,
    pub extra_context: Option<String>,
}

/// Specification sections that changed since the last check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftReport {
    pub changed: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl DriftReport {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    /// One human-readable line per drifted section
    pub fn warnings(&self) -> Vec<String> {
        let changed = self.changed.iter().map(|s| format!("Specification section changed: {s}"));
        let added = self.added.iter().map(|s| format!("Specification section added: {s}"));
        let removed = self.removed.iter().map(|s| format!("Specification section removed: {s}"));
        changed.chain(added).chain(removed).collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub total_tokens: u64,
    pub premium_requests: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetStatus {
    Ok,
    Warning,
    ConfirmationRequired,
    Exceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetVerdict {
    pub status: BudgetStatus,
    pub message: String,
}

impl BudgetVerdict {
    pub fn ok() -> Self {
        Self {
            status: BudgetStatus::Ok,
            message: String::new(),
        }
    }

    pub fn new(status: BudgetStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Why a checkpoint was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointTrigger {
    UserPause,
    TaskFailure,
    StepCompletion,
    PhaseTransition,
}

impl CheckpointTrigger {
    pub const ALL: [CheckpointTrigger; 4] = [
        CheckpointTrigger::UserPause,
        CheckpointTrigger::TaskFailure,
        CheckpointTrigger::StepCompletion,
        CheckpointTrigger::PhaseTransition,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            CheckpointTrigger::UserPause => "user-pause",
            CheckpointTrigger::TaskFailure => "task-failure",
            CheckpointTrigger::StepCompletion => "step-completion",
            CheckpointTrigger::PhaseTransition => "phase-transition",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetrics {
    pub total_tokens: u64,
    pub premium_requests: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub trigger: CheckpointTrigger,
    pub session_id: String,
    pub module: String,
    pub step: WorkflowStep,
    pub phase: WorkflowPhase,
    pub iteration: u32,
    pub metrics: CheckpointMetrics,
    pub created_at: DateTime<Utc>,
}

/// How far the module's plan has got, as read from its artifacts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanProgress {
    /// At least one component is listed
    pub has_components: bool,
    /// The component being built (or, with none selected, the plan) has tasks
    pub has_tasks: bool,
    /// No task in the plan is still open
    pub all_tasks_done: bool,
}

/// Derives workflow position from the module's artifacts
#[async_trait]
pub trait StateAssessor: Send + Sync {
    async fn current_step(&self, module: &str) -> Result<WorkflowStep>;

    /// Record where the loop is; a hint for tooling, never read back as truth
    async fn persist_step_hint(&self, module: &str, step: WorkflowStep) -> Result<()>;

    async fn is_specification_ready(&self, module: &str) -> Result<bool>;

    async fn has_more_components(&self, module: &str) -> Result<bool>;

    async fn has_more_tasks(&self, _module: &str) -> Result<bool> {
        Ok(false)
    }

    async fn plan_progress(&self, module: &str) -> Result<PlanProgress>;
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn invoke(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ModelError>;
}

pub trait ModelSelector: Send + Sync {
    fn model_for_phase(&self, phase: WorkflowPhase) -> String;

    fn fallback_chain(&self, phase: WorkflowPhase) -> Vec<String>;
}

pub trait ToolRegistry: Send + Sync {
    fn tools_for_phase(&self, phase: WorkflowPhase) -> Vec<ToolDefinition>;
}

pub trait PromptBuilder: Send + Sync {
    fn build(&self, request: &PromptRequest) -> String;
}

#[async_trait]
pub trait OutputRenderer: Send + Sync {
    fn render_progress(&self, phase: WorkflowPhase, step: WorkflowStep, fraction: f64);

    fn render_error(&self, message: &str, cause: Option<&str>);

    fn render_result(&self, message: &str);

    /// Ask the operator a question. `None` means no answer (EOF or cancelled).
    async fn prompt(&self, message: &str, cancel: &CancellationToken) -> Option<String>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DriftService: Send + Sync {
    async fn detect(&self, module: &str, cancel: &CancellationToken) -> Result<DriftReport>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait GitWorkflowService: Send + Sync {
    /// Make sure the module branch exists; returns its name
    async fn ensure_module_branch(&self, module: &str) -> Result<String>;
}

#[async_trait]
pub trait SessionManager: Send + Sync {
    async fn create_or_resume(&self, module: &str) -> Result<String>;
}

#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
}

pub trait TokenTracker: Send + Sync {
    fn record(&self, usage: &TokenUsage);

    fn usage(&self) -> UsageTotals;
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn read(&self, module: &str) -> Result<Option<String>>;

    async fn append(&self, module: &str, text: &str) -> Result<()>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait BudgetEnforcer: Send + Sync {
    fn verdict(&self, cumulative_tokens: u64, premium_requests: u64) -> BudgetVerdict;
}
