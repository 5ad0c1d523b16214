//! Configuration-driven implementations of the smaller collaborator traits

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use super::{
    BudgetEnforcer, BudgetStatus, BudgetVerdict, ModelSelector, PromptBuilder, PromptRequest,
    TokenTracker, TokenUsage, ToolDefinition, ToolRegistry, UsageTotals,
};
use crate::config::{BudgetConfig, ModelsConfig};
use crate::workflow::{WorkflowPhase, WorkflowStep};

/// Models straight from the `[models]` config section
#[derive(Debug, Clone)]
pub struct ConfiguredModelSelector {
    models: ModelsConfig,
}

impl ConfiguredModelSelector {
    pub fn new(models: ModelsConfig) -> Self {
        Self { models }
    }
}

impl ModelSelector for ConfiguredModelSelector {
    fn model_for_phase(&self, phase: WorkflowPhase) -> String {
        self.models.for_phase(phase).primary.clone()
    }

    fn fallback_chain(&self, phase: WorkflowPhase) -> Vec<String> {
        self.models.for_phase(phase).fallbacks.clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticToolRegistry {
    tools: HashMap<WorkflowPhase, Vec<ToolDefinition>>,
}

fn tool(name: &str, description: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
    }
}

impl StaticToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only tools while gathering requirements and planning; edit and
    /// shell access only while building
    pub fn standard() -> Self {
        let read = [
            tool("read_file", "Read a file from the workspace"),
            tool("search", "Search the workspace for a pattern"),
        ];
        let write = tool("write_file", "Create or overwrite a file in the workspace");

        Self::new()
            .with_tools(
                WorkflowPhase::RequirementGathering,
                read.iter().cloned().chain([write.clone()]).collect(),
            )
            .with_tools(
                WorkflowPhase::Planning,
                read.iter().cloned().chain([write.clone()]).collect(),
            )
            .with_tools(
                WorkflowPhase::Building,
                read.iter()
                    .cloned()
                    .chain([
                        write,
                        tool("edit_file", "Apply an edit to an existing file"),
                        tool("run_command", "Run a shell command such as the test suite"),
                    ])
                    .collect(),
            )
    }

    pub fn with_tools(mut self, phase: WorkflowPhase, tools: Vec<ToolDefinition>) -> Self {
        self.tools.insert(phase, tools);
        self
    }
}

impl ToolRegistry for StaticToolRegistry {
    fn tools_for_phase(&self, phase: WorkflowPhase) -> Vec<ToolDefinition> {
        self.tools.get(&phase).cloned().unwrap_or_default()
    }
}

/// Step instructions that tell the agent which files and markers to maintain
#[derive(Debug, Clone)]
pub struct TemplatePromptBuilder {
    spec_dir: String,
    plan_dir: String,
}

impl TemplatePromptBuilder {
    pub fn new(spec_dir: impl Into<String>, plan_dir: impl Into<String>) -> Self {
        Self {
            spec_dir: spec_dir.into(),
            plan_dir: plan_dir.into(),
        }
    }

    fn instruction(&self, step: WorkflowStep, module: &str) -> String {
        let spec = format!("{}/{module}.md", self.spec_dir);
        let plan = format!("{}/{module}.plan.md", self.plan_dir);
        match step {
            WorkflowStep::DraftSpecification => format!(
                "Draft or refine the specification for module '{module}' in {spec}. \
                 Organize it into '## ' sections. Do not mark it approved; a human reviews it."
            ),
            WorkflowStep::DetermineDependencies => format!(
                "Read {spec} and determine the external dependencies module '{module}' needs. \
                 Record them under a '## Dependencies' heading in {plan}."
            ),
            WorkflowStep::IdentifyComponents => format!(
                "Break module '{module}' into components. Add a '## Components' heading to {plan} \
                 with one line per component: '- [ ] component: <name>'."
            ),
            WorkflowStep::SelectNextComponent => format!(
                "Pick the next unbuilt component in {plan} and mark it in progress by changing \
                 its line to '- [~] component: <name>'."
            ),
            WorkflowStep::BreakIntoTasks => format!(
                "Break the in-progress component of {plan} into small tasks. Reply with one line \
                 per task: '- [ ] task(<component>): <description>'."
            ),
            WorkflowStep::IterateThroughTasks => format!(
                "Implement the next unchecked task of the in-progress component in {plan}, run \
                 the tests, and check it off as '- [x] task(<component>): ...' when it passes."
            ),
            WorkflowStep::Repeat => format!(
                "Verify the in-progress component of module '{module}' against {spec}. When it \
                 is complete mark it '- [x] component: <name>' in {plan}."
            ),
        }
    }
}

impl PromptBuilder for TemplatePromptBuilder {
    fn build(&self, request: &PromptRequest) -> String {
        let mut prompt = format!(
            "Phase: {}\nStep: {}\nModule: {}\n",
            request.phase, request.step, request.module
        );
        if let Some(component) = &request.component {
            prompt.push_str(&format!("Component: {component}\n"));
        }
        if let Some(task) = &request.task {
            prompt.push_str(&format!("Task: {task}\n"));
        }
        prompt.push('\n');
        prompt.push_str(&self.instruction(request.step, &request.module));
        if let Some(context) = request.extra_context.as_deref().filter(|c| !c.trim().is_empty()) {
            prompt.push_str("\n\nAdditional context from the operator:\n");
            prompt.push_str(context.trim());
        }
        prompt.push('\n');
        prompt
    }
}

/// Running token totals for the process
#[derive(Debug, Default)]
pub struct InMemoryTokenTracker {
    pub total_tokens: AtomicU64,
    pub premium_requests: AtomicU64,
    pub requests: AtomicU64,
}

impl InMemoryTokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_stats(&self) {
        info!(
            "Token usage: requests={}, total_tokens={}, premium_requests={}",
            self.requests.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
            self.premium_requests.load(Ordering::Relaxed)
        );
    }
}

impl TokenTracker for InMemoryTokenTracker {
    fn record(&self, usage: &TokenUsage) {
        let total = if usage.total > 0 {
            usage.total
        } else {
            usage.input.saturating_add(usage.output)
        };
        self.total_tokens.fetch_add(total, Ordering::Relaxed);
        self.requests.fetch_add(1, Ordering::Relaxed);
        if usage.is_premium {
            self.premium_requests.fetch_add(1, Ordering::Relaxed);
        }
        if usage.context_window > 0 && usage.input > usage.context_window * 9 / 10 {
            warn!(
                input_tokens = usage.input,
                context_window = usage.context_window,
                "Prompt is close to the model's context window"
            );
        }
    }

    fn usage(&self) -> UsageTotals {
        UsageTotals {
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            premium_requests: self.premium_requests.load(Ordering::Relaxed),
        }
    }
}

/// Verdicts from the fixed thresholds of the `[budget]` config section
#[derive(Debug, Clone)]
pub struct ThresholdBudgetEnforcer {
    limits: BudgetConfig,
}

impl ThresholdBudgetEnforcer {
    pub fn new(limits: BudgetConfig) -> Self {
        Self { limits }
    }
}

impl BudgetEnforcer for ThresholdBudgetEnforcer {
    fn verdict(&self, cumulative_tokens: u64, premium_requests: u64) -> BudgetVerdict {
        let limits = &self.limits;

        if cumulative_tokens >= limits.max_tokens {
            return BudgetVerdict::new(
                BudgetStatus::Exceeded,
                format!(
                    "Token budget exhausted: {cumulative_tokens} of {} tokens used.",
                    limits.max_tokens
                ),
            );
        }
        if premium_requests >= limits.max_premium_requests {
            return BudgetVerdict::new(
                BudgetStatus::Exceeded,
                format!(
                    "Premium request budget exhausted: {premium_requests} of {} used.",
                    limits.max_premium_requests
                ),
            );
        }
        if cumulative_tokens >= limits.confirm_tokens {
            return BudgetVerdict::new(
                BudgetStatus::ConfirmationRequired,
                format!(
                    "{cumulative_tokens} tokens used, past the confirmation threshold of {}.",
                    limits.confirm_tokens
                ),
            );
        }
        if cumulative_tokens >= limits.warn_tokens {
            return BudgetVerdict::new(
                BudgetStatus::Warning,
                format!("{cumulative_tokens} tokens used of {}.", limits.max_tokens),
            );
        }
        BudgetVerdict::ok()
    }
}
