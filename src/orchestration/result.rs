use serde::{Deserialize, Serialize};

use crate::workflow::{WorkflowStep, WorkflowTrigger};

pub const REASON_CANCELLED: &str = "Cancelled";
pub const REASON_CONFIRMATION_REQUIRED: &str = "User confirmation required";

/// Outcome of executing one workflow step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub success: bool,
    pub next_trigger: Option<WorkflowTrigger>,
    pub summary: Option<String>,
    pub requires_user_confirmation: bool,
    pub is_critical_error: bool,
}

impl StepResult {
    pub fn succeeded(next_trigger: WorkflowTrigger, summary: impl Into<String>) -> Self {
        Self {
            success: true,
            next_trigger: Some(next_trigger),
            summary: Some(summary.into()),
            requires_user_confirmation: false,
            is_critical_error: false,
        }
    }

    pub fn needs_confirmation(message: impl Into<String>) -> Self {
        Self {
            success: true,
            next_trigger: None,
            summary: Some(message.into()),
            requires_user_confirmation: true,
            is_critical_error: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            next_trigger: None,
            summary: Some(message.into()),
            requires_user_confirmation: false,
            is_critical_error: false,
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            is_critical_error: true,
            ..Self::failed(message)
        }
    }

    pub fn message(&self) -> &str {
        self.summary.as_deref().unwrap_or("")
    }
}

/// Terminal result of a run; callers decide exit behavior from these fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub is_complete: bool,
    pub iteration_count: u32,
    pub final_step: WorkflowStep,
    pub was_interrupted: bool,
    pub interruption_reason: Option<String>,
    pub is_critical_error: bool,
}

impl OrchestrationResult {
    pub fn completed(iteration_count: u32, final_step: WorkflowStep) -> Self {
        Self {
            is_complete: true,
            iteration_count,
            final_step,
            was_interrupted: false,
            interruption_reason: None,
            is_critical_error: false,
        }
    }

    pub fn interrupted(
        iteration_count: u32,
        final_step: WorkflowStep,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            is_complete: false,
            iteration_count,
            final_step,
            was_interrupted: true,
            interruption_reason: Some(reason.into()),
            is_critical_error: false,
        }
    }

    pub fn critical(iteration_count: u32, final_step: WorkflowStep, reason: impl Into<String>) -> Self {
        Self {
            is_critical_error: true,
            ..Self::interrupted(iteration_count, final_step, reason)
        }
    }

    pub fn cancelled(iteration_count: u32, final_step: WorkflowStep) -> Self {
        Self::interrupted(iteration_count, final_step, REASON_CANCELLED)
    }
}
