use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{error, info, warn};

use crate::errors::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureSeverity {
    Warning,
    TaskFailure,
    RepeatedFailure,
    Critical,
}

/// What the loop should do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscalationAction {
    /// Keep looping; the next attempt gets another chance
    SelfCorrect,
    /// Ask a human whether to keep going
    PromptUser,
    /// Stop the run
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureClassification {
    pub severity: FailureSeverity,
    pub action: EscalationAction,
    pub message: String,
    pub task_id: Option<String>,
    pub consecutive_failures: u32,
}

/// Consecutive-failure counters per task, turned into escalation verdicts.
///
/// Counters are only touched by the control loop that owns the handler, so
/// there is no locking. Sharing one handler across concurrent module runs
/// would require per-key synchronization.
#[derive(Debug, Clone)]
pub struct FailureHandler {
    threshold: u32,
    counters: HashMap<String, u32>,
}

impl FailureHandler {
    pub fn new(threshold: u32) -> Result<Self, OrchestratorError> {
        if threshold == 0 {
            return Err(OrchestratorError::InvalidArgument(
                "failure threshold must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            threshold,
            counters: HashMap::new(),
        })
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn failure_count(&self, task_id: &str) -> u32 {
        self.counters.get(task_id).copied().unwrap_or(0)
    }

    pub fn record_failure(&mut self, task_id: &str, message: &str) -> FailureClassification {
        let count = self.counters.entry(task_id.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        let consecutive_failures = *count;

        let (severity, action) = if consecutive_failures >= self.threshold {
            (FailureSeverity::RepeatedFailure, EscalationAction::PromptUser)
        } else {
            (FailureSeverity::TaskFailure, EscalationAction::SelfCorrect)
        };

        warn!(
            task_id = %task_id,
            consecutive_failures,
            threshold = self.threshold,
            severity = ?severity,
            "Task failure recorded"
        );

        FailureClassification {
            severity,
            action,
            message: message.to_string(),
            task_id: Some(task_id.to_string()),
            consecutive_failures,
        }
    }

    pub fn reset_failure_count(&mut self, task_id: &str) {
        if self.counters.remove(task_id).is_some() {
            info!(task_id = %task_id, "Failure counter reset");
        }
    }

    /// Critical failures stop the run regardless of any counter
    pub fn record_critical_error(&self, message: &str) -> FailureClassification {
        error!(message = %message, "Critical failure recorded");
        FailureClassification {
            severity: FailureSeverity::Critical,
            action: EscalationAction::Block,
            message: message.to_string(),
            task_id: None,
            consecutive_failures: 0,
        }
    }

    pub fn record_warning(&self, message: &str) -> FailureClassification {
        warn!(message = %message, "Warning recorded");
        FailureClassification {
            severity: FailureSeverity::Warning,
            action: EscalationAction::SelfCorrect,
            message: message.to_string(),
            task_id: None,
            consecutive_failures: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_threshold_is_rejected() {
        assert!(matches!(
            FailureHandler::new(0),
            Err(OrchestratorError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_escalates_at_threshold() {
        let mut handler = FailureHandler::new(3).unwrap();

        let first = handler.record_failure("t", "boom");
        let second = handler.record_failure("t", "boom");
        let other = handler.record_failure("u", "boom");
        let third = handler.record_failure("t", "boom");

        assert_eq!(
            [first.action, second.action, third.action],
            [
                EscalationAction::SelfCorrect,
                EscalationAction::SelfCorrect,
                EscalationAction::PromptUser
            ]
        );
        assert_eq!(
            [
                first.consecutive_failures,
                second.consecutive_failures,
                third.consecutive_failures
            ],
            [1, 2, 3]
        );
        assert_eq!(third.severity, FailureSeverity::RepeatedFailure);
        assert_eq!(other.consecutive_failures, 1);
        assert_eq!(other.action, EscalationAction::SelfCorrect);

        handler.reset_failure_count("t");
        assert_eq!(handler.record_failure("t", "boom").consecutive_failures, 1);
    }

    #[test]
    fn test_keeps_prompting_past_threshold() {
        let mut handler = FailureHandler::new(2).unwrap();
        handler.record_failure("t", "x");
        for expected in 2..6 {
            let classification = handler.record_failure("t", "x");
            assert_eq!(classification.action, EscalationAction::PromptUser);
            assert_eq!(classification.consecutive_failures, expected);
        }
    }

    #[test]
    fn test_critical_ignores_counters() {
        let mut handler = FailureHandler::new(100).unwrap();
        let before = handler.record_critical_error("disk gone");
        handler.record_failure("t", "x");
        handler.record_failure("t", "x");
        let after = handler.record_critical_error("disk gone");

        for classification in [before, after] {
            assert_eq!(classification.severity, FailureSeverity::Critical);
            assert_eq!(classification.action, EscalationAction::Block);
        }
        assert_eq!(handler.failure_count("t"), 2);
    }

    #[test]
    fn test_warning_is_self_correcting() {
        let handler = FailureHandler::new(1).unwrap();
        let warning = handler.record_warning("slow response");
        assert_eq!(warning.severity, FailureSeverity::Warning);
        assert_eq!(warning.action, EscalationAction::SelfCorrect);
        assert_eq!(handler.failure_count("slow response"), 0);
    }
}
