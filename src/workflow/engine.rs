use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{WorkflowPhase, WorkflowStep, WorkflowTrigger};
use crate::collaborators::StateAssessor;

const MAX_HISTORY_ENTRIES: usize = 256;

/// Audit record of an accepted transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: WorkflowStep,
    pub trigger: WorkflowTrigger,
    pub to: WorkflowStep,
    pub timestamp: DateTime<Utc>,
}

/// Finite-state machine over the seven workflow steps.
///
/// The only way to change the current step is [`WorkflowEngine::fire`], which
/// consults [`WorkflowEngine::transition_target`]. Pairs that are not declared
/// there are rejected and leave the state untouched.
pub struct WorkflowEngine {
    assessor: Arc<dyn StateAssessor>,
    current_step: WorkflowStep,
    completed: bool,
    history: Vec<TransitionRecord>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("current_step", &self.current_step)
            .field("completed", &self.completed)
            .field("history", &self.history.len())
            .finish()
    }
}

impl WorkflowEngine {
    pub fn new(assessor: Arc<dyn StateAssessor>) -> Self {
        Self {
            assessor,
            current_step: WorkflowStep::DraftSpecification,
            completed: false,
            history: Vec::new(),
        }
    }

    /// The declared transition table
    pub fn transition_target(
        step: WorkflowStep,
        trigger: WorkflowTrigger,
    ) -> Option<WorkflowStep> {
        use WorkflowStep as S;
        use WorkflowTrigger as T;

        match (step, trigger) {
            (S::DraftSpecification, T::SpecApproved) => Some(S::DetermineDependencies),
            (S::DetermineDependencies, T::DependenciesDetermined) => Some(S::IdentifyComponents),
            (S::IdentifyComponents, T::ComponentsIdentified) => Some(S::SelectNextComponent),
            (S::SelectNextComponent, T::ComponentSelected) => Some(S::BreakIntoTasks),
            (S::SelectNextComponent, T::ModuleComplete) => Some(S::Repeat),
            (S::BreakIntoTasks, T::TasksBrokenDown) => Some(S::IterateThroughTasks),
            (S::IterateThroughTasks, T::ComponentComplete) => Some(S::Repeat),
            (S::IterateThroughTasks, T::TaskIterationComplete) => Some(S::IterateThroughTasks),
            (S::Repeat, T::Assess) => Some(S::SelectNextComponent),
            _ => None,
        }
    }

    /// Re-derive the current step from the module's artifacts.
    ///
    /// Whatever was in memory before is discarded; the assessor is the source
    /// of truth. If it cannot answer, the engine restarts at the specification
    /// step, which is always safe to re-enter.
    pub async fn initialize(&mut self, module: &str) {
        let assessed = match self.assessor.current_step(module).await {
            Ok(step) => step,
            Err(e) => {
                warn!(
                    module = %module,
                    error = %e,
                    "State assessment failed, restarting at specification step"
                );
                WorkflowStep::DraftSpecification
            }
        };

        if assessed != self.current_step {
            debug!(
                module = %module,
                previous = %self.current_step,
                assessed = %assessed,
                "Assessed step differs from in-memory step"
            );
        }

        self.current_step = assessed;
        self.completed = false;

        info!(
            module = %module,
            step = %self.current_step,
            phase = %self.current_phase(),
            "Workflow engine initialized"
        );
    }

    /// Attempt a transition. Returns false when the pair is not declared.
    pub fn fire(&mut self, trigger: WorkflowTrigger) -> bool {
        let from = self.current_step;
        let Some(to) = Self::transition_target(from, trigger) else {
            warn!(
                step = %from,
                trigger = %trigger,
                "Rejected undeclared workflow transition"
            );
            return false;
        };

        if trigger == WorkflowTrigger::ModuleComplete {
            self.completed = true;
        }
        self.current_step = to;
        self.record_transition(from, trigger, to);
        true
    }

    fn record_transition(&mut self, from: WorkflowStep, trigger: WorkflowTrigger, to: WorkflowStep) {
        let record = TransitionRecord {
            from,
            trigger,
            to,
            timestamp: Utc::now(),
        };

        info!(
            from_step = %record.from,
            trigger = %record.trigger,
            to_step = %record.to,
            completed = self.completed,
            "Workflow state transition"
        );

        if self.history.len() >= MAX_HISTORY_ENTRIES {
            self.history.remove(0);
        }
        self.history.push(record);
    }

    /// Triggers that [`fire`](Self::fire) would accept right now
    pub fn permitted_triggers(&self) -> Vec<WorkflowTrigger> {
        WorkflowTrigger::ALL
            .iter()
            .copied()
            .filter(|t| Self::transition_target(self.current_step, *t).is_some())
            .collect()
    }

    pub fn current_step(&self) -> WorkflowStep {
        self.current_step
    }

    pub fn current_phase(&self) -> WorkflowPhase {
        self.current_step.phase()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }
}
