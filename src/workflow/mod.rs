//! Workflow model for a single module session
//!
//! A module moves through seven steps grouped into three phases:
//!
//! - **RequirementGathering**: drafting the specification (human gated)
//! - **Planning**: dependencies, components, component selection, task breakdown
//! - **Building**: iterating through tasks and repeating for the next component
//!
//! The [`engine::WorkflowEngine`] owns the current step and only moves along the
//! declared transition table. The [`transitions::PhaseTransitionController`]
//! tracks the specification approval gate.

pub mod engine;
pub mod transitions;

pub use engine::{TransitionRecord, WorkflowEngine};
pub use transitions::{PhaseReadiness, PhaseTransitionController};

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of the module workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowStep {
    DraftSpecification,
    DetermineDependencies,
    IdentifyComponents,
    SelectNextComponent,
    BreakIntoTasks,
    IterateThroughTasks,
    Repeat,
}

impl WorkflowStep {
    pub const ALL: [WorkflowStep; 7] = [
        WorkflowStep::DraftSpecification,
        WorkflowStep::DetermineDependencies,
        WorkflowStep::IdentifyComponents,
        WorkflowStep::SelectNextComponent,
        WorkflowStep::BreakIntoTasks,
        WorkflowStep::IterateThroughTasks,
        WorkflowStep::Repeat,
    ];

    /// Phase this step belongs to
    pub fn phase(self) -> WorkflowPhase {
        match self {
            WorkflowStep::DraftSpecification => WorkflowPhase::RequirementGathering,
            WorkflowStep::DetermineDependencies
            | WorkflowStep::IdentifyComponents
            | WorkflowStep::SelectNextComponent
            | WorkflowStep::BreakIntoTasks => WorkflowPhase::Planning,
            WorkflowStep::IterateThroughTasks | WorkflowStep::Repeat => WorkflowPhase::Building,
        }
    }

    /// Stable name, also used as the failure-tracking task id
    pub fn name(self) -> &'static str {
        match self {
            WorkflowStep::DraftSpecification => "DraftSpecification",
            WorkflowStep::DetermineDependencies => "DetermineDependencies",
            WorkflowStep::IdentifyComponents => "IdentifyComponents",
            WorkflowStep::SelectNextComponent => "SelectNextComponent",
            WorkflowStep::BreakIntoTasks => "BreakIntoTasks",
            WorkflowStep::IterateThroughTasks => "IterateThroughTasks",
            WorkflowStep::Repeat => "Repeat",
        }
    }

    /// Rough position in the loop, used for progress rendering
    pub fn progress_fraction(self) -> f64 {
        let position = Self::ALL.iter().position(|s| *s == self).unwrap_or(0);
        (position + 1) as f64 / Self::ALL.len() as f64
    }

    pub fn parse(value: &str) -> Option<WorkflowStep> {
        Self::ALL
            .iter()
            .copied()
            .find(|step| step.name().eq_ignore_ascii_case(value.trim()))
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Event that attempts a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowTrigger {
    Assess,
    SpecApproved,
    DependenciesDetermined,
    ComponentsIdentified,
    ComponentSelected,
    TasksBrokenDown,
    TaskIterationComplete,
    ComponentComplete,
    ModuleComplete,
}

impl WorkflowTrigger {
    pub const ALL: [WorkflowTrigger; 9] = [
        WorkflowTrigger::Assess,
        WorkflowTrigger::SpecApproved,
        WorkflowTrigger::DependenciesDetermined,
        WorkflowTrigger::ComponentsIdentified,
        WorkflowTrigger::ComponentSelected,
        WorkflowTrigger::TasksBrokenDown,
        WorkflowTrigger::TaskIterationComplete,
        WorkflowTrigger::ComponentComplete,
        WorkflowTrigger::ModuleComplete,
    ];
}

impl fmt::Display for WorkflowTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Coarse grouping of steps, always derived from the current step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowPhase {
    RequirementGathering,
    Planning,
    Building,
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkflowPhase::RequirementGathering => "Requirement Gathering",
            WorkflowPhase::Planning => "Planning",
            WorkflowPhase::Building => "Building",
        };
        f.write_str(label)
    }
}
