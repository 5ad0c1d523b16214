use tracing::info;

/// Latest verdicts of the advisory predicates, `None` until evaluated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseReadiness {
    pub building: Option<bool>,
    pub completion: Option<bool>,
}

/// Tracks the human gate between requirement gathering and planning, plus the
/// advisory predicates for the automatic phase changes.
#[derive(Debug, Default, Clone)]
pub struct PhaseTransitionController {
    specification_approved: bool,
}

impl PhaseTransitionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approve_specification(&mut self) {
        if !self.specification_approved {
            info!("Specification approved, planning may begin");
        }
        self.specification_approved = true;
    }

    pub fn reset_approval(&mut self) {
        self.specification_approved = false;
    }

    pub fn is_specification_approved(&self) -> bool {
        self.specification_approved
    }

    /// Planning is structurally complete once components and tasks exist
    pub fn can_auto_transition_to_building(&self, has_components: bool, has_tasks: bool) -> bool {
        has_components && has_tasks
    }

    pub fn can_auto_transition_to_complete(
        &self,
        all_built: bool,
        all_acceptance_criteria_passed: bool,
    ) -> bool {
        all_built && all_acceptance_criteria_passed
    }
}
