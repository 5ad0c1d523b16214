//! Workflow position derived from the module's specification and plan files.
//!
//! The specification lives at `<spec_dir>/<module>.md` and is approved once it
//! carries the [`APPROVAL_MARKER`]. The plan at `<plan_dir>/<module>.plan.md`
//! is a markdown document the agent grows step by step:
//!
//! ```text
//! ## Dependencies
//! - serde for the wire format
//!
//! ## Components
//! - [x] component: parser
//! - [~] component: evaluator
//! - [ ] component: cli
//!
//! - [x] task(evaluator): constant folding
//! - [ ] task(evaluator): variable lookup
//! ```
//!
//! `[~]` marks the component currently being built.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{LazyLock, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{DriftReport, DriftService, PlanProgress, StateAssessor};
use crate::persistence::{self, FilePlanStore};
use crate::workflow::WorkflowStep;

pub const APPROVAL_MARKER: &str = "<!-- spec:approved -->";
const DEPENDENCIES_HEADING: &str = "## Dependencies";
const COMPONENTS_HEADING: &str = "## Components";
const STEP_HINT_FILE: &str = "step.hint";

static COMPONENT_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*[-*] \[([ xX~])\] component:\s*(.+?)\s*$").ok());
static TASK_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*[-*] \[([ xX])\] task\(([^)]+)\):\s*(.+?)\s*$").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentStatus {
    Pending,
    Selected,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedComponent {
    pub name: String,
    pub status: ComponentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTask {
    pub component: String,
    pub description: String,
    pub done: bool,
}

/// What the plan document says so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSnapshot {
    pub has_dependencies: bool,
    pub has_components: bool,
    pub components: Vec<PlannedComponent>,
    pub tasks: Vec<PlannedTask>,
}

impl PlanSnapshot {
    pub fn parse(plan: &str) -> Self {
        let mut snapshot = PlanSnapshot::default();

        for line in plan.lines() {
            let trimmed = line.trim();
            if trimmed.eq_ignore_ascii_case(DEPENDENCIES_HEADING) {
                snapshot.has_dependencies = true;
                continue;
            }
            if trimmed.eq_ignore_ascii_case(COMPONENTS_HEADING) {
                snapshot.has_components = true;
                continue;
            }

            if let Some(caps) = COMPONENT_LINE.as_ref().and_then(|re| re.captures(line)) {
                let status = match &caps[1] {
                    "~" => ComponentStatus::Selected,
                    "x" | "X" => ComponentStatus::Done,
                    _ => ComponentStatus::Pending,
                };
                snapshot.components.push(PlannedComponent {
                    name: caps[2].to_string(),
                    status,
                });
                continue;
            }

            if let Some(caps) = TASK_LINE.as_ref().and_then(|re| re.captures(line)) {
                snapshot.tasks.push(PlannedTask {
                    component: caps[2].trim().to_string(),
                    description: caps[3].to_string(),
                    done: &caps[1] != " ",
                });
            }
        }

        snapshot
    }

    pub fn selected_component(&self) -> Option<&PlannedComponent> {
        self.components
            .iter()
            .find(|c| c.status == ComponentStatus::Selected)
    }

    pub fn tasks_for<'a>(&'a self, component: &'a str) -> impl Iterator<Item = &'a PlannedTask> + 'a {
        self.tasks.iter().filter(move |t| t.component == component)
    }

    pub fn has_unfinished_components(&self) -> bool {
        self.components
            .iter()
            .any(|c| c.status != ComponentStatus::Done)
    }

    /// Pending tasks of the selected component, or of any component if none
    /// is selected
    pub fn has_pending_tasks(&self) -> bool {
        match self.selected_component() {
            Some(component) => self.tasks_for(&component.name).any(|t| !t.done),
            None => self.tasks.iter().any(|t| !t.done),
        }
    }

    pub fn progress(&self) -> PlanProgress {
        let has_tasks = match self.selected_component() {
            Some(component) => self.tasks_for(&component.name).next().is_some(),
            None => !self.tasks.is_empty(),
        };
        PlanProgress {
            has_components: !self.components.is_empty(),
            has_tasks,
            all_tasks_done: self.tasks.iter().all(|t| t.done),
        }
    }

    /// Step to resume at, given an approved specification
    pub fn planning_step(&self) -> WorkflowStep {
        if !self.has_dependencies {
            return WorkflowStep::DetermineDependencies;
        }
        if !self.has_components {
            return WorkflowStep::IdentifyComponents;
        }
        let Some(selected) = self.selected_component() else {
            return WorkflowStep::SelectNextComponent;
        };

        let mut tasks = self.tasks_for(&selected.name).peekable();
        if tasks.peek().is_none() {
            WorkflowStep::BreakIntoTasks
        } else if tasks.any(|t| !t.done) {
            WorkflowStep::IterateThroughTasks
        } else {
            WorkflowStep::Repeat
        }
    }
}

/// [`StateAssessor`] backed by the files an agent edits
#[derive(Debug, Clone)]
pub struct ArtifactStateAssessor {
    spec_dir: PathBuf,
    state_dir: PathBuf,
    plans: FilePlanStore,
}

impl ArtifactStateAssessor {
    pub fn new(spec_dir: impl Into<PathBuf>, plan_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            spec_dir: spec_dir.into(),
            state_dir: state_dir.into(),
            plans: FilePlanStore::new(plan_dir),
        }
    }

    pub fn spec_path(&self, module: &str) -> Result<PathBuf> {
        persistence::validate_module(module)?;
        Ok(self.spec_dir.join(format!("{module}.md")))
    }

    fn hint_path(&self, module: &str) -> Result<PathBuf> {
        persistence::validate_module(module)?;
        Ok(self.state_dir.join(module).join(STEP_HINT_FILE))
    }

    async fn read_spec(&self, module: &str) -> Result<Option<String>> {
        Ok(persistence::read_optional(&self.spec_path(module)?).await?)
    }

    pub async fn plan_snapshot(&self, module: &str) -> Result<PlanSnapshot> {
        let plan = self.plans.read_plan(module).await?.unwrap_or_default();
        Ok(PlanSnapshot::parse(&plan))
    }

    pub async fn is_approved(&self, module: &str) -> Result<bool> {
        Ok(self
            .read_spec(module)
            .await?
            .is_some_and(|spec| spec.contains(APPROVAL_MARKER)))
    }

    /// Mark the specification approved. Returns false if it already was.
    pub async fn approve(&self, module: &str) -> Result<bool> {
        let path = self.spec_path(module)?;
        let Some(mut spec) = self.read_spec(module).await? else {
            return Err(anyhow!(
                "No specification for module '{module}' at {}",
                path.display()
            ));
        };
        if spec.contains(APPROVAL_MARKER) {
            return Ok(false);
        }

        if !spec.ends_with('\n') {
            spec.push('\n');
        }
        spec.push_str(APPROVAL_MARKER);
        spec.push('\n');
        persistence::write_atomic(&path, spec.as_bytes()).await?;

        info!(module = %module, file = ?path, "Specification approved");
        Ok(true)
    }

    pub async fn read_step_hint(&self, module: &str) -> Result<Option<WorkflowStep>> {
        let hint = persistence::read_optional(&self.hint_path(module)?).await?;
        Ok(hint.and_then(|h| WorkflowStep::parse(h.trim())))
    }
}

#[async_trait]
impl StateAssessor for ArtifactStateAssessor {
    async fn current_step(&self, module: &str) -> Result<WorkflowStep> {
        let approved = self.is_approved(module).await?;
        let step = if approved {
            self.plan_snapshot(module).await?.planning_step()
        } else {
            WorkflowStep::DraftSpecification
        };
        debug!(module = %module, approved, step = %step, "Assessed workflow step");
        Ok(step)
    }

    async fn persist_step_hint(&self, module: &str, step: WorkflowStep) -> Result<()> {
        let path = self.hint_path(module)?;
        persistence::write_atomic(&path, format!("{}\n", step.name()).as_bytes()).await?;
        Ok(())
    }

    async fn is_specification_ready(&self, module: &str) -> Result<bool> {
        Ok(self
            .read_spec(module)
            .await?
            .is_some_and(|spec| !spec.trim().is_empty()))
    }

    async fn has_more_components(&self, module: &str) -> Result<bool> {
        Ok(self.plan_snapshot(module).await?.has_unfinished_components())
    }

    async fn has_more_tasks(&self, module: &str) -> Result<bool> {
        Ok(self.plan_snapshot(module).await?.has_pending_tasks())
    }

    async fn plan_progress(&self, module: &str) -> Result<PlanProgress> {
        Ok(self.plan_snapshot(module).await?.progress())
    }
}

fn section_hashes(spec: &str) -> BTreeMap<String, u64> {
    let mut sections = BTreeMap::new();
    let mut current: Option<(String, DefaultHasher)> = None;

    for line in spec.lines() {
        if let Some(title) = line.strip_prefix("## ") {
            if let Some((name, hasher)) = current.take() {
                sections.insert(name, hasher.finish());
            }
            current = Some((title.trim().to_string(), DefaultHasher::new()));
        } else if let Some((_, hasher)) = current.as_mut() {
            if line.trim() != APPROVAL_MARKER {
                line.trim_end().hash(hasher);
            }
        }
    }
    if let Some((name, hasher)) = current {
        sections.insert(name, hasher.finish());
    }

    sections
}

/// Compares `## ` sections of the specification against the previous check.
/// The first check for a module only records a baseline.
#[derive(Debug)]
pub struct SpecDriftDetector {
    spec_dir: PathBuf,
    snapshots: Mutex<HashMap<String, BTreeMap<String, u64>>>,
}

impl SpecDriftDetector {
    pub fn new(spec_dir: impl Into<PathBuf>) -> Self {
        Self {
            spec_dir: spec_dir.into(),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    fn compare(&self, module: &str, current: BTreeMap<String, u64>) -> DriftReport {
        let mut snapshots = self
            .snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some(previous) = snapshots.insert(module.to_string(), current.clone()) else {
            return DriftReport::default();
        };

        let mut report = DriftReport::default();
        for (name, hash) in &current {
            match previous.get(name) {
                Some(old) if old != hash => report.changed.push(name.clone()),
                Some(_) => {}
                None => report.added.push(name.clone()),
            }
        }
        report.removed = previous
            .keys()
            .filter(|name| !current.contains_key(*name))
            .cloned()
            .collect();
        report
    }
}

#[async_trait]
impl DriftService for SpecDriftDetector {
    async fn detect(&self, module: &str, cancel: &CancellationToken) -> Result<DriftReport> {
        persistence::validate_module(module)?;
        let path = self.spec_dir.join(format!("{module}.md"));

        let spec = tokio::select! {
            _ = cancel.cancelled() => return Ok(DriftReport::default()),
            spec = persistence::read_optional(&path) => spec?,
        };

        let Some(spec) = spec else {
            return Ok(DriftReport::default());
        };
        let report = self.compare(module, section_hashes(&spec));
        if !report.is_empty() {
            debug!(module = %module, report = ?report, "Specification drift detected");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PLAN: &str = "\
## Dependencies
- tokio

## Components
- [x] component: parser
- [~] component: evaluator
- [ ] component: cli

- [x] task(parser): tokenizer
- [x] task(evaluator): constant folding
- [ ] task(evaluator): variable lookup
";

    #[test]
    fn test_parse_plan() {
        let snapshot = PlanSnapshot::parse(PLAN);
        assert!(snapshot.has_dependencies && snapshot.has_components);
        assert_eq!(snapshot.components.len(), 3);
        assert_eq!(
            snapshot.selected_component().map(|c| c.name.as_str()),
            Some("evaluator")
        );
        assert_eq!(snapshot.tasks_for("evaluator").count(), 2);
        assert!(snapshot.has_pending_tasks());
        assert!(snapshot.has_unfinished_components());
        assert_eq!(snapshot.planning_step(), WorkflowStep::IterateThroughTasks);
    }

    #[test]
    fn test_planning_step_progression() {
        assert_eq!(PlanSnapshot::parse("").planning_step(), WorkflowStep::DetermineDependencies);
        assert_eq!(
            PlanSnapshot::parse("## Dependencies\n").planning_step(),
            WorkflowStep::IdentifyComponents
        );
        assert_eq!(
            PlanSnapshot::parse("## Dependencies\n## Components\n- [ ] component: a\n").planning_step(),
            WorkflowStep::SelectNextComponent
        );
        assert_eq!(
            PlanSnapshot::parse("## Dependencies\n## Components\n- [~] component: a\n").planning_step(),
            WorkflowStep::BreakIntoTasks
        );
        assert_eq!(
            PlanSnapshot::parse(
                "## Dependencies\n## Components\n- [~] component: a\n- [x] task(a): done\n"
            )
            .planning_step(),
            WorkflowStep::Repeat
        );
    }

    #[test]
    fn test_all_done_means_no_more_components() {
        let snapshot = PlanSnapshot::parse("## Dependencies\n## Components\n- [x] component: a\n");
        assert!(!snapshot.has_unfinished_components());
        assert_eq!(snapshot.planning_step(), WorkflowStep::SelectNextComponent);
    }

    #[test]
    fn test_plan_progress() {
        let progress = PlanSnapshot::parse(PLAN).progress();
        assert_eq!(
            progress,
            PlanProgress {
                has_components: true,
                has_tasks: true,
                all_tasks_done: false,
            }
        );

        let untasked = PlanSnapshot::parse(
            "## Dependencies\n## Components\n- [x] component: a\n- [~] component: b\n- [x] task(a): done\n",
        )
        .progress();
        assert!(untasked.has_components);
        assert!(!untasked.has_tasks);
        assert!(untasked.all_tasks_done);

        assert!(!PlanSnapshot::parse("").progress().has_components);
    }

    #[tokio::test]
    async fn test_assessor_reads_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let specs = temp_dir.path().join("specs");
        let plans = temp_dir.path().join("plans");
        std::fs::create_dir_all(&specs).unwrap();
        std::fs::create_dir_all(&plans).unwrap();
        let assessor = ArtifactStateAssessor::new(&specs, &plans, temp_dir.path().join("state"));

        assert_eq!(
            assessor.current_step("billing").await.unwrap(),
            WorkflowStep::DraftSpecification
        );
        assert!(!assessor.is_specification_ready("billing").await.unwrap());
        assert!(assessor.approve("billing").await.is_err());

        std::fs::write(specs.join("billing.md"), "# Billing\n## Scope\nInvoices\n").unwrap();
        assert!(assessor.is_specification_ready("billing").await.unwrap());
        assert_eq!(
            assessor.current_step("billing").await.unwrap(),
            WorkflowStep::DraftSpecification
        );

        assert!(assessor.approve("billing").await.unwrap());
        assert!(!assessor.approve("billing").await.unwrap());
        assert_eq!(
            assessor.current_step("billing").await.unwrap(),
            WorkflowStep::DetermineDependencies
        );

        std::fs::write(plans.join("billing.plan.md"), PLAN).unwrap();
        assert_eq!(
            assessor.current_step("billing").await.unwrap(),
            WorkflowStep::IterateThroughTasks
        );
        assert!(assessor.has_more_tasks("billing").await.unwrap());
    }

    #[tokio::test]
    async fn test_step_hint_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let assessor = ArtifactStateAssessor::new(
            temp_dir.path(),
            temp_dir.path(),
            temp_dir.path().join("state"),
        );
        assert_eq!(assessor.read_step_hint("billing").await.unwrap(), None);
        assessor
            .persist_step_hint("billing", WorkflowStep::BreakIntoTasks)
            .await
            .unwrap();
        assert_eq!(
            assessor.read_step_hint("billing").await.unwrap(),
            Some(WorkflowStep::BreakIntoTasks)
        );
    }

    #[tokio::test]
    async fn test_drift_detection() {
        let temp_dir = TempDir::new().unwrap();
        let spec = temp_dir.path().join("billing.md");
        let detector = SpecDriftDetector::new(temp_dir.path());
        let cancel = CancellationToken::new();

        assert!(detector.detect("billing", &cancel).await.unwrap().is_empty());

        std::fs::write(&spec, "## Scope\nInvoices\n## Limits\nNone\n").unwrap();
        assert!(detector.detect("billing", &cancel).await.unwrap().is_empty());

        std::fs::write(
            &spec,
            format!("## Scope\nInvoices and refunds\n## Security\nTLS\n{APPROVAL_MARKER}\n"),
        )
        .unwrap();
        let report = detector.detect("billing", &cancel).await.unwrap();
        assert_eq!(report.changed, vec!["Scope"]);
        assert_eq!(report.added, vec!["Security"]);
        assert_eq!(report.removed, vec!["Limits"]);

        assert!(detector.detect("billing", &cancel).await.unwrap().is_empty());
    }

    #[test]
    fn test_approval_marker_does_not_count_as_drift() {
        let before = section_hashes("## Scope\nInvoices\n");
        let after = section_hashes(&format!("## Scope\nInvoices\n{APPROVAL_MARKER}\n"));
        assert_eq!(before, after);
    }
}
