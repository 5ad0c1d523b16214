// File-backed collaborators wired into real orchestrator runs

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use phasewright::collaborators::{
    ArtifactStateAssessor, CheckpointTrigger, InMemoryTokenTracker, SpecDriftDetector,
    StateAssessor,
};
use phasewright::orchestration::REASON_CANCELLED;
use phasewright::testing::{RecordingRenderer, ScriptedModelClient, TestHarness};
use phasewright::{
    CoreServices, FilePlanStore, FileSessionStore, RunOptions, WorkflowOrchestrator, WorkflowStep,
};

const SPEC: &str = "# Billing\n\n## Scope\nInvoices and ledgers.\n\n<!-- spec:approved -->\n";
const PLAN: &str = "## Dependencies\n- serde\n\n## Components\n- [x] component: ledger\n- [~] component: invoices\n";

struct Workspace {
    _root: TempDir,
    specs: std::path::PathBuf,
    plans: std::path::PathBuf,
    state: std::path::PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let specs = root.path().join("specs");
        let plans = root.path().join("plans");
        let state = root.path().join("state");
        std::fs::create_dir_all(&specs).unwrap();
        std::fs::create_dir_all(&plans).unwrap();
        Self {
            _root: root,
            specs,
            plans,
            state,
        }
    }

    fn write(dir: &Path, file: &str, contents: &str) {
        std::fs::write(dir.join(file), contents).unwrap();
    }

    fn assessor(&self) -> Arc<ArtifactStateAssessor> {
        Arc::new(ArtifactStateAssessor::new(&self.specs, &self.plans, &self.state))
    }
}

/// Orchestrator over the workspace's files, with scripted model output
fn file_backed_orchestrator(
    workspace: &Workspace,
    assessor: Arc<ArtifactStateAssessor>,
    model_output: &str,
    options: RunOptions,
) -> (WorkflowOrchestrator, Arc<InMemoryTokenTracker>) {
    let harness = TestHarness::new(
        phasewright::testing::ScriptedAssessor::at(WorkflowStep::DraftSpecification),
        ScriptedModelClient::succeeding(model_output),
        RecordingRenderer::new(),
    );
    let services = CoreServices {
        assessor,
        ..harness.services
    };
    let sessions = Arc::new(FileSessionStore::new(&workspace.state));
    let tokens = Arc::new(InMemoryTokenTracker::new());

    let orchestrator = WorkflowOrchestrator::new(services, options)
        .unwrap()
        .with_session_manager(sessions.clone())
        .with_checkpoint_sink(sessions)
        .with_plan_store(Arc::new(FilePlanStore::new(&workspace.plans)))
        .with_drift_service(Arc::new(SpecDriftDetector::new(&workspace.specs)))
        .with_token_tracker(tokens.clone());
    (orchestrator, tokens)
}

#[tokio::test]
async fn test_run_persists_plan_hints_and_checkpoints() {
    let workspace = Workspace::new();
    Workspace::write(&workspace.specs, "billing.md", SPEC);
    Workspace::write(&workspace.plans, "billing.plan.md", PLAN);
    let assessor = workspace.assessor();
    assert_eq!(
        assessor.current_step("billing").await.unwrap(),
        WorkflowStep::BreakIntoTasks
    );

    let options = RunOptions {
        max_iterations: Some(3),
        ..RunOptions::default()
    };
    let (mut orchestrator, _tokens) = file_backed_orchestrator(
        &workspace,
        assessor.clone(),
        "- [x] task(invoices): render totals",
        options,
    );

    let result = orchestrator
        .run("billing", &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.was_interrupted);
    assert_eq!(result.final_step, WorkflowStep::SelectNextComponent);
    assert_eq!(orchestrator.readiness().building, Some(true));
    assert!(result
        .interruption_reason
        .as_deref()
        .unwrap()
        .contains("Iteration limit of 3"));

    let plan = std::fs::read_to_string(workspace.plans.join("billing.plan.md")).unwrap();
    assert!(plan.starts_with(PLAN));
    assert!(plan.contains("- [x] task(invoices): render totals"));
    assert_eq!(
        assessor.read_step_hint("billing").await.unwrap(),
        Some(WorkflowStep::SelectNextComponent)
    );
    assert_eq!(
        assessor.current_step("billing").await.unwrap(),
        WorkflowStep::Repeat
    );

    let sessions = FileSessionStore::new(&workspace.state);
    let session = sessions.load_session("billing").await.unwrap().unwrap();
    let checkpoints = sessions.list_checkpoints("billing").await.unwrap();
    let triggers: Vec<_> = checkpoints.iter().map(|c| c.checkpoint.trigger).collect();
    assert_eq!(
        triggers,
        vec![
            CheckpointTrigger::StepCompletion,
            CheckpointTrigger::PhaseTransition,
            CheckpointTrigger::StepCompletion,
            CheckpointTrigger::StepCompletion,
            CheckpointTrigger::PhaseTransition,
            CheckpointTrigger::TaskFailure,
        ]
    );
    assert_eq!(
        checkpoints.iter().map(|c| c.sequence).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5, 6]
    );
    assert!(checkpoints
        .iter()
        .all(|c| c.checkpoint.session_id == session.session_id));

    let latest = sessions.load_latest("billing").await.unwrap().unwrap();
    assert_eq!(latest.sequence, 6);
    assert_eq!(latest.checkpoint.step, WorkflowStep::SelectNextComponent);
    assert_eq!(latest.checkpoint.metrics.total_tokens, 300);
}

#[tokio::test]
async fn test_second_run_resumes_the_same_session() {
    let workspace = Workspace::new();
    Workspace::write(&workspace.specs, "billing.md", SPEC);
    Workspace::write(&workspace.plans, "billing.plan.md", PLAN);

    let cancel = CancellationToken::new();
    cancel.cancel();

    for _ in 0..2 {
        let (mut orchestrator, _) = file_backed_orchestrator(
            &workspace,
            workspace.assessor(),
            "",
            RunOptions::default(),
        );
        let result = orchestrator.run("billing", &cancel).await.unwrap();
        assert_eq!(result.interruption_reason.as_deref(), Some(REASON_CANCELLED));
    }

    let sessions = FileSessionStore::new(&workspace.state);
    let session = sessions.load_session("billing").await.unwrap().unwrap();
    assert_eq!(session.resume_count, 1);

    let checkpoints = sessions.list_checkpoints("billing").await.unwrap();
    assert_eq!(checkpoints.len(), 2);
    assert!(checkpoints.iter().all(|c| {
        c.checkpoint.trigger == CheckpointTrigger::UserPause
            && c.checkpoint.session_id == session.session_id
            && c.checkpoint.step == WorkflowStep::BreakIntoTasks
    }));
}

#[tokio::test]
async fn test_unapproved_module_stops_for_review_then_plans_after_approval() {
    let workspace = Workspace::new();
    Workspace::write(&workspace.specs, "billing.md", "# Billing\n\n## Scope\nInvoices.\n");
    let assessor = workspace.assessor();

    let (mut orchestrator, _) = file_backed_orchestrator(
        &workspace,
        assessor.clone(),
        "drafted",
        RunOptions::default(),
    );
    let result = orchestrator
        .run("billing", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.final_step, WorkflowStep::DraftSpecification);
    assert!(result.was_interrupted);

    assert!(assessor.approve("billing").await.unwrap());
    assert!(!assessor.approve("billing").await.unwrap());
    assert_eq!(
        assessor.current_step("billing").await.unwrap(),
        WorkflowStep::DetermineDependencies
    );
}

#[tokio::test]
async fn test_invalid_module_names_never_touch_the_filesystem() {
    let workspace = Workspace::new();
    let sessions = FileSessionStore::new(&workspace.state);
    let plans = FilePlanStore::new(&workspace.plans);

    assert!(sessions.open_session("../escape").await.is_err());
    assert!(plans.append_plan(".hidden", "text").await.is_err());
    assert!(workspace.assessor().approve("a/b").await.is_err());
    assert!(!workspace.state.exists());
}
