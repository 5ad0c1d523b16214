use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;

use phasewright::collaborators::{
    ArtifactStateAssessor, ConfiguredModelSelector, ConsoleRenderer, Git2WorkflowService,
    InMemoryTokenTracker, ProcessModelClient, SpecDriftDetector, StateAssessor,
    StaticToolRegistry, TemplatePromptBuilder, ThresholdBudgetEnforcer,
};
use phasewright::orchestration::RetryPressureGuardrail;
use phasewright::{
    config, init_telemetry, shutdown_telemetry, CoreServices, FilePlanStore, FileSessionStore,
    OrchestrationResult, PhasewrightConfig, ShutdownCoordinator, WorkflowOrchestrator,
};

const EXIT_INTERRUPTED: i32 = 2;
const EXIT_CRITICAL: i32 = 3;

#[derive(Parser)]
#[command(name = "phasewright")]
#[command(about = "Drive a coding agent through specification, planning and building")]
#[command(long_about = "Phasewright takes one module at a time from a drafted specification \
                       through dependency and component planning to task-by-task building, \
                       checkpointing as it goes. Start with 'phasewright run <module>'.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workflow loop for a module until it completes or needs a human
    Run(RunArgs),
    /// Approve a module's specification so planning can begin
    Approve {
        /// Module name
        module: String,
    },
    /// Show where a module is in the workflow
    Status {
        /// Module name
        module: String,
    },
    /// Print the resolved configuration as TOML
    Config,
}

#[derive(Args)]
struct RunArgs {
    /// Module name
    module: String,
    /// Never prompt; stop instead of asking for budget confirmation
    #[arg(long)]
    unattended: bool,
    /// Consecutive failures of a step before asking what to do
    #[arg(long)]
    failure_threshold: Option<u32>,
    /// Stop after this many loop iterations
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Extra context appended to every prompt
    #[arg(long)]
    context: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = config()?.clone();
    init_telemetry(&settings.observability)?;

    let runtime = tokio::runtime::Runtime::new()?;
    let exit_code = match cli.command {
        Commands::Run(args) => runtime.block_on(run_command(&settings, args))?,
        Commands::Approve { module } => runtime.block_on(approve_command(&settings, &module))?,
        Commands::Status { module } => runtime.block_on(status_command(&settings, &module))?,
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&settings)?);
            0
        }
    };

    shutdown_telemetry();
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn assessor_for(settings: &PhasewrightConfig) -> ArtifactStateAssessor {
    let storage = &settings.storage;
    ArtifactStateAssessor::new(&storage.spec_dir, &storage.plan_dir, &storage.state_dir)
}

async fn run_command(settings: &PhasewrightConfig, args: RunArgs) -> Result<i32> {
    let storage = &settings.storage;
    let mut run_config = settings.run.clone();
    run_config.unattended |= args.unattended;
    if let Some(threshold) = args.failure_threshold {
        run_config.failure_threshold = threshold;
    }
    if let Some(limit) = args.max_iterations {
        run_config.max_iterations = Some(limit);
    }

    let assessor = Arc::new(assessor_for(settings));
    let sessions = Arc::new(
        FileSessionStore::new(&storage.state_dir).with_max_checkpoints(storage.max_checkpoints),
    );
    let tokens = Arc::new(InMemoryTokenTracker::new());

    let services = CoreServices {
        assessor: assessor.clone(),
        model_client: Arc::new(ProcessModelClient::from_config(&settings.agent)),
        model_selector: Arc::new(ConfiguredModelSelector::new(settings.models.clone())),
        tools: Arc::new(StaticToolRegistry::standard()),
        prompts: Arc::new(TemplatePromptBuilder::new(
            storage.spec_dir.display().to_string(),
            storage.plan_dir.display().to_string(),
        )),
        renderer: Arc::new(ConsoleRenderer::new()),
    };

    let mut orchestrator =
        WorkflowOrchestrator::new(services, run_config.run_options(args.context))?
            .with_drift_service(Arc::new(SpecDriftDetector::new(&storage.spec_dir)))
            .with_session_manager(sessions.clone())
            .with_checkpoint_sink(sessions)
            .with_token_tracker(tokens.clone())
            .with_plan_store(Arc::new(FilePlanStore::new(&storage.plan_dir)));

    if run_config.retry_warn_after > 0 {
        orchestrator = orchestrator
            .with_guardrail(Arc::new(RetryPressureGuardrail::new(run_config.retry_warn_after)));
    }
    if settings.budget.enabled {
        orchestrator = orchestrator
            .with_budget_enforcer(Arc::new(ThresholdBudgetEnforcer::new(settings.budget.clone())));
    }
    if settings.git.enabled {
        orchestrator = orchestrator.with_git_service(Arc::new(Git2WorkflowService::new(
            ".",
            settings.git.branch_prefix.clone(),
        )));
    }

    match assessor.is_approved(&args.module).await {
        Ok(true) => orchestrator.approve_specification(),
        Ok(false) => {}
        Err(e) => tracing::warn!(module = %args.module, error = %e, "Could not read approval state"),
    }

    let shutdown = ShutdownCoordinator::new();
    shutdown.install_signal_handlers();

    let result = orchestrator.run(&args.module, &shutdown.token()).await?;
    tokens.log_stats();
    print_summary(&args.module, &result);

    Ok(exit_code(&result))
}

fn exit_code(result: &OrchestrationResult) -> i32 {
    if result.is_complete {
        0
    } else if result.is_critical_error {
        EXIT_CRITICAL
    } else {
        EXIT_INTERRUPTED
    }
}

fn print_summary(module: &str, result: &OrchestrationResult) {
    println!();
    if result.is_complete {
        println!("✅ Module '{module}' complete after {} iterations", result.iteration_count);
        return;
    }

    let reason = result.interruption_reason.as_deref().unwrap_or("unknown");
    if result.is_critical_error {
        println!("🛑 Module '{module}' stopped on a critical error: {reason}");
    } else {
        println!("⏸️  Module '{module}' paused at {}: {reason}", result.final_step);
    }
    println!("   Iterations: {}", result.iteration_count);
    println!("   Resume with: phasewright run {module}");
}

async fn approve_command(settings: &PhasewrightConfig, module: &str) -> Result<i32> {
    let assessor = assessor_for(settings);
    if assessor.approve(module).await? {
        println!("✅ Specification for '{module}' approved");
    } else {
        println!("ℹ️  Specification for '{module}' was already approved");
    }
    Ok(0)
}

async fn status_command(settings: &PhasewrightConfig, module: &str) -> Result<i32> {
    let assessor = assessor_for(settings);
    let sessions = FileSessionStore::new(&settings.storage.state_dir);

    let step = assessor.current_step(module).await?;
    println!("📋 Module: {module}");
    println!("   Phase: {}", step.phase());
    println!("   Step: {step}");
    println!("   Specification approved: {}", assessor.is_approved(module).await?);

    if let Some(hint) = assessor.read_step_hint(module).await? {
        if hint != step {
            println!("   Last recorded step: {hint}");
        }
    }

    if let Some(session) = sessions.load_session(module).await? {
        println!(
            "   Session: {} (resumed {} times)",
            session.session_id, session.resume_count
        );
    }

    match sessions.load_latest(module).await? {
        Some(latest) => println!(
            "   Last checkpoint: #{} {:?} at {} (iteration {}, {} tokens)",
            latest.sequence,
            latest.checkpoint.trigger,
            latest.checkpoint.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            latest.checkpoint.iteration,
            latest.checkpoint.metrics.total_tokens
        ),
        None => println!("   Last checkpoint: none"),
    }

    Ok(0)
}
