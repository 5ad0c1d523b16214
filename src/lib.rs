// Phasewright Library - phase-driven orchestration for autonomous coding agents
// This exposes the control plane and its collaborators for the binary and tests

pub mod collaborators;
pub mod config;
pub mod errors;
pub mod orchestration;
pub mod persistence;
pub mod shutdown;
pub mod telemetry;
pub mod workflow;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export key types for easy access
pub use config::{config, PhasewrightConfig};
pub use errors::{CriticalKind, ModelError, OrchestratorError};
pub use orchestration::{
    CoreServices, FailureHandler, GuardrailPipeline, ModelResilienceLayer, OrchestrationResult,
    PauseGate, RunOptions, StepResult, WorkflowOrchestrator,
};
pub use persistence::{FilePlanStore, FileSessionStore, PersistenceError};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{create_run_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use workflow::{
    PhaseReadiness, PhaseTransitionController, WorkflowEngine, WorkflowPhase, WorkflowStep, WorkflowTrigger,
};
