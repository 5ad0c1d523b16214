use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::orchestration::RunOptions;
use crate::persistence::DEFAULT_MAX_CHECKPOINTS;
use crate::workflow::WorkflowPhase;

/// Main configuration structure for Phasewright
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PhasewrightConfig {
    pub run: RunConfig,
    pub models: ModelsConfig,
    pub agent: AgentConfig,
    pub budget: BudgetConfig,
    pub storage: StorageConfig,
    pub git: GitConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfig {
    /// Never prompt; repeated failures continue, budget confirmations stop
    pub unattended: bool,
    /// Consecutive failures of one step before escalating
    pub failure_threshold: u32,
    pub max_iterations: Option<u32>,
    /// Warn once a step has failed this many times in a row (0 disables)
    pub retry_warn_after: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            unattended: false,
            failure_threshold: 3,
            max_iterations: Some(200),
            retry_warn_after: 2,
        }
    }
}

impl RunConfig {
    pub fn run_options(&self, user_context: Option<String>) -> RunOptions {
        RunOptions {
            unattended: self.unattended,
            failure_threshold: self.failure_threshold,
            user_context,
            max_iterations: self.max_iterations,
        }
    }
}

/// Primary model and fallback chain for one phase
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PhaseModels {
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

impl PhaseModels {
    fn new(primary: &str, fallbacks: &[&str]) -> Self {
        Self {
            primary: primary.to_string(),
            fallbacks: fallbacks.iter().map(|m| m.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub requirement_gathering: PhaseModels,
    pub planning: PhaseModels,
    pub building: PhaseModels,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            requirement_gathering: PhaseModels::new("claude-opus-4", &["claude-sonnet-4"]),
            planning: PhaseModels::new("claude-opus-4", &["claude-sonnet-4"]),
            building: PhaseModels::new("claude-sonnet-4", &["claude-haiku-4"]),
        }
    }
}

impl ModelsConfig {
    pub fn for_phase(&self, phase: WorkflowPhase) -> &PhaseModels {
        match phase {
            WorkflowPhase::RequirementGathering => &self.requirement_gathering,
            WorkflowPhase::Planning => &self.planning,
            WorkflowPhase::Building => &self.building,
        }
    }
}

/// External agent process that serves model requests
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub command: String,
    /// `{model}` is replaced with the selected model name
    pub args: Vec<String>,
    /// Exit code meaning "this model cannot serve the request"
    pub unavailable_exit_code: i32,
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--model".to_string(),
                "{model}".to_string(),
            ],
            unavailable_exit_code: 75,
            timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub enabled: bool,
    pub warn_tokens: u64,
    /// Ask the operator before going past this many tokens
    pub confirm_tokens: u64,
    pub max_tokens: u64,
    pub max_premium_requests: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warn_tokens: 2_000_000,
            confirm_tokens: 4_000_000,
            max_tokens: 8_000_000,
            max_premium_requests: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub state_dir: PathBuf,
    pub plan_dir: PathBuf,
    pub spec_dir: PathBuf,
    /// Checkpoint files kept per module (0 keeps all)
    pub max_checkpoints: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".phasewright/state"),
            plan_dir: PathBuf::from(".phasewright/plans"),
            spec_dir: PathBuf::from("specs"),
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GitConfig {
    pub enabled: bool,
    pub branch_prefix: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            branch_prefix: "phasewright".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// JSON log lines instead of the compact human format
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl PhasewrightConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (phasewright.toml, .phasewright-rc)
    /// 3. Environment variables (PHASEWRIGHT__RUN__UNATTENDED=true)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Same as [`load`](Self::load), resolving config files against `dir`
    pub fn load_from(dir: &Path) -> Result<Self> {
        let mut builder = Config::builder();

        let toml_path = dir.join("phasewright.toml");
        if toml_path.exists() {
            builder = builder.add_source(File::from(toml_path));
        }

        let rc_path = dir.join(".phasewright-rc");
        if rc_path.exists() {
            builder = builder.add_source(File::from(rc_path).format(config::FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("PHASEWRIGHT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: PhasewrightConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::debug!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<PhasewrightConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = PhasewrightConfig::load_env_file();
        PhasewrightConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static PhasewrightConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = PhasewrightConfig::default();
        assert_eq!(config.run.failure_threshold, 3);
        assert!(!config.run.unattended);
        assert_eq!(config.observability.log_level, "info");
        assert_eq!(
            config.models.for_phase(WorkflowPhase::Building).primary,
            "claude-sonnet-4"
        );
    }

    #[test]
    fn test_run_options_carry_context() {
        let options = RunConfig::default().run_options(Some("use postgres".into()));
        assert_eq!(options.failure_threshold, 3);
        assert_eq!(options.max_iterations, Some(200));
        assert_eq!(options.user_context.as_deref(), Some("use postgres"));
    }

    #[test]
    fn test_load_merges_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("phasewright.toml"),
            r#"
[run]
unattended = true
failure_threshold = 5

[models.planning]
primary = "local-large"
fallbacks = ["local-small"]
"#,
        )
        .unwrap();

        let config = PhasewrightConfig::load_from(dir.path()).unwrap();
        assert!(config.run.unattended);
        assert_eq!(config.run.failure_threshold, 5);
        assert_eq!(config.run.retry_warn_after, 2);
        assert_eq!(config.models.planning.primary, "local-large");
        assert_eq!(config.models.planning.fallbacks, vec!["local-small"]);
        assert_eq!(config.storage, StorageConfig::default());
    }

    #[test]
    fn test_checkpoint_retention_is_configurable() {
        assert_eq!(StorageConfig::default().max_checkpoints, 200);

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("phasewright.toml"),
            "[storage]\nmax_checkpoints = 25\n",
        )
        .unwrap();

        let config = PhasewrightConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.storage.max_checkpoints, 25);
        assert_eq!(config.storage.spec_dir, PathBuf::from("specs"));
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PhasewrightConfig::default();
        config.git.branch_prefix = "agents".to_string();
        config.budget.max_tokens = 42;
        config.save_to_file(dir.path().join("phasewright.toml")).unwrap();

        let reloaded = PhasewrightConfig::load_from(dir.path()).unwrap();
        assert_eq!(reloaded.git.branch_prefix, "agents");
        assert_eq!(reloaded.budget.max_tokens, 42);
    }
}
