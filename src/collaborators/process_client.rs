use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ModelClient, ModelRequest, ModelResponse, TokenUsage};
use crate::config::AgentConfig;
use crate::errors::ModelError;

const MODEL_PLACEHOLDER: &str = "{model}";

/// Rough token count when the agent does not report usage
fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Runs the configured agent command once per invocation.
///
/// The prompt goes to stdin and stdout is the response. The agent signals
/// "this model cannot serve the request" with a dedicated exit code, which is
/// what lets the resilience layer move on to the next model.
#[derive(Debug, Clone)]
pub struct ProcessModelClient {
    command: String,
    args: Vec<String>,
    unavailable_exit_code: i32,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl ProcessModelClient {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            unavailable_exit_code: AgentConfig::default().unavailable_exit_code,
            timeout: Duration::from_secs(AgentConfig::default().timeout_secs),
            working_dir: None,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
            .with_unavailable_exit_code(config.unavailable_exit_code)
            .with_timeout(Duration::from_secs(config.timeout_secs))
    }

    pub fn with_unavailable_exit_code(mut self, code: i32) -> Self {
        self.unavailable_exit_code = code;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn build_command(&self, request: &ModelRequest) -> Command {
        let mut command = Command::new(&self.command);
        command
            .args(
                self.args
                    .iter()
                    .map(|arg| arg.replace(MODEL_PLACEHOLDER, &request.model)),
            )
            .env("PHASEWRIGHT_MODEL", &request.model)
            .env(
                "PHASEWRIGHT_TOOLS",
                request
                    .tools
                    .iter()
                    .map(|t| t.name.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl ModelClient for ProcessModelClient {
    async fn invoke(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ModelError> {
        let mut child = self.build_command(request).spawn()?;
        debug!(
            command = %self.command,
            model = %request.model,
            pid = ?child.id(),
            "Spawned agent process"
        );

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    warn!(error = %e, "Failed to write prompt to agent");
                }
            });
        }

        // Dropping the wait future drops the child, and kill_on_drop ends it
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(model = %request.model, "Agent process cancelled");
                return Err(ModelError::Cancelled);
            }
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(output) => output?,
                Err(_) => {
                    return Err(ModelError::Invocation(format!(
                        "agent did not finish within {}s",
                        self.timeout.as_secs()
                    )));
                }
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => {}
            Some(code) if code == self.unavailable_exit_code => {
                return Err(ModelError::unavailable(&request.model, stderr));
            }
            _ => {
                return Err(ModelError::Invocation(format!(
                    "agent exited with {}: {}",
                    output.status, stderr
                )));
            }
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        let input = estimate_tokens(&request.prompt);
        let output_tokens = estimate_tokens(&text);
        Ok(ModelResponse {
            text,
            token_usage: TokenUsage {
                input,
                output: output_tokens,
                total: input + output_tokens,
                context_window: 0,
                is_premium: false,
            },
            tool_calls_made: 0,
        })
    }
}
