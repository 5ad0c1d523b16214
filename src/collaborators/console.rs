use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::OutputRenderer;
use crate::workflow::{WorkflowPhase, WorkflowStep};

const PROGRESS_WIDTH: usize = 20;

type AnswerLines = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;

/// Terminal rendering on stdout; answers read from stdin
#[derive(Clone)]
pub struct ConsoleRenderer {
    // One reader for the process, so buffered input survives between prompts
    answers: Arc<Mutex<AnswerLines>>,
}

impl std::fmt::Debug for ConsoleRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleRenderer").finish_non_exhaustive()
    }
}

impl Default for ConsoleRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleRenderer {
    pub fn new() -> Self {
        Self::with_input(tokio::io::stdin())
    }

    /// Read answers from `input` instead of stdin
    pub fn with_input(input: impl AsyncRead + Send + Unpin + 'static) -> Self {
        let input: Box<dyn AsyncRead + Send + Unpin> = Box::new(input);
        Self {
            answers: Arc::new(Mutex::new(BufReader::new(input).lines())),
        }
    }

    fn progress_bar(fraction: f64) -> String {
        let filled = (fraction.clamp(0.0, 1.0) * PROGRESS_WIDTH as f64).round() as usize;
        format!(
            "[{}{}]",
            "#".repeat(filled),
            "-".repeat(PROGRESS_WIDTH - filled)
        )
    }
}

#[async_trait]
impl OutputRenderer for ConsoleRenderer {
    fn render_progress(&self, phase: WorkflowPhase, step: WorkflowStep, fraction: f64) {
        println!(
            "{} {:>3}%  {} / {}",
            Self::progress_bar(fraction),
            (fraction.clamp(0.0, 1.0) * 100.0).round() as u32,
            phase,
            step
        );
    }

    fn render_error(&self, message: &str, cause: Option<&str>) {
        match cause {
            Some(cause) => eprintln!("❌ {message}\n   caused by: {cause}"),
            None => eprintln!("❌ {message}"),
        }
    }

    fn render_result(&self, message: &str) {
        println!("{message}");
    }

    async fn prompt(&self, message: &str, cancel: &CancellationToken) -> Option<String> {
        print!("{message} ");
        if let Err(e) = std::io::stdout().flush() {
            debug!(error = %e, "Failed to flush prompt");
        }

        let mut lines = self.answers.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => {
                println!();
                None
            }
            line = lines.next_line() => match line {
                Ok(answer) => answer,
                Err(e) => {
                    debug!(error = %e, "Failed to read answer from stdin");
                    None
                }
            }
        }
    }
}
