use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Graceful shutdown coordinator for Phasewright.
///
/// The first Ctrl-C cancels the run token so the orchestrator can checkpoint
/// and stop at its next suspension point. A second Ctrl-C exits immediately.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token handed to the orchestrator
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn request_shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested, stopping at the next safe point");
        }
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Install the Ctrl-C handler on the current runtime
    pub fn install_signal_handlers(&self) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                return;
            }
            coordinator.request_shutdown();

            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Second interrupt received, exiting without cleanup");
                std::process::exit(130);
            }
        });
        info!("Signal handlers installed, Ctrl-C stops the run gracefully");
    }
}
