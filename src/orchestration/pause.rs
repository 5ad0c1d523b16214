use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Cooperative pause/resume signal shared between the control loop and
/// whoever drives it (a key handler, a signal, a test).
///
/// Backed by a `watch` channel, so the paused flag is level-triggered: a
/// resume that lands before the loop starts waiting is still observed.
#[derive(Debug)]
pub struct PauseGate {
    state: watch::Sender<bool>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self { state }
    }

    /// Returns true if this call changed the state
    pub fn pause(&self) -> bool {
        let changed = self.state.send_if_modified(|paused| {
            if *paused {
                false
            } else {
                *paused = true;
                true
            }
        });
        if changed {
            info!("Pause requested");
        }
        changed
    }

    /// Returns true if this call changed the state
    pub fn resume(&self) -> bool {
        let changed = self.state.send_if_modified(|paused| {
            if *paused {
                *paused = false;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Resume requested");
        }
        changed
    }

    /// Flip the state; returns the new paused value
    pub fn toggle(&self) -> bool {
        let mut now_paused = false;
        self.state.send_modify(|paused| {
            *paused = !*paused;
            now_paused = *paused;
        });
        debug!(paused = now_paused, "Pause gate toggled");
        now_paused
    }

    pub fn is_paused(&self) -> bool {
        *self.state.borrow()
    }

    /// Suspend until resumed or cancelled. Returns immediately when running.
    pub async fn wait_if_paused(&self, cancel: &CancellationToken) {
        let mut receiver = self.state.subscribe();
        if !*receiver.borrow_and_update() {
            return;
        }

        tokio::select! {
            _ = receiver.wait_for(|paused| !*paused) => {}
            _ = cancel.cancelled() => {
                debug!("Pause wait interrupted by cancellation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_running() {
        let gate = PauseGate::new();
        let cancel = CancellationToken::new();
        timeout(Duration::from_millis(100), gate.wait_if_paused(&cancel))
            .await
            .expect("wait should not block while running");
    }

    #[tokio::test]
    async fn test_concurrent_resume_releases_waiter() {
        let gate = Arc::new(PauseGate::new());
        assert!(gate.pause());

        let waiter_gate = Arc::clone(&gate);
        let waiter = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            waiter_gate.wait_if_paused(&cancel).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "waiter should be blocked while paused");

        assert!(gate.resume());
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released by resume")
            .expect("waiter task panicked");
    }

    #[tokio::test]
    async fn test_double_pause_and_resume_are_noops() {
        let gate = PauseGate::new();
        assert!(gate.pause());
        assert!(!gate.pause());
        assert!(gate.is_paused());

        assert!(gate.resume());
        assert!(!gate.resume());
        assert!(!gate.is_paused());
    }

    #[tokio::test]
    async fn test_resume_before_wait_is_not_lost() {
        let gate = PauseGate::new();
        gate.pause();
        gate.resume();

        let cancel = CancellationToken::new();
        timeout(Duration::from_millis(100), gate.wait_if_paused(&cancel))
            .await
            .expect("resume before wait must not deadlock");
    }

    #[tokio::test]
    async fn test_cancellation_releases_waiter() {
        let gate = Arc::new(PauseGate::new());
        gate.pause();
        let cancel = CancellationToken::new();

        let waiter_gate = Arc::clone(&gate);
        let waiter_cancel = cancel.clone();
        let waiter = tokio::spawn(async move {
            waiter_gate.wait_if_paused(&waiter_cancel).await;
        });

        cancel.cancel();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancellation should release the waiter")
            .expect("waiter task panicked");
        assert!(gate.is_paused());
    }

    #[tokio::test]
    async fn test_gate_rearms_after_resume() {
        let gate = Arc::new(PauseGate::new());
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            gate.pause();
            let waiter_gate = Arc::clone(&gate);
            let waiter_cancel = cancel.clone();
            let waiter = tokio::spawn(async move {
                waiter_gate.wait_if_paused(&waiter_cancel).await;
            });
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(!waiter.is_finished());
            gate.resume();
            timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        }
    }

    #[test]
    fn test_toggle() {
        let gate = PauseGate::new();
        assert!(gate.toggle());
        assert!(gate.is_paused());
        assert!(!gate.toggle());
        assert!(!gate.is_paused());
    }
}
