//! Graceful shutdown coordination via `CancellationToken`.
//!
//! Every WebSocket session holds a child token. Cancelling the coordinator
//! makes each session tear down its pumps and close its socket, and makes
//! the HTTP listener stop accepting.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How a graceful shutdown finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every tracked task exited before the deadline.
    Drained,
    /// The deadline passed; remaining tasks were aborted.
    TimedOut,
}

/// Coordinates graceful shutdown across server tasks.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Initiate shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel, then wait up to `timeout` for `handles` to finish.
    ///
    /// Tasks still running at the deadline are aborted.
    pub async fn graceful_shutdown(
        &self,
        handles: Vec<JoinHandle<()>>,
        timeout: Duration,
    ) -> ShutdownOutcome {
        self.shutdown();
        info!(
            task_count = handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "waiting for tasks to complete"
        );

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = futures::future::join_all(handles);

        if tokio::time::timeout(timeout, drain).await.is_ok() {
            ShutdownOutcome::Drained
        } else {
            warn!(?timeout, "shutdown timed out, aborting remaining tasks");
            for handle in aborts {
                handle.abort();
            }
            ShutdownOutcome::TimedOut
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_shutting_down());
        assert!(!coord.token().is_cancelled());
    }

    #[test]
    fn tokens_handed_out_earlier_are_cancelled() {
        let coord = ShutdownCoordinator::new();
        let tokens = [coord.token(), coord.token()];
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }

    #[test]
    fn cancelling_a_child_token_does_not_shut_down() {
        let coord = ShutdownCoordinator::new();
        coord.token().cancel();
        assert!(!coord.is_shutting_down());
    }

    #[tokio::test]
    async fn graceful_shutdown_drains_cooperative_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let handle = tokio::spawn(async move { token.cancelled().await });

        let outcome = coord
            .graceful_shutdown(vec![handle], Duration::from_secs(5))
            .await;
        assert_eq!(outcome, ShutdownOutcome::Drained);
    }

    #[tokio::test]
    async fn graceful_shutdown_aborts_stragglers() {
        let coord = ShutdownCoordinator::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _keep = tx;
            tokio::time::sleep(Duration::from_secs(300)).await;
        });

        let outcome = coord
            .graceful_shutdown(vec![handle], Duration::from_millis(50))
            .await;
        assert_eq!(outcome, ShutdownOutcome::TimedOut);
        // The aborted task dropped its sender.
        assert!(rx.await.is_err());
    }
}
