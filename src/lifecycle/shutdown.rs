//! Shutdown coordination.
//!
//! Two phases, kept apart:
//! 1. a one-shot broadcast that any number of tasks can wait on
//!    (`CancellationToken`), fired by a termination signal or `trigger`;
//! 2. a counting completion barrier that each registered service
//!    acknowledges once when it has finished its teardown.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::signals::termination_signal;

/// Barrier misuse or an overdue shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShutdownError {
    #[error("{outstanding} service(s) did not finish within {timeout:?}")]
    ShutdownTimeout {
        outstanding: usize,
        timeout: Duration,
    },

    #[error("acknowledgement received with none outstanding")]
    ExcessAcknowledgement,
}

/// Counts registered participants down to zero.
#[derive(Debug)]
pub struct CompletionBarrier {
    outstanding: watch::Sender<usize>,
}

impl Default for CompletionBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionBarrier {
    /// Create a barrier with nothing outstanding.
    pub fn new() -> Self {
        let (outstanding, _) = watch::channel(0);
        Self { outstanding }
    }

    /// Expect one more acknowledgement.
    pub fn register(&self) {
        self.outstanding.send_modify(|n| *n += 1);
    }

    /// Record one completion. Never drives the count below zero.
    pub fn acknowledge(&self) -> Result<(), ShutdownError> {
        let mut accepted = false;
        self.outstanding.send_if_modified(|n| {
            if *n == 0 {
                return false;
            }
            *n -= 1;
            accepted = true;
            true
        });

        if accepted {
            Ok(())
        } else {
            tracing::warn!("Ignoring excess shutdown acknowledgement");
            Err(ShutdownError::ExcessAcknowledgement)
        }
    }

    /// Acknowledgements still expected.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Resolve once every registered participant has acknowledged.
    pub async fn wait(&self) {
        let mut rx = self.outstanding.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Like [`wait`](Self::wait), failing with the outstanding count after `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<(), ShutdownError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| ShutdownError::ShutdownTimeout {
                outstanding: self.outstanding(),
                timeout,
            })
    }
}

/// Coordinator for graceful shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    barrier: Arc<CompletionBarrier>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Create a coordinator that only fires on `trigger`.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            barrier: Arc::new(CompletionBarrier::new()),
        }
    }

    /// Create a coordinator that also fires on SIGINT/SIGTERM.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn install() -> Self {
        let coordinator = Self::new();
        let token = coordinator.token.clone();

        tokio::spawn(async move {
            tokio::select! {
                signal = termination_signal() => match signal {
                    Ok(name) => {
                        tracing::info!(signal = name, "Shutdown signal received");
                        token.cancel();
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to install signal handlers"),
                },
                _ = token.cancelled() => {}
            }
        });

        coordinator
    }

    /// Handle observing "termination requested".
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request termination. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Whether termination has been requested.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until termination is requested. Returns at once if it already was.
    pub async fn requested(&self) {
        self.token.cancelled().await;
    }

    /// The barrier services acknowledge into.
    pub fn barrier(&self) -> &CompletionBarrier {
        &self.barrier
    }

    /// Both phases: termination requested, then every participant done.
    pub async fn completed(&self) {
        self.requested().await;
        self.barrier.wait().await;
    }
}
