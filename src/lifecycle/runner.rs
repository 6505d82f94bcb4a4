//! Concurrent service runner.
//!
//! # Responsibilities
//! - Start every registered service under one cancellation scope
//! - Cancel the scope on termination request or on the first failure
//! - Wait for every service before returning
//!
//! # Design Decisions
//! - Fail fast: the first error cancels all other services
//! - Errors after the first are logged, not escalated
//! - `ListenerClosed` is a normal shutdown outcome, not a failure
//! - A panicking service counts as a failure of that service

use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::service::{Service, ServiceError};
use crate::lifecycle::shutdown::ShutdownCoordinator;

/// Why a run ended with a failure.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("service `{service}` failed: {source}")]
    Service {
        service: String,
        #[source]
        source: ServiceError,
    },

    #[error("service `{service}` panicked")]
    Panicked { service: String },
}

/// Holds the registered services and runs them together.
pub struct ApplicationRunner {
    services: Vec<Arc<dyn Service>>,
    shutdown: ShutdownCoordinator,
}

impl ApplicationRunner {
    /// Create an empty runner acknowledging into `shutdown`'s barrier.
    pub fn new(shutdown: ShutdownCoordinator) -> Self {
        Self {
            services: Vec::new(),
            shutdown,
        }
    }

    /// Add a service. `run` consumes the runner, so nothing can be added later.
    pub fn register(&mut self, service: Arc<dyn Service>) {
        self.services.push(service);
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no service is registered.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Run every service until all have returned.
    ///
    /// Returns the first failure, or `Ok` if every service returned cleanly.
    pub async fn run(self, parent: CancellationToken) -> Result<(), RunError> {
        let scope = parent.child_token();
        let barrier = self.shutdown.barrier();

        let watcher = {
            let scope = scope.clone();
            let requested = self.shutdown.token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = requested.cancelled() => {
                        tracing::info!("Termination requested, stopping services");
                        scope.cancel();
                    }
                    _ = scope.cancelled() => {}
                }
            })
        };

        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();
        for service in self.services {
            barrier.register();
            let token = scope.clone();
            let shutdown = self.shutdown.clone();
            let name = service.name().to_string();
            let handle = tasks.spawn(async move {
                tracing::info!(service = %service.name(), "Service starting");
                let outcome = AssertUnwindSafe(service.run(token)).catch_unwind().await;
                // Teardown is over once `run` returns or unwinds.
                if let Err(e) = shutdown.barrier().acknowledge() {
                    tracing::warn!(error = %e, "Unexpected service acknowledgement");
                }
                outcome
            });
            names.insert(handle.id(), name);
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, outcome)) => (id, Some(outcome)),
                Err(e) => (e.id(), None),
            };
            let name = names
                .remove(&id)
                .unwrap_or_else(|| format!("task-{id}"));

            let result = match outcome {
                Some(Ok(Ok(()))) => {
                    tracing::info!(service = %name, "Service stopped");
                    Ok(())
                }
                Some(Ok(Err(e))) if e.is_benign() => {
                    tracing::info!(service = %name, reason = %e, "Service stopped");
                    Ok(())
                }
                Some(Ok(Err(e))) => Err(RunError::Service {
                    service: name,
                    source: e,
                }),
                Some(Err(_)) | None => Err(RunError::Panicked { service: name }),
            };

            if let Err(e) = result {
                if first_error.is_none() {
                    tracing::error!(error = %e, "Service failed, stopping the others");
                    scope.cancel();
                    first_error = Some(e);
                } else {
                    tracing::warn!(error = %e, "Service failed during shutdown");
                }
            }
        }

        scope.cancel();
        let _ = watcher.await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
