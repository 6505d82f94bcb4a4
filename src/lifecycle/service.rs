//! The "run until cancelled" capability shared by every long-running service.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::amqp::TransportError;

/// Terminal error of a service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The listener was closed because shutdown was requested. Not a failure.
    #[error("listener closed during shutdown")]
    ListenerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("AMQP connection lost: {0}")]
    ConnectionLost(TransportError),

    #[error("failed to close AMQP {stage}: {source}")]
    Close {
        stage: &'static str,
        source: TransportError,
    },

    #[error("service already started")]
    AlreadyStarted,
}

impl ServiceError {
    /// Errors that only report a deliberate shutdown.
    pub fn is_benign(&self) -> bool {
        matches!(self, ServiceError::ListenerClosed)
    }
}

/// A long-running service driven by the application runner.
///
/// `run` must return promptly once `token` is cancelled: stop accepting new
/// work, release listening resources, and return.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, token: CancellationToken) -> Result<(), ServiceError>;
}
