//! SMTP listener service.
//!
//! # Responsibilities
//! - Accept client connections on the bound listener
//! - Run each session on its own task inside a tracing span
//! - On cancellation stop accepting, then give open sessions a bounded
//!   time to finish
//!
//! # Design Decisions
//! - The listener is bound before the service is built, so bind errors
//!   surface at startup rather than inside the run
//! - Returns `ListenerClosed` after cancellation; the runner treats it as
//!   a clean stop

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::SmtpConfig;
use crate::lifecycle::service::{Service, ServiceError};
use crate::net::SessionTracker;
use crate::smtp::backend::Backend;
use crate::smtp::session::{self, SessionSettings};

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// SMTP submission listener and its sessions.
pub struct SmtpService {
    listener: Mutex<Option<TcpListener>>,
    backend: Arc<dyn Backend>,
    settings: Arc<SessionSettings>,
    sessions: SessionTracker,
    drain_timeout: Duration,
}

impl SmtpService {
    /// Serve `listener` with sessions authenticated by `backend`.
    pub fn new(
        listener: TcpListener,
        backend: Arc<dyn Backend>,
        config: &SmtpConfig,
        sessions: SessionTracker,
    ) -> Self {
        Self {
            listener: Mutex::new(Some(listener)),
            backend,
            settings: Arc::new(SessionSettings::from(config)),
            sessions,
            drain_timeout: Duration::from_millis(config.shutdown_timeout_ms),
        }
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr, token: CancellationToken) {
        let guard = self.sessions.track();
        let span = tracing::info_span!("smtp_session", session_id = %guard.id(), peer = %peer);
        let backend = Arc::clone(&self.backend);
        let settings = Arc::clone(&self.settings);

        tokio::spawn(
            async move {
                tracing::debug!("Session opened");
                if let Err(e) = session::serve(stream, backend.as_ref(), &settings, token).await {
                    tracing::debug!(error = %e, "Session ended with I/O error");
                }
                drop(guard);
            }
            .instrument(span),
        );
    }
}

#[async_trait]
impl Service for SmtpService {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn run(&self, token: CancellationToken) -> Result<(), ServiceError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ServiceError::AlreadyStarted)?;

        if let Ok(addr) = listener.local_addr() {
            tracing::info!(address = %addr, "SMTP listener started");
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer, token.child_token()),
                    Err(_) if token.is_cancelled() => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        tracing::info!(
            active_sessions = self.sessions.active_count(),
            "SMTP listener closed, draining sessions"
        );

        if tokio::time::timeout(self.drain_timeout, self.sessions.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.sessions.active_count(),
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "Sessions still open after drain timeout"
            );
        }

        Err(ServiceError::ListenerClosed)
    }
}
