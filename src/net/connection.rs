//! Session tracking.
//!
//! # Responsibilities
//! - Count open client sessions
//! - Generate unique session IDs for tracing
//! - Let shutdown wait until every session has closed
//! - Feed the liveness check (open sessions under a ceiling)

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::health::probe::{Probe, ProbeError};
use crate::observability::metrics;

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new unique session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tracks open sessions for graceful shutdown and liveness.
///
/// The count lives in a watch channel so shutdown can await it reaching zero.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    active: Arc<watch::Sender<u64>>,
}

impl SessionTracker {
    /// Create a tracker with no open sessions.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            active: Arc::new(tx),
        }
    }

    /// Record a new session. Returns a guard that decrements on drop.
    pub fn track(&self) -> SessionGuard {
        self.active.send_modify(|n| *n += 1);
        metrics::record_session_opened();
        SessionGuard {
            active: Arc::clone(&self.active),
            id: SessionId::new(),
        }
    }

    /// Get current open session count.
    pub fn active_count(&self) -> u64 {
        *self.active.borrow()
    }

    /// Wait until every session has closed.
    pub async fn wait_idle(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Liveness probe failing once more than `ceiling` sessions are open.
    pub fn threshold_probe(&self, ceiling: u64) -> Probe {
        let tracker = self.clone();
        Probe::new(move || {
            let active = tracker.active_count();
            if active > ceiling {
                Err(ProbeError::Failed(format!(
                    "too many open sessions: {} > {}",
                    active, ceiling
                )))
            } else {
                Ok(())
            }
        })
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a session's lifetime.
/// Decrements the open count when dropped.
#[derive(Debug)]
pub struct SessionGuard {
    active: Arc<watch::Sender<u64>>,
    id: SessionId,
}

impl SessionGuard {
    /// Get this session's ID.
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
        metrics::record_session_closed();
        tracing::trace!(session_id = %self.id, "Session closed");
    }
}
