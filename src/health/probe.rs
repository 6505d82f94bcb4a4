//! Health probes and their caching policies.
//!
//! # Responsibilities
//! - Wrap a synchronous check behind a cloneable handle
//! - Bound probe cost with a TTL cache or a background refresh
//!
//! # Design Decisions
//! - Probes are plain closures; async dependencies publish their state
//!   into atomics that the closure reads
//! - Cached results are swapped atomically, readers never block

use arc_swap::ArcSwap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a probe failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("transport handshake not complete")]
    HandshakeIncomplete,

    #[error("{0}")]
    Failed(String),

    #[error("probe panicked: {0}")]
    Panicked(String),
}

/// Result of one probe evaluation.
pub type ProbeResult = Result<(), ProbeError>;

/// A named check's callable part.
#[derive(Clone)]
pub struct Probe {
    check: Arc<dyn Fn() -> ProbeResult + Send + Sync>,
}

impl Probe {
    /// Wrap a check closure.
    pub fn new<F>(check: F) -> Self
    where
        F: Fn() -> ProbeResult + Send + Sync + 'static,
    {
        Self {
            check: Arc::new(check),
        }
    }

    /// Run the check.
    pub fn check(&self) -> ProbeResult {
        (self.check)()
    }

    /// Run the check, turning a panic into `ProbeError::Panicked`.
    pub fn check_isolated(&self) -> ProbeResult {
        match catch_unwind(AssertUnwindSafe(|| self.check())) {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(ProbeError::Panicked(message))
            }
        }
    }

    /// Reuse a result for `ttl` before running the check again.
    pub fn cached(self, ttl: Duration) -> Self {
        let cache = CachedProbe::new(self, ttl);
        Probe::new(move || cache.check())
    }

    /// Evaluate the check every `every` in a background task and serve the
    /// last result. The task stops when `token` is cancelled.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn refreshed_every(self, every: Duration, token: CancellationToken) -> Self {
        let last = Arc::new(ArcSwap::from_pointee(self.check_isolated()));

        let refresher = Arc::clone(&last);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately and was already evaluated.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        refresher.store(Arc::new(self.check_isolated()));
                    }
                    _ = token.cancelled() => break,
                }
            }
        });

        Probe::new(move || (**last.load()).clone())
    }
}

struct CachedProbe {
    probe: Probe,
    ttl: Duration,
    last: ArcSwap<Option<(Instant, ProbeResult)>>,
}

impl CachedProbe {
    fn new(probe: Probe, ttl: Duration) -> Self {
        Self {
            probe,
            ttl,
            last: ArcSwap::from_pointee(None),
        }
    }

    fn check(&self) -> ProbeResult {
        let last = self.last.load();
        if let Some((at, result)) = &**last {
            if at.elapsed() < self.ttl {
                return result.clone();
            }
        }

        let result = self.probe.check();
        self.last
            .store(Arc::new(Some((Instant::now(), result.clone()))));
        result
    }
}
