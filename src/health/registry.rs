//! Health check registry and aggregation.
//!
//! # Responsibilities
//! - Hold named probes, tagged liveness or readiness
//! - Evaluate a view on demand and aggregate the outcomes
//! - Contain panicking probes to their own entry
//!
//! # Design Decisions
//! - Registration is an upsert keyed by name; last write wins
//! - Probes run outside the map's shard locks
//! - Reports use a sorted map so serialized output is stable

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::health::probe::Probe;
use crate::observability::metrics;

/// What a check is evidence of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    /// The process itself is not wedged.
    Liveness,
    /// A dependency the process needs is available.
    Readiness,
}

/// Which checks an evaluation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Live,
    Ready,
    All,
}

impl View {
    fn includes(self, kind: CheckKind) -> bool {
        match self {
            View::Live => kind == CheckKind::Liveness,
            View::Ready => kind == CheckKind::Readiness,
            View::All => true,
        }
    }
}

/// Up or down, for a single check or the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    Down,
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: Status,
    pub details: BTreeMap<String, CheckOutcome>,
}

impl HealthReport {
    /// Whether every included check passed.
    pub fn is_up(&self) -> bool {
        self.status == Status::Up
    }

    /// Number of failed checks.
    pub fn failing(&self) -> usize {
        self.details
            .values()
            .filter(|o| o.status == Status::Down)
            .count()
    }
}

struct Entry {
    kind: CheckKind,
    probe: Probe,
}

/// Registry of named health probes.
#[derive(Default)]
pub struct HealthAggregator {
    checks: DashMap<String, Entry>,
}

impl HealthAggregator {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the check called `name`.
    pub fn register(&self, name: impl Into<String>, kind: CheckKind, probe: Probe) {
        let name = name.into();
        if self.checks.insert(name.clone(), Entry { kind, probe }).is_some() {
            tracing::debug!(check = %name, "Health check replaced");
        }
    }

    /// Number of registered checks.
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    /// Whether no checks are registered.
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every probe in `view` and aggregate. An empty view is up.
    pub fn evaluate(&self, view: View) -> HealthReport {
        let selected: Vec<(String, Probe)> = self
            .checks
            .iter()
            .filter(|entry| view.includes(entry.kind))
            .map(|entry| (entry.key().clone(), entry.probe.clone()))
            .collect();

        let mut details = BTreeMap::new();
        for (name, probe) in selected {
            let result = probe.check_isolated();
            metrics::record_check(&name, result.is_ok());

            let outcome = match result {
                Ok(()) => CheckOutcome {
                    status: Status::Up,
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(check = %name, error = %e, "Health check failed");
                    CheckOutcome {
                        status: Status::Down,
                        error: Some(e.to_string()),
                    }
                }
            };
            details.insert(name, outcome);
        }

        let status = if details.values().all(|o| o.status == Status::Up) {
            Status::Up
        } else {
            Status::Down
        };

        HealthReport { status, details }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::probe::ProbeError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn passing() -> Probe {
        Probe::new(|| Ok(()))
    }

    fn failing(reason: &'static str) -> Probe {
        Probe::new(move || Err(ProbeError::Failed(reason.into())))
    }

    #[test]
    fn aggregates_n_probes_with_k_failures() {
        let health = HealthAggregator::new();
        for i in 0..5 {
            health.register(format!("ok-{i}"), CheckKind::Readiness, passing());
        }
        for i in 0..3 {
            health.register(format!("bad-{i}"), CheckKind::Readiness, failing("down"));
        }

        let report = health.evaluate(View::All);
        assert!(!report.is_up());
        assert_eq!(report.details.len(), 8);
        assert_eq!(report.failing(), 3);
    }

    #[test]
    fn all_passing_is_up() {
        let health = HealthAggregator::new();
        health.register("a", CheckKind::Liveness, passing());
        health.register("b", CheckKind::Readiness, passing());
        assert!(health.evaluate(View::All).is_up());
    }

    #[test]
    fn last_registration_wins() {
        let health = HealthAggregator::new();
        health.register("amqp_check", CheckKind::Readiness, failing("first"));
        health.register("amqp_check", CheckKind::Readiness, passing());

        assert_eq!(health.len(), 1);
        let report = health.evaluate(View::All);
        assert_eq!(report.details.len(), 1);
        assert_eq!(report.details["amqp_check"].status, Status::Up);
    }

    #[test]
    fn panicking_probe_fails_only_itself() {
        let health = HealthAggregator::new();
        health.register("boom", CheckKind::Readiness, Probe::new(|| panic!("probe exploded")));
        health.register("fine", CheckKind::Readiness, passing());

        let report = health.evaluate(View::Ready);
        assert!(!report.is_up());
        assert_eq!(report.details["fine"].status, Status::Up);
        let boom = &report.details["boom"];
        assert_eq!(boom.status, Status::Down);
        assert_eq!(boom.error.as_deref(), Some("probe panicked: probe exploded"));
    }

    #[test]
    fn views_select_by_kind() {
        let health = HealthAggregator::new();
        health.register("sessions", CheckKind::Liveness, passing());
        health.register("amqp_check", CheckKind::Readiness, failing("connection closed"));

        let live = health.evaluate(View::Live);
        assert!(live.is_up());
        assert_eq!(live.details.keys().collect::<Vec<_>>(), vec!["sessions"]);

        let ready = health.evaluate(View::Ready);
        assert!(!ready.is_up());
        assert_eq!(ready.details.keys().collect::<Vec<_>>(), vec!["amqp_check"]);

        assert_eq!(health.evaluate(View::All).details.len(), 2);
    }

    #[test]
    fn report_serializes_as_status_and_details() {
        let health = HealthAggregator::new();
        health.register("amqp_check", CheckKind::Readiness, failing("connection closed"));

        let json = serde_json::to_value(health.evaluate(View::All)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": "down",
                "details": {
                    "amqp_check": { "status": "down", "error": "connection closed" }
                }
            })
        );
    }

    #[tokio::test]
    async fn panicking_refreshed_probe_reports_down() {
        let panicking = Arc::new(AtomicBool::new(false));
        let source = Arc::clone(&panicking);
        let probe = Probe::new(move || {
            if source.load(Ordering::SeqCst) {
                panic!("broker check exploded");
            }
            Ok(())
        });

        let token = CancellationToken::new();
        let health = HealthAggregator::new();
        health.register(
            "dep",
            CheckKind::Readiness,
            probe.refreshed_every(Duration::from_millis(20), token.clone()),
        );
        assert!(health.evaluate(View::Ready).is_up());

        panicking.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = health.evaluate(View::Ready);
        assert!(!report.is_up());
        assert_eq!(
            report.details["dep"].error.as_deref(),
            Some("probe panicked: broker check exploded")
        );
        token.cancel();
    }
}
