//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Components register probes at startup (registry.rs):
//!     "amqp_check"          → readiness, refreshed on an interval (probe.rs)
//!     "session-threshold"   → liveness, cached for a short TTL (probe.rs)
//!
//! HTTP handlers evaluate a view on demand:
//!     /live    → liveness probes
//!     /ready   → readiness probes
//!     /_health → every probe
//! ```
//!
//! # Design Decisions
//! - Overall status is the AND of every check in the view
//! - One failing or panicking probe never hides the others
//! - Probes are side-effect free; evaluation can run at any rate

pub mod probe;
pub mod registry;

pub use probe::{Probe, ProbeError, ProbeResult};
pub use registry::{CheckKind, CheckOutcome, HealthAggregator, HealthReport, Status, View};
