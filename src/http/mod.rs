//! HTTP health endpoint subsystem.
//!
//! # Data Flow
//! ```text
//! GET /live | /ready | /_health
//!     → server.rs (timeout, tracing layers)
//!     → health::HealthAggregator::evaluate(view)
//!     → JSON report, 200 or 503
//! ```

pub mod server;

pub use server::{router, HttpService};
