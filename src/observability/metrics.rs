//! Metrics collection and exposition.
//!
//! # Metrics
//! - `smtp_sessions_active` (gauge): open SMTP sessions
//! - `smtp_messages_received_total` (counter): message bodies accepted
//! - `amqp_publish_total` (counter): publishes by `outcome` (ok, error, closed)
//! - `amqp_connection_ready` (gauge): 1 while the broker link is usable
//! - `health_check_status` (gauge): 1=up, 0=down, by `check`
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until an
//!   exporter is installed
//! - The Prometheus exporter is optional and serves its own listener

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;

pub const SMTP_SESSIONS_ACTIVE: &str = "smtp_sessions_active";
pub const SMTP_MESSAGES_RECEIVED_TOTAL: &str = "smtp_messages_received_total";
pub const AMQP_PUBLISH_TOTAL: &str = "amqp_publish_total";
pub const AMQP_CONNECTION_READY: &str = "amqp_connection_ready";
pub const HEALTH_CHECK_STATUS: &str = "health_check_status";

/// Install the Prometheus recorder with an HTTP scrape listener on `addr`.
///
/// Must be called inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// Count a newly accepted SMTP session.
pub fn record_session_opened() {
    metrics::gauge!(SMTP_SESSIONS_ACTIVE).increment(1.0);
}

/// Count a closed SMTP session.
pub fn record_session_closed() {
    metrics::gauge!(SMTP_SESSIONS_ACTIVE).decrement(1.0);
}

/// Count a message accepted after `DATA`.
pub fn record_message_received() {
    metrics::counter!(SMTP_MESSAGES_RECEIVED_TOTAL).increment(1);
}

/// Count a publish, labelled by outcome.
pub fn record_publish(outcome: &'static str) {
    metrics::counter!(AMQP_PUBLISH_TOTAL, "outcome" => outcome).increment(1);
}

/// Set the broker connection gauge.
pub fn record_connection_ready(ready: bool) {
    metrics::gauge!(AMQP_CONNECTION_READY).set(if ready { 1.0 } else { 0.0 });
}

/// Set the gauge for one health check.
pub fn record_check(check: &str, up: bool) {
    metrics::gauge!(HEALTH_CHECK_STATUS, "check" => check.to_string()).set(if up { 1.0 } else { 0.0 });
}
