//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, ports valid)
//! - Detect conflicting listener addresses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AppConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::AppConfig;

/// A single semantic problem found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Check the configuration, collecting every problem found.
pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.amqp.host.trim().is_empty() {
        errors.push(ValidationError::new("amqp.host", "must not be empty"));
    }
    if config.amqp.port == 0 {
        errors.push(ValidationError::new("amqp.port", "must be a valid port"));
    }
    if config.amqp.queue.trim().is_empty() {
        errors.push(ValidationError::new("amqp.queue", "must not be empty"));
    }
    if config.amqp.exchange.as_deref().is_some_and(|e| e.trim().is_empty()) {
        errors.push(ValidationError::new("amqp.exchange", "must not be empty when set"));
    }

    let smtp_addr = parse_addr("smtp.addr", &config.smtp.addr, &mut errors);
    let http_addr = parse_addr("http.addr", &config.http.addr, &mut errors);
    if let (Some(smtp), Some(http)) = (smtp_addr, http_addr) {
        if smtp == http && smtp.port() != 0 {
            errors.push(ValidationError::new(
                "http.addr",
                format!("conflicts with smtp.addr ({})", smtp),
            ));
        }
    }

    if config.smtp.login.is_empty() {
        errors.push(ValidationError::new(
            "smtp.login",
            "must be set, anonymous submission is not accepted",
        ));
    }
    if config.smtp.max_message_bytes == 0 {
        errors.push(ValidationError::new("smtp.max_message_bytes", "must be > 0"));
    }
    if config.smtp.max_recipients == 0 {
        errors.push(ValidationError::new("smtp.max_recipients", "must be > 0"));
    }
    if config.smtp.idle_timeout_secs == 0 {
        errors.push(ValidationError::new("smtp.idle_timeout_secs", "must be > 0"));
    }
    if config.http.shutdown_timeout_ms == 0 {
        errors.push(ValidationError::new("http.shutdown_timeout_ms", "must be > 0"));
    }
    if config.http.request_timeout_secs == 0 {
        errors.push(ValidationError::new("http.request_timeout_secs", "must be > 0"));
    }
    if config.health.max_active_sessions == 0 {
        errors.push(ValidationError::new("health.max_active_sessions", "must be > 0"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn parse_addr(
    field: &'static str,
    value: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<SocketAddr> {
    match value.parse() {
        Ok(addr) => Some(addr),
        Err(e) => {
            errors.push(ValidationError::new(field, format!("invalid address {:?}: {}", value, e)));
            None
        }
    }
}
