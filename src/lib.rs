//! SMTP submission to AMQP queue bridge.
//!
//! Accepts authenticated SMTP submissions and republishes each accepted
//! message, once per recipient, to a durable AMQP queue. Liveness and
//! readiness are served over HTTP.

// Message path
pub mod amqp;
pub mod net;
pub mod smtp;

// Service surface
pub mod health;
pub mod http;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use amqp::{ConnectionManager, Envelope, LapinDialer};
pub use config::AppConfig;
pub use lifecycle::{ApplicationRunner, ShutdownCoordinator};
