//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection (smtp::service accept loop)
//!     → connection.rs (session guard, unique session ID)
//!     → smtp::session (protocol dialogue)
//!     → guard dropped when the session ends
//! ```
//!
//! # Design Decisions
//! - Each session tracked for graceful shutdown
//! - Open-session count doubles as the liveness signal

pub mod connection;

pub use connection::{SessionGuard, SessionId, SessionTracker};
