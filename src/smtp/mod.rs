//! SMTP submission subsystem.
//!
//! # Data Flow
//! ```text
//! TCP accept (service.rs)
//!     → session.rs (greeting, EHLO, AUTH, MAIL/RCPT, DATA)
//!     → backend.rs (credential check, one envelope per recipient)
//!     → amqp::Publisher
//! ```
//!
//! # Design Decisions
//! - Anonymous submission is refused; every transaction needs AUTH first
//! - Plaintext AUTH is accepted; TLS is expected to be terminated elsewhere
//! - A failed publish is reported to the client as a transient error

pub mod backend;
pub mod protocol;
pub mod service;
pub mod session;

pub use backend::{Backend, QueueBackend, QueueSession, Session, SmtpError};
pub use protocol::{Command, Reply};
pub use service::SmtpService;
pub use session::SessionSettings;
