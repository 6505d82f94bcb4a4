//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Connect broker → Register probes → Bind listeners → Run services
//!
//! Running (runner.rs):
//!     Every Service on its own task under one cancellation scope
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → Cancel scope → Services drain and return → Exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: broker first, then probes, then listeners
//! - The first failing service stops all others
//! - Shutdown has timeouts: HTTP and SMTP drains are bounded

pub mod runner;
pub mod service;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use runner::{ApplicationRunner, RunError};
pub use service::{Service, ServiceError};
pub use shutdown::{CompletionBarrier, ShutdownCoordinator, ShutdownError};
pub use startup::StartupError;
