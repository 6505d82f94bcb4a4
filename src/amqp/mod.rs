//! Outbound message queue subsystem.
//!
//! # Data Flow
//! ```text
//! SMTP session accepts a message
//!     → envelope.rs (one Envelope per recipient, JSON wire format)
//!     → connection.rs (state check, serialized publish)
//!     → transport.rs (Transport seam)
//!     → lapin_transport.rs (AMQP 0-9-1 on the wire)
//!
//! Close notifications
//!     → connection.rs watcher (Ready → Closed)
//!     → health probe fails, publishes fail fast
//! ```

pub mod connection;
pub mod envelope;
pub mod lapin_transport;
pub mod transport;

pub use connection::{ConnectError, ConnectionManager, ConnectionState, PublishError, Publisher};
pub use envelope::Envelope;
pub use lapin_transport::LapinDialer;
pub use transport::{Dialer, Publishing, Topology, Transport, TransportError};
