//! Broker transport seam.
//!
//! `ConnectionManager` owns connection state and topology semantics; the
//! wire protocol lives behind [`Transport`] and [`Dialer`] so the manager
//! can run against `lapin` in production and an in-memory double in tests.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure reported by the underlying messaging client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    /// Wrap a transport failure message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Close notifications of a dialed connection.
///
/// `Some(error)` reports an unexpected closure, `None` a deliberate one.
/// A dropped sender counts as a deliberate closure.
pub type CloseEvents = mpsc::UnboundedReceiver<Option<TransportError>>;

/// Exchange, queue and binding declared once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl Topology {
    /// Durable fanout exchange and a durable, shared queue bound to it.
    pub fn durable(exchange: &str, queue: &str, routing_key: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            durable: true,
            auto_delete: false,
            exclusive: false,
        }
    }
}

/// A single publish request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publishing {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub content_type: &'static str,
    pub persistent: bool,
    pub mandatory: bool,
    pub immediate: bool,
}

/// An open connection with one channel.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn declare_topology(&self, topology: &Topology) -> Result<(), TransportError>;

    /// Write one message. Broker acknowledgements are not awaited.
    async fn publish(&self, publishing: Publishing) -> Result<(), TransportError>;

    /// Whether the protocol handshake has finished and the link is usable.
    fn handshake_complete(&self) -> bool;

    async fn close_channel(&self) -> Result<(), TransportError>;

    async fn close_connection(&self) -> Result<(), TransportError>;
}

/// Opens transports.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, uri: &str) -> Result<(Box<dyn Transport>, CloseEvents), TransportError>;
}
