//! Broker connection lifecycle.
//!
//! # Responsibilities
//! - Dial the broker and declare the topology
//! - Publish envelopes while the connection is ready
//! - Detect asynchronous closure and invalidate publishing
//! - Report connection health
//! - Close channel then connection on shutdown
//!
//! # State Transitions
//! ```text
//! Disconnected → Connecting → Ready      (connect succeeded)
//! Connecting   → Disconnected            (any connect step failed)
//! Ready        → Closed                  (close event | shutdown)
//! ```
//!
//! # Design Decisions
//! - `Closed` is terminal: there is no reconnect, a new manager is required
//! - State lives in an atomic so publish and health checks never lock
//! - Publishes are serialized by one async mutex around the shared channel

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::amqp::envelope::Envelope;
use crate::amqp::transport::{CloseEvents, Dialer, Publishing, Topology, Transport, TransportError};
use crate::config::AmqpConfig;
use crate::health::probe::{Probe, ProbeError};
use crate::lifecycle::service::{Service, ServiceError};
use crate::observability::metrics;

const CONTENT_TYPE_JSON: &str = "application/json";

/// Connection state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Ready = 2,
    Closed = 3,
}

impl From<u8> for ConnectionState {
    fn from(val: u8) -> Self {
        match val {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Ready,
            3 => ConnectionState::Closed,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Startup failure: dial or topology declaration.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid broker URI: {0}")]
    Uri(#[from] url::ParseError),

    #[error("failed to dial broker: {0}")]
    Dial(TransportError),

    #[error("failed to declare topology: {0}")]
    Topology(TransportError),

    #[error("connection is {0:?}, expected Disconnected")]
    InvalidState(ConnectionState),
}

/// Failure of a single publish.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("failed to encode envelope: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("publish failed: {0}")]
    Transport(TransportError),
}

/// Anything that can hand envelopes to the queue.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError>;
}

struct Link {
    transport: Box<dyn Transport>,
    channel_open: AtomicBool,
}

struct Shared {
    state: AtomicU8,
    link: ArcSwapOption<Link>,
    close_cause: ArcSwapOption<TransportError>,
    closed: CancellationToken,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    /// Move `Ready → Closed`. Returns false if the connection was not ready.
    fn mark_closed(&self, cause: Option<TransportError>) -> bool {
        let transitioned = self
            .state
            .compare_exchange(
                ConnectionState::Ready as u8,
                ConnectionState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if transitioned {
            match &cause {
                Some(err) => tracing::error!(error = %err, "AMQP connection closed unexpectedly"),
                None => tracing::info!("AMQP connection closed"),
            }
            if let Some(err) = cause {
                self.close_cause.store(Some(Arc::new(err)));
            }
            metrics::record_connection_ready(false);
            self.closed.cancel();
        }

        transitioned
    }
}

/// Owner of the single outbound broker connection.
pub struct ConnectionManager {
    config: AmqpConfig,
    shared: Arc<Shared>,
    publish_lock: Mutex<()>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state.
    pub fn new(config: AmqpConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                link: ArcSwapOption::empty(),
                close_cause: ArcSwapOption::empty(),
                closed: CancellationToken::new(),
            }),
            publish_lock: Mutex::new(()),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Dial the broker and declare the topology.
    ///
    /// On any failure the manager is left `Disconnected` and whatever was
    /// opened is closed again.
    pub async fn connect(&self, dialer: &dyn Dialer) -> Result<(), ConnectError> {
        if let Err(current) = self.shared.state.compare_exchange(
            ConnectionState::Disconnected as u8,
            ConnectionState::Connecting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(ConnectError::InvalidState(current.into()));
        }

        match self.establish(dialer).await {
            Ok((link, events)) => {
                self.shared.link.store(Some(Arc::new(link)));
                self.shared
                    .state
                    .store(ConnectionState::Ready as u8, Ordering::Release);
                metrics::record_connection_ready(true);
                spawn_close_watcher(Arc::clone(&self.shared), events);

                tracing::info!(
                    host = %self.config.host,
                    port = self.config.port,
                    exchange = %self.config.exchange_name(),
                    queue = %self.config.queue,
                    routing_key = %self.config.routing_key,
                    "AMQP connection ready"
                );
                Ok(())
            }
            Err(e) => {
                self.shared
                    .state
                    .store(ConnectionState::Disconnected as u8, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn establish(&self, dialer: &dyn Dialer) -> Result<(Link, CloseEvents), ConnectError> {
        let uri = self.config.uri()?;
        let (transport, events) = dialer
            .dial(uri.as_str())
            .await
            .map_err(ConnectError::Dial)?;

        let topology = Topology::durable(
            self.config.exchange_name(),
            &self.config.queue,
            &self.config.routing_key,
        );
        if let Err(e) = transport.declare_topology(&topology).await {
            let _ = transport.close_channel().await;
            let _ = transport.close_connection().await;
            return Err(ConnectError::Topology(e));
        }

        Ok((
            Link {
                transport,
                channel_open: AtomicBool::new(true),
            },
            events,
        ))
    }

    /// Point-in-time health of the connection.
    pub fn check(&self) -> Result<(), ProbeError> {
        check_link(&self.shared)
    }

    /// Health probe backed by this manager's state.
    pub fn probe(&self) -> Probe {
        let shared = Arc::clone(&self.shared);
        Probe::new(move || check_link(&shared))
    }

    /// Close channel then connection.
    ///
    /// A handle is dropped once its close succeeded. The first error is
    /// reported; the connection is closed even if the channel close failed.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        let _guard = self.publish_lock.lock().await;

        let state = self.shared.state();
        if state != ConnectionState::Closed {
            self.shared
                .state
                .store(ConnectionState::Closed as u8, Ordering::Release);
            if state == ConnectionState::Ready {
                metrics::record_connection_ready(false);
            }
        }

        let Some(link) = self.shared.link.load_full() else {
            self.shared.closed.cancel();
            return Ok(());
        };

        let mut first_error = None;

        if link.channel_open.load(Ordering::Acquire) {
            match link.transport.close_channel().await {
                Ok(()) => link.channel_open.store(false, Ordering::Release),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to close AMQP channel");
                    first_error = Some(ServiceError::Close {
                        stage: "channel",
                        source: e,
                    });
                }
            }
        }

        match link.transport.close_connection().await {
            Ok(()) => self.shared.link.store(None),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to close AMQP connection");
                if first_error.is_none() {
                    first_error = Some(ServiceError::Close {
                        stage: "connection",
                        source: e,
                    });
                }
            }
        }

        self.shared.closed.cancel();

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("AMQP connection shut down");
                Ok(())
            }
        }
    }
}

fn check_link(shared: &Shared) -> Result<(), ProbeError> {
    if shared.state() != ConnectionState::Ready {
        return Err(ProbeError::ConnectionClosed);
    }
    let link = shared.link.load();
    match &*link {
        Some(link) if link.transport.handshake_complete() => Ok(()),
        Some(_) => Err(ProbeError::HandshakeIncomplete),
        None => Err(ProbeError::ConnectionClosed),
    }
}

fn spawn_close_watcher(shared: Arc<Shared>, mut events: CloseEvents) {
    tokio::spawn(async move {
        tokio::select! {
            event = events.recv() => {
                shared.mark_closed(event.flatten());
            }
            _ = shared.closed.cancelled() => {}
        }
    });
}

#[async_trait]
impl Publisher for ConnectionManager {
    async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError> {
        if self.shared.state() != ConnectionState::Ready {
            metrics::record_publish("closed");
            return Err(PublishError::ConnectionClosed);
        }

        let payload = envelope.to_wire()?;
        let publishing = Publishing {
            exchange: self.config.exchange_name().to_string(),
            routing_key: self.config.routing_key.clone(),
            payload,
            content_type: CONTENT_TYPE_JSON,
            persistent: true,
            mandatory: false,
            immediate: false,
        };

        let _guard = self.publish_lock.lock().await;

        // Shutdown may have won the lock race.
        if self.shared.state() != ConnectionState::Ready {
            metrics::record_publish("closed");
            return Err(PublishError::ConnectionClosed);
        }
        let Some(link) = self.shared.link.load_full() else {
            metrics::record_publish("closed");
            return Err(PublishError::ConnectionClosed);
        };

        match link.transport.publish(publishing).await {
            Ok(()) => {
                metrics::record_publish("ok");
                tracing::debug!(recipient = %envelope.recipient(), "Envelope published");
                Ok(())
            }
            Err(e) => {
                metrics::record_publish("error");
                Err(PublishError::Transport(e))
            }
        }
    }
}

#[async_trait]
impl Service for ConnectionManager {
    fn name(&self) -> &str {
        "amqp"
    }

    /// Hold the connection until cancellation or an unexpected close.
    async fn run(&self, token: CancellationToken) -> Result<(), ServiceError> {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::info!("Closing AMQP connection");
                self.shutdown().await
            }
            _ = self.shared.closed.cancelled() => {
                match self.shared.close_cause.load_full() {
                    Some(cause) => Err(ServiceError::ConnectionLost((*cause).clone())),
                    None => Ok(()),
                }
            }
        }
    }
}
