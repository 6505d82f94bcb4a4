//! `lapin`-backed transport.

use async_trait::async_trait;
use lapin::options::{
    BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::mpsc;

use crate::amqp::transport::{CloseEvents, Dialer, Publishing, Topology, Transport, TransportError};

const REPLY_SUCCESS: u16 = 200;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        TransportError(err.to_string())
    }
}

/// Dials AMQP 0-9-1 brokers with `lapin`.
#[derive(Default, Clone)]
pub struct LapinDialer {
    properties: ConnectionProperties,
}

impl LapinDialer {
    /// Create a dialer using the current Tokio runtime.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Dialer for LapinDialer {
    async fn dial(&self, uri: &str) -> Result<(Box<dyn Transport>, CloseEvents), TransportError> {
        let connection = Connection::connect(uri, self.properties.clone()).await?;

        let (events, rx) = mpsc::unbounded_channel();
        let on_error = events.clone();
        connection.on_error(move |err| {
            let _ = on_error.send(Some(TransportError::from(err)));
        });

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "channel open failed").await;
                return Err(e.into());
            }
        };

        Ok((
            Box::new(LapinTransport {
                connection,
                channel,
                events,
            }),
            rx,
        ))
    }
}

/// One `lapin` connection and its publishing channel.
pub struct LapinTransport {
    connection: Connection,
    channel: Channel,
    events: mpsc::UnboundedSender<Option<TransportError>>,
}

#[async_trait]
impl Transport for LapinTransport {
    async fn declare_topology(&self, topology: &Topology) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: topology.durable,
                    auto_delete: topology.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .queue_declare(
                &topology.queue,
                QueueDeclareOptions {
                    durable: topology.durable,
                    exclusive: topology.exclusive,
                    auto_delete: topology.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .queue_bind(
                &topology.queue,
                &topology.exchange,
                &topology.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    async fn publish(&self, publishing: Publishing) -> Result<(), TransportError> {
        let mut properties =
            BasicProperties::default().with_content_type(ShortString::from(publishing.content_type));
        if publishing.persistent {
            properties = properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        }

        // The returned confirmation is dropped: publishing is fire-and-forget.
        let _confirm = self
            .channel
            .basic_publish(
                &publishing.exchange,
                &publishing.routing_key,
                BasicPublishOptions {
                    mandatory: publishing.mandatory,
                    immediate: publishing.immediate,
                },
                &publishing.payload,
                properties,
            )
            .await?;

        Ok(())
    }

    fn handshake_complete(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close_channel(&self) -> Result<(), TransportError> {
        self.channel.close(REPLY_SUCCESS, "shutdown").await?;
        Ok(())
    }

    async fn close_connection(&self) -> Result<(), TransportError> {
        self.connection.close(REPLY_SUCCESS, "shutdown").await?;
        let _ = self.events.send(None);
        Ok(())
    }
}
