// src/rabbitmq/lapin_client.rs
// lapin-backed implementation of the transport traits

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeBindOptions, ExchangeDeclareOptions,
    ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ConnectionStatus, ExchangeKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::amqp_client::{
    AmqpChannel, AmqpConnection, AmqpConnector, ChannelSignal, ConnectionSignal, ConsumerDelivery,
    IncomingMessage, OpenedChannel, OpenedConnection, QueueInfo,
};
use super::endpoint::BrokerEndpoint;
use super::errors::{RabbitMQError, Result};

// lapin has no blocked/unblocked callback; the flag on the connection status is polled
const BLOCKED_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Connects with `lapin::Connection::connect_uri`.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self, endpoint: &BrokerEndpoint, heartbeat: u16) -> Result<OpenedConnection> {
        let mut uri: AMQPUri = endpoint
            .url()
            .parse()
            .map_err(|e: String| RabbitMQError::ConfigError(e))?;

        // An explicit heartbeat in the URL wins over the manager setting
        if uri.query.heartbeat.is_none() {
            uri.query.heartbeat = Some(heartbeat);
        }

        let mut properties = ConnectionProperties::default();
        if let Some(name) = &endpoint.options().connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        info!(url = %endpoint, heartbeat, "Opening AMQP connection");
        let connection = Connection::connect_uri(uri, properties)
            .await
            .map_err(|err| match RabbitMQError::from(err) {
                // Nothing was lost yet; this is a failed attempt
                RabbitMQError::ConnectionLost(text) => RabbitMQError::ConnectionError(text),
                other => other,
            })?;

        let (tx, signals) = mpsc::unbounded_channel();
        watch_blocked(connection.status().clone(), tx.clone());
        connection.on_error(move |err| {
            warn!("AMQP connection error: {}", err);
            let _ = tx.send(ConnectionSignal::Closed(Some(err.into())));
        });

        Ok(OpenedConnection {
            connection: Arc::new(LapinConnection { connection }),
            signals,
        })
    }
}

/// Turns successive readings of the blocked flag into signals, one per transition.
#[derive(Debug, Default)]
struct BlockedTracker {
    blocked: bool,
}

impl BlockedTracker {
    fn observe(&mut self, blocked: bool) -> Option<ConnectionSignal> {
        if blocked == self.blocked {
            return None;
        }
        self.blocked = blocked;
        Some(if blocked {
            ConnectionSignal::Blocked("connection.blocked received from broker".to_string())
        } else {
            ConnectionSignal::Unblocked
        })
    }
}

fn watch_blocked(status: ConnectionStatus, signals: mpsc::UnboundedSender<ConnectionSignal>) {
    tokio::spawn(async move {
        let mut tracker = BlockedTracker::default();
        let mut ticker = tokio::time::interval(BLOCKED_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            // Manager stopped listening or the connection is gone
            if signals.is_closed() || !status.connected() {
                return;
            }
            if let Some(signal) = tracker.observe(status.blocked()) {
                debug!("AMQP connection blocked flag changed: {:?}", signal);
                if signals.send(signal).is_err() {
                    return;
                }
            }
        }
    });
}

pub struct LapinConnection {
    connection: Connection,
}

impl fmt::Debug for LapinConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LapinConnection")
            .field("connected", &self.connection.status().connected())
            .finish()
    }
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<OpenedChannel> {
        let channel = self.connection.create_channel().await?;

        let (tx, signals) = mpsc::unbounded_channel();
        channel.on_error(move |err| {
            debug!("AMQP channel error: {}", err);
            let _ = tx.send(ChannelSignal::Closed(Some(err.into())));
        });

        Ok(OpenedChannel {
            channel: Arc::new(LapinChannel { channel }),
            signals,
        })
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            self.connection.close(200, "Closing connection").await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

pub struct LapinChannel {
    channel: Channel,
}

impl fmt::Debug for LapinChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LapinChannel")
            .field("id", &self.channel.id())
            .field("connected", &self.channel.status().connected())
            .finish()
    }
}

fn incoming(delivery: Delivery) -> IncomingMessage {
    IncomingMessage {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: delivery.properties,
        data: delivery.data,
        channel_id: 0,
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<bool> {
        // lapin buffers frames internally and never reports backpressure
        self.channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?;
        Ok(true)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
        sink: mpsc::UnboundedSender<ConsumerDelivery>,
    ) -> Result<String> {
        let mut consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, arguments)
            .await?;
        let tag = consumer.tag().as_str().to_string();

        let channel = self.channel.clone();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        if sink.send(ConsumerDelivery::Message(incoming(delivery))).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        debug!("Consumer stream error: {}", err);
                        return;
                    }
                }
            }
            // The stream also ends when the channel dies; only a live channel means a cancel
            if channel.status().connected() {
                let _ = sink.send(ConsumerDelivery::Cancelled);
            }
        });

        Ok(tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str, options: BasicCancelOptions) -> Result<()> {
        Ok(self.channel.basic_cancel(consumer_tag, options).await?)
    }

    async fn basic_qos(&self, prefetch_count: u16, options: BasicQosOptions) -> Result<()> {
        Ok(self.channel.basic_qos(prefetch_count, options).await?)
    }

    async fn basic_ack(&self, delivery_tag: u64, options: BasicAckOptions) -> Result<()> {
        Ok(self.channel.basic_ack(delivery_tag, options).await?)
    }

    async fn basic_nack(&self, delivery_tag: u64, options: BasicNackOptions) -> Result<()> {
        Ok(self.channel.basic_nack(delivery_tag, options).await?)
    }

    async fn basic_get(&self, queue: &str, options: BasicGetOptions) -> Result<Option<IncomingMessage>> {
        let message = self.channel.basic_get(queue, options).await?;
        Ok(message.map(|m| incoming(m.delivery)))
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo> {
        let declared = self.channel.queue_declare(queue, options, arguments).await?;
        Ok(QueueInfo {
            name: declared.name().as_str().to_string(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<()> {
        Ok(self
            .channel
            .queue_bind(queue, exchange, routing_key, options, arguments)
            .await?)
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        Ok(self
            .channel
            .queue_unbind(queue, exchange, routing_key, arguments)
            .await?)
    }

    async fn queue_delete(&self, queue: &str, options: QueueDeleteOptions) -> Result<u32> {
        Ok(self.channel.queue_delete(queue, options).await?)
    }

    async fn queue_purge(&self, queue: &str, options: QueuePurgeOptions) -> Result<u32> {
        Ok(self.channel.queue_purge(queue, options).await?)
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<()> {
        Ok(self
            .channel
            .exchange_declare(exchange, kind, options, arguments)
            .await?)
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: ExchangeBindOptions,
        arguments: FieldTable,
    ) -> Result<()> {
        Ok(self
            .channel
            .exchange_bind(destination, source, routing_key, options, arguments)
            .await?)
    }

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: ExchangeUnbindOptions,
        arguments: FieldTable,
    ) -> Result<()> {
        Ok(self
            .channel
            .exchange_unbind(destination, source, routing_key, options, arguments)
            .await?)
    }

    async fn exchange_delete(&self, exchange: &str, options: ExchangeDeleteOptions) -> Result<()> {
        Ok(self.channel.exchange_delete(exchange, options).await?)
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "Closing channel").await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}
