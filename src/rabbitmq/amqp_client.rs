// src/rabbitmq/amqp_client.rs
// The boundary between the resilience layer and the wire-level AMQP client.
// Everything above this module talks to these traits; `lapin_client` is the
// production implementation and `testing::mocks` the in-memory one.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeBindOptions, ExchangeDeclareOptions,
    ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};
use tokio::sync::mpsc;

use super::endpoint::BrokerEndpoint;
use super::errors::Result;

/// Connection-level notifications pushed by the transport.
#[derive(Debug, Clone)]
pub enum ConnectionSignal {
    /// The connection is gone; `None` means a clean close.
    Closed(Option<super::RabbitMQError>),
    Blocked(String),
    Unblocked,
}

/// Channel-level notifications pushed by the transport.
#[derive(Debug, Clone)]
pub enum ChannelSignal {
    Closed(Option<super::RabbitMQError>),
    /// Broker-side buffer has room again after a send reported backpressure.
    Drain,
}

/// What a subscription hands back to its consumer loop.
#[derive(Debug, Clone)]
pub enum ConsumerDelivery {
    Message(IncomingMessage),
    /// The broker cancelled the subscription (queue deleted, node failover, ...).
    Cancelled,
}

/// A delivered message, detached from the transport's own delivery type.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    /// Wrapper channel this message arrived on; stamped by the channel wrapper.
    pub channel_id: u64,
}

/// Result of a passive or active queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A freshly opened connection and the stream of its notifications.
pub struct OpenedConnection {
    pub connection: Arc<dyn AmqpConnection>,
    pub signals: mpsc::UnboundedReceiver<ConnectionSignal>,
}

/// A freshly opened channel and the stream of its notifications.
pub struct OpenedChannel {
    pub channel: Arc<dyn AmqpChannel>,
    pub signals: mpsc::UnboundedReceiver<ChannelSignal>,
}

/// Opens connections to a broker endpoint.
#[async_trait]
pub trait AmqpConnector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &BrokerEndpoint, heartbeat: u16) -> Result<OpenedConnection>;
}

/// A live broker connection.
#[async_trait]
pub trait AmqpConnection: Send + Sync + Debug {
    async fn create_channel(&self) -> Result<OpenedChannel>;

    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// The primitives the channel wrapper forwards to.
#[async_trait]
pub trait AmqpChannel: Send + Sync + Debug {
    /// Returns whether the broker-side buffer still has room for more sends.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<bool>;

    /// Subscribes and returns the broker-assigned consumer tag. Deliveries, and a
    /// final `Cancelled` if the broker cancels, go to `sink`.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
        sink: mpsc::UnboundedSender<ConsumerDelivery>,
    ) -> Result<String>;

    async fn basic_cancel(&self, consumer_tag: &str, options: BasicCancelOptions) -> Result<()>;

    async fn basic_qos(&self, prefetch_count: u16, options: BasicQosOptions) -> Result<()>;

    async fn basic_ack(&self, delivery_tag: u64, options: BasicAckOptions) -> Result<()>;

    async fn basic_nack(&self, delivery_tag: u64, options: BasicNackOptions) -> Result<()>;

    async fn basic_get(&self, queue: &str, options: BasicGetOptions) -> Result<Option<IncomingMessage>>;

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<()>;

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()>;

    async fn queue_delete(&self, queue: &str, options: QueueDeleteOptions) -> Result<u32>;

    async fn queue_purge(&self, queue: &str, options: QueuePurgeOptions) -> Result<u32>;

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<()>;

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: ExchangeBindOptions,
        arguments: FieldTable,
    ) -> Result<()>;

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: ExchangeUnbindOptions,
        arguments: FieldTable,
    ) -> Result<()>;

    async fn exchange_delete(&self, exchange: &str, options: ExchangeDeleteOptions) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}
