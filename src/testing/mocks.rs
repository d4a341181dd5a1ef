//! In-memory AMQP transport
//!
//! A [`MockConnector`] hands out [`MockConnection`]s that all talk to one shared
//! [`MockBroker`]. Tests drive failures from the outside: make a URL unreachable,
//! refuse a login, drop a connection, close a channel, delete a queue under a
//! consumer, report backpressure on publish, or hold publishes mid-send.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeBindOptions, ExchangeDeclareOptions,
    ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};
use tokio::sync::{mpsc, watch};

use crate::rabbitmq::amqp_client::{
    AmqpChannel, AmqpConnection, AmqpConnector, ChannelSignal, ConnectionSignal,
    ConsumerDelivery, IncomingMessage, OpenedChannel, OpenedConnection, QueueInfo,
};
use crate::rabbitmq::endpoint::BrokerEndpoint;
use crate::rabbitmq::errors::{RabbitMQError, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Channel operations recorded in call order. Publishes are kept on the broker instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    ExchangeDeclare(String),
    ExchangeBind(String, String, String),
    ExchangeUnbind(String, String, String),
    ExchangeDelete(String),
    QueueDeclare(String),
    QueueBind(String, String, String),
    QueueUnbind(String, String, String),
    QueueDelete(String),
    QueuePurge(String),
    Qos(u16),
    Consume(String, String),
    Cancel(String),
    Ack(u64, bool),
    Nack(u64, bool, bool),
    Get(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub channel_id: u64,
}

#[derive(Debug)]
struct MockConsumer {
    tag: String,
    queue: String,
    channel_id: u64,
    sink: mpsc::UnboundedSender<ConsumerDelivery>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: BTreeSet<String>,
    exchanges: BTreeSet<String>,
    published: Vec<PublishedMessage>,
    consumers: Vec<MockConsumer>,
    next_consumer_tag: u64,
    next_delivery_tag: u64,
    next_queue_name: u64,
}

/// Broker-side state shared by every connection from one connector.
#[derive(Debug, Clone)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    next_channel_id: Arc<AtomicU64>,
    publish_gate: Arc<watch::Sender<bool>>,
    held_publishes: Arc<AtomicUsize>,
}

impl Default for MockBroker {
    fn default() -> Self {
        let (publish_gate, _) = watch::channel(false);
        Self {
            state: Arc::default(),
            next_channel_id: Arc::default(),
            publish_gate: Arc::new(publish_gate),
            held_publishes: Arc::default(),
        }
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park every publish, on any channel, until `release_publishes`.
    pub fn hold_publishes(&self) {
        self.publish_gate.send_replace(true);
    }

    pub fn release_publishes(&self) {
        self.publish_gate.send_replace(false);
    }

    /// Publishes currently parked by `hold_publishes`.
    pub fn held_publishes(&self) -> usize {
        self.held_publishes.load(Ordering::SeqCst)
    }

    async fn pass_publish_gate(&self) {
        let mut gate = self.publish_gate.subscribe();
        if !*gate.borrow() {
            return;
        }
        self.held_publishes.fetch_add(1, Ordering::SeqCst);
        let _ = gate.wait_for(|held| !*held).await;
        self.held_publishes.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state).published.clone()
    }

    pub fn published_payloads(&self) -> Vec<Vec<u8>> {
        lock(&self.state)
            .published
            .iter()
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        lock(&self.state).queues.contains(queue)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        lock(&self.state).exchanges.contains(exchange)
    }

    pub fn add_queue(&self, queue: &str) {
        lock(&self.state).queues.insert(queue.to_string());
    }

    /// Delete a queue from outside any channel; its consumers get a broker cancel.
    pub fn delete_queue(&self, queue: &str) -> bool {
        let existed = lock(&self.state).queues.remove(queue);
        self.cancel_consumers(queue);
        existed
    }

    /// Cancel every consumer on `queue` from the broker side. Returns how many.
    pub fn cancel_consumers(&self, queue: &str) -> usize {
        let cancelled: Vec<MockConsumer> = {
            let mut state = lock(&self.state);
            let (gone, kept) = std::mem::take(&mut state.consumers)
                .into_iter()
                .partition(|c| c.queue == queue);
            state.consumers = kept;
            gone
        };
        for consumer in &cancelled {
            let _ = consumer.sink.send(ConsumerDelivery::Cancelled);
        }
        cancelled.len()
    }

    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        lock(&self.state)
            .consumers
            .iter()
            .filter(|c| c.queue == queue)
            .map(|c| c.tag.clone())
            .collect()
    }

    /// Deliver a message to the first consumer on `queue`. Returns false when
    /// nobody is consuming.
    pub fn deliver(&self, queue: &str, payload: &[u8]) -> bool {
        let mut state = lock(&self.state);
        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;
        let Some(consumer) = state.consumers.iter().find(|c| c.queue == queue) else {
            return false;
        };
        let message = IncomingMessage {
            delivery_tag,
            exchange: String::new(),
            routing_key: queue.to_string(),
            redelivered: false,
            properties: BasicProperties::default(),
            data: payload.to_vec(),
            channel_id: 0,
        };
        consumer.sink.send(ConsumerDelivery::Message(message)).is_ok()
    }

    fn next_channel_id(&self) -> u64 {
        self.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn drop_consumers_on(&self, channel_id: u64) {
        lock(&self.state).consumers.retain(|c| c.channel_id != channel_id);
    }
}

#[derive(Debug)]
struct ChannelInner {
    id: u64,
    broker: MockBroker,
    open: AtomicBool,
    connection_lost: AtomicBool,
    signals: Mutex<Option<mpsc::UnboundedSender<ChannelSignal>>>,
    calls: Mutex<Vec<MockCall>>,
    full_after: Mutex<Option<usize>>,
    publish_error: Mutex<Option<RabbitMQError>>,
}

/// One channel on a mock connection. Clones observe the same channel.
#[derive(Debug, Clone)]
pub struct MockChannel {
    inner: Arc<ChannelInner>,
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChannel {
    /// A detached channel with its own broker, for exercising single operations.
    pub fn new() -> Self {
        Self::build(MockBroker::new(), None)
    }

    fn build(broker: MockBroker, signals: Option<mpsc::UnboundedSender<ChannelSignal>>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id: broker.next_channel_id(),
                broker,
                open: AtomicBool::new(true),
                connection_lost: AtomicBool::new(false),
                signals: Mutex::new(signals),
                calls: Mutex::new(Vec::new()),
                full_after: Mutex::new(None),
                publish_error: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn broker(&self) -> &MockBroker {
        &self.inner.broker
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.inner.calls).clone()
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.open.load(Ordering::SeqCst)
    }

    /// After `sends` more successful publishes, the next one reports no room.
    pub fn report_full_after(&self, sends: usize) {
        *lock(&self.inner.full_after) = Some(sends);
    }

    /// Tell the wrapper the broker buffer has room again.
    pub fn drain(&self) {
        if let Some(signals) = lock(&self.inner.signals).as_ref() {
            let _ = signals.send(ChannelSignal::Drain);
        }
    }

    /// Make every publish fail with `error` until cleared with `None`.
    pub fn fail_publishes(&self, error: Option<RabbitMQError>) {
        *lock(&self.inner.publish_error) = error;
    }

    /// Broker-initiated channel close.
    pub fn close_from_broker(&self, error: RabbitMQError) {
        self.shut(Some(error));
    }

    fn shut(&self, error: Option<RabbitMQError>) {
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.broker.drop_consumers_on(self.inner.id);
        if let Some(signals) = lock(&self.inner.signals).take() {
            let _ = signals.send(ChannelSignal::Closed(error));
        }
    }

    fn record(&self, call: MockCall) {
        lock(&self.inner.calls).push(call);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.open.load(Ordering::SeqCst) {
            Ok(())
        } else if self.inner.connection_lost.load(Ordering::SeqCst) {
            // What lapin reports for calls on a channel whose socket died
            Err(RabbitMQError::ConnectionLost(
                "invalid connection state: Closed".to_string(),
            ))
        } else {
            Err(RabbitMQError::ChannelClosed(format!(
                "channel {} is closed",
                self.inner.id
            )))
        }
    }

    fn not_found(queue: &str) -> RabbitMQError {
        RabbitMQError::NotFound(format!("NOT_FOUND - no queue '{}' in vhost '/'", queue))
    }
}

#[async_trait]
impl AmqpChannel for MockChannel {
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _options: BasicPublishOptions,
        payload: &[u8],
        _properties: BasicProperties,
    ) -> Result<bool> {
        self.inner.broker.pass_publish_gate().await;
        self.ensure_open()?;
        if let Some(error) = lock(&self.inner.publish_error).clone() {
            return Err(error);
        }

        lock(&self.inner.broker.state).published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            channel_id: self.inner.id,
        });

        let mut full_after = lock(&self.inner.full_after);
        let room = match *full_after {
            Some(0) => {
                *full_after = None;
                false
            }
            Some(remaining) => {
                *full_after = Some(remaining - 1);
                true
            }
            None => true,
        };
        Ok(room)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _options: BasicConsumeOptions,
        _arguments: FieldTable,
        sink: mpsc::UnboundedSender<ConsumerDelivery>,
    ) -> Result<String> {
        self.ensure_open()?;
        if !self.inner.broker.has_queue(queue) {
            // A 404 on consume closes the channel, as on a real broker
            let error = Self::not_found(queue);
            self.shut(Some(error.clone()));
            return Err(error);
        }

        let tag = {
            let mut state = lock(&self.inner.broker.state);
            let tag = if consumer_tag.is_empty() {
                state.next_consumer_tag += 1;
                format!("amq.ctag-{}", state.next_consumer_tag)
            } else {
                consumer_tag.to_string()
            };
            state.consumers.push(MockConsumer {
                tag: tag.clone(),
                queue: queue.to_string(),
                channel_id: self.inner.id,
                sink,
            });
            tag
        };
        self.record(MockCall::Consume(queue.to_string(), tag.clone()));
        Ok(tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str, _options: BasicCancelOptions) -> Result<()> {
        self.ensure_open()?;
        self.record(MockCall::Cancel(consumer_tag.to_string()));
        lock(&self.inner.broker.state)
            .consumers
            .retain(|c| c.tag != consumer_tag);
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16, _options: BasicQosOptions) -> Result<()> {
        self.ensure_open()?;
        self.record(MockCall::Qos(prefetch_count));
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64, options: BasicAckOptions) -> Result<()> {
        self.ensure_open()?;
        self.record(MockCall::Ack(delivery_tag, options.multiple));
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, options: BasicNackOptions) -> Result<()> {
        self.ensure_open()?;
        self.record(MockCall::Nack(delivery_tag, options.multiple, options.requeue));
        Ok(())
    }

    async fn basic_get(&self, queue: &str, _options: BasicGetOptions) -> Result<Option<IncomingMessage>> {
        self.ensure_open()?;
        self.record(MockCall::Get(queue.to_string()));
        if !self.inner.broker.has_queue(queue) {
            return Err(Self::not_found(queue));
        }
        Ok(None)
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<QueueInfo> {
        self.ensure_open()?;
        let mut state = lock(&self.inner.broker.state);
        let name = if queue.is_empty() {
            state.next_queue_name += 1;
            format!("amq.gen-{}", state.next_queue_name)
        } else {
            queue.to_string()
        };

        if options.passive && !state.queues.contains(&name) {
            return Err(Self::not_found(&name));
        }
        state.queues.insert(name.clone());
        let consumer_count = state.consumers.iter().filter(|c| c.queue == name).count() as u32;
        drop(state);

        self.record(MockCall::QueueDeclare(name.clone()));
        Ok(QueueInfo {
            name,
            message_count: 0,
            consumer_count,
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _options: QueueBindOptions,
        _arguments: FieldTable,
    ) -> Result<()> {
        self.ensure_open()?;
        self.record(MockCall::QueueBind(
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<()> {
        self.ensure_open()?;
        self.record(MockCall::QueueUnbind(
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn queue_delete(&self, queue: &str, _options: QueueDeleteOptions) -> Result<u32> {
        self.ensure_open()?;
        self.record(MockCall::QueueDelete(queue.to_string()));
        self.inner.broker.delete_queue(queue);
        Ok(0)
    }

    async fn queue_purge(&self, queue: &str, _options: QueuePurgeOptions) -> Result<u32> {
        self.ensure_open()?;
        self.record(MockCall::QueuePurge(queue.to_string()));
        Ok(0)
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        _kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<()> {
        self.ensure_open()?;
        {
            let mut state = lock(&self.inner.broker.state);
            if options.passive && !state.exchanges.contains(exchange) {
                return Err(RabbitMQError::NotFound(format!(
                    "NOT_FOUND - no exchange '{}' in vhost '/'",
                    exchange
                )));
            }
            state.exchanges.insert(exchange.to_string());
        }
        self.record(MockCall::ExchangeDeclare(exchange.to_string()));
        Ok(())
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        _options: ExchangeBindOptions,
        _arguments: FieldTable,
    ) -> Result<()> {
        self.ensure_open()?;
        self.record(MockCall::ExchangeBind(
            destination.to_string(),
            source.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        _options: ExchangeUnbindOptions,
        _arguments: FieldTable,
    ) -> Result<()> {
        self.ensure_open()?;
        self.record(MockCall::ExchangeUnbind(
            destination.to_string(),
            source.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn exchange_delete(&self, exchange: &str, _options: ExchangeDeleteOptions) -> Result<()> {
        self.ensure_open()?;
        self.record(MockCall::ExchangeDelete(exchange.to_string()));
        lock(&self.inner.broker.state).exchanges.remove(exchange);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shut(None);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct ConnectionInner {
    url: String,
    broker: MockBroker,
    open: AtomicBool,
    refuse_channels: AtomicBool,
    signals: Mutex<Option<mpsc::UnboundedSender<ConnectionSignal>>>,
    channels: Mutex<Vec<MockChannel>>,
}

/// A connection handed out by [`MockConnector`].
#[derive(Debug, Clone)]
pub struct MockConnection {
    inner: Arc<ConnectionInner>,
}

impl MockConnection {
    fn open(url: &str, broker: MockBroker, signals: mpsc::UnboundedSender<ConnectionSignal>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                url: url.to_string(),
                broker,
                open: AtomicBool::new(true),
                refuse_channels: AtomicBool::new(false),
                signals: Mutex::new(Some(signals)),
                channels: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn channels(&self) -> Vec<MockChannel> {
        lock(&self.inner.channels).clone()
    }

    pub fn last_channel(&self) -> Option<MockChannel> {
        lock(&self.inner.channels).last().cloned()
    }

    /// Make `create_channel` fail while set.
    pub fn refuse_channels(&self, refuse: bool) {
        self.inner.refuse_channels.store(refuse, Ordering::SeqCst);
    }

    pub fn block(&self, reason: &str) {
        self.signal(ConnectionSignal::Blocked(reason.to_string()));
    }

    pub fn unblock(&self) {
        self.signal(ConnectionSignal::Unblocked);
    }

    /// Simulate the broker or network dropping the connection.
    pub fn drop_connection(&self) {
        self.shut(Some(RabbitMQError::ConnectionError(
            "connection reset by peer".to_string(),
        )));
    }

    fn signal(&self, signal: ConnectionSignal) {
        if let Some(signals) = lock(&self.inner.signals).as_ref() {
            let _ = signals.send(signal);
        }
    }

    fn shut(&self, error: Option<RabbitMQError>) {
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return;
        }
        for channel in self.channels() {
            if error.is_some() {
                channel.inner.connection_lost.store(true, Ordering::SeqCst);
            }
            channel.shut(error.clone());
        }
        if let Some(signals) = lock(&self.inner.signals).take() {
            let _ = signals.send(ConnectionSignal::Closed(error));
        }
    }
}

#[async_trait]
impl AmqpConnection for MockConnection {
    async fn create_channel(&self) -> Result<OpenedChannel> {
        if !self.is_connected() {
            return Err(RabbitMQError::ConnectionError(
                "connection is closed".to_string(),
            ));
        }
        if self.inner.refuse_channels.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ChannelError(
                "could not open channel".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = MockChannel::build(self.inner.broker.clone(), Some(tx));
        lock(&self.inner.channels).push(channel.clone());
        Ok(OpenedChannel {
            channel: Arc::new(channel),
            signals: rx,
        })
    }

    async fn close(&self) -> Result<()> {
        self.shut(None);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    unreachable: BTreeSet<String>,
    refused: BTreeSet<String>,
    hanging: BTreeSet<String>,
    attempts: Vec<String>,
    connections: Vec<MockConnection>,
}

/// Connector over the in-memory broker. Every URL is reachable unless told otherwise.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
    broker: MockBroker,
}

enum Outcome {
    Connect,
    Unreachable,
    Refused,
    Hang,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broker(&self) -> &MockBroker {
        &self.broker
    }

    pub fn set_reachable(&self, url: &str, reachable: bool) {
        let mut state = lock(&self.state);
        if reachable {
            state.unreachable.remove(url);
        } else {
            state.unreachable.insert(url.to_string());
        }
    }

    /// Reject logins to `url` with ACCESS_REFUSED.
    pub fn refuse(&self, url: &str) {
        lock(&self.state).refused.insert(url.to_string());
    }

    /// Connect attempts to `url` never complete.
    pub fn set_hanging(&self, url: &str, hanging: bool) {
        let mut state = lock(&self.state);
        if hanging {
            state.hanging.insert(url.to_string());
        } else {
            state.hanging.remove(url);
        }
    }

    /// URLs of every connect attempt, in order.
    pub fn attempts(&self) -> Vec<String> {
        lock(&self.state).attempts.clone()
    }

    pub fn connections(&self) -> Vec<MockConnection> {
        lock(&self.state).connections.clone()
    }

    pub fn last_connection(&self) -> Option<MockConnection> {
        lock(&self.state).connections.last().cloned()
    }
}

#[async_trait]
impl AmqpConnector for MockConnector {
    async fn connect(&self, endpoint: &BrokerEndpoint, _heartbeat: u16) -> Result<OpenedConnection> {
        let url = endpoint.url().to_string();
        let outcome = {
            let mut state = lock(&self.state);
            state.attempts.push(url.clone());
            if state.hanging.contains(&url) {
                Outcome::Hang
            } else if state.refused.contains(&url) {
                Outcome::Refused
            } else if state.unreachable.contains(&url) {
                Outcome::Unreachable
            } else {
                Outcome::Connect
            }
        };

        match outcome {
            Outcome::Hang => {
                futures::future::pending::<()>().await;
                Err(RabbitMQError::TimeoutError("connect never completed".to_string()))
            }
            Outcome::Refused => Err(RabbitMQError::AccessRefused(
                "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN".to_string(),
            )),
            Outcome::Unreachable => Err(RabbitMQError::ConnectionError(format!(
                "Connection refused (os error 111) for {}",
                endpoint.redacted_url()
            ))),
            Outcome::Connect => {
                let (tx, rx) = mpsc::unbounded_channel();
                let connection = MockConnection::open(&url, self.broker.clone(), tx);
                lock(&self.state).connections.push(connection.clone());
                Ok(OpenedConnection {
                    connection: Arc::new(connection),
                    signals: rx,
                })
            }
        }
    }
}
