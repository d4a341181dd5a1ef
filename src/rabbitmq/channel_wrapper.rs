// src/rabbitmq/channel_wrapper.rs
// Caller-facing channel that survives reconnects: queued publishes, setup re-runs,
// consumer re-registration and a flow-control-aware publish worker.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::join_all;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicGetOptions, BasicNackOptions, BasicQosOptions,
    ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::ExchangeKind;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use super::amqp_client::{AmqpChannel, ChannelSignal, ConsumerDelivery, IncomingMessage, QueueInfo};
use super::connection::{ConnectionEvent, ConnectionManager, LiveConnection};
use super::consumer::{ConsumeOptions, ConsumerRegistry, MessageHandler};
use super::errors::{RabbitMQError, Result};
use super::publisher::{OutboundQueue, PendingMessage, PublishOptions, PUBLISH_BATCH_SIZE};
use super::setup::{SetupAction, SetupPipeline};

const EVENT_BUFFER: usize = 64;

fn channel_closed() -> RabbitMQError {
    RabbitMQError::ChannelClosed("Channel closed".to_string())
}

/// Notifications from a channel wrapper.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A new channel is set up, consumers are subscribed and queued messages are flowing.
    Connect,
    /// An asynchronous failure with no caller to reject (setup, background re-subscription).
    Error {
        error: RabbitMQError,
        name: Option<String>,
    },
    Close,
}

/// Construction options for a channel wrapper.
#[derive(Clone, Default)]
pub struct ChannelWrapperOptions {
    pub name: Option<String>,
    pub setup: Vec<Arc<dyn SetupAction>>,
}

impl ChannelWrapperOptions {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            setup: Vec::new(),
        }
    }

    pub fn setup(mut self, action: Arc<dyn SetupAction>) -> Self {
        self.setup.push(action);
        self
    }
}

/// Fluent construction over [`ChannelWrapperOptions`].
pub struct ChannelWrapperBuilder {
    manager: ConnectionManager,
    options: ChannelWrapperOptions,
}

impl ChannelWrapperBuilder {
    pub fn name(mut self, name: &str) -> Self {
        self.options.name = Some(name.to_string());
        self
    }

    pub fn setup(mut self, action: Arc<dyn SetupAction>) -> Self {
        self.options.setup.push(action);
        self
    }

    pub fn build(self) -> ChannelWrapper {
        ChannelWrapper::new(&self.manager, self.options)
    }
}

#[derive(Clone)]
struct LiveChannel {
    channel: Arc<dyn AmqpChannel>,
    id: u64,
}

struct WrapperState {
    live: Option<LiveChannel>,
    connection_id: Option<u64>,
    next_channel_id: u64,
    queue: OutboundQueue,
    consumers: ConsumerRegistry,
    generation: u64,
    has_room: bool,
    setting_up: bool,
    worker_active: bool,
    worker_turns: u64,
    ready: bool,
    closed: bool,
}

impl WrapperState {
    fn current(&self, channel_id: u64) -> Option<&LiveChannel> {
        self.live.as_ref().filter(|live| live.id == channel_id)
    }

    fn is_current(&self, channel_id: u64) -> bool {
        self.current(channel_id).is_some()
    }

    fn can_send_directly(&self) -> bool {
        self.live.is_some()
            && !self.closed
            && !self.setting_up
            && self.has_room
            && !self.worker_active
            && self.queue.is_empty()
    }

    /// Drop the current channel and everything subscribed on it.
    fn lose_channel(&mut self) {
        self.live = None;
        self.setting_up = false;
        self.ready = false;
        self.consumers.detach_all();
    }
}

enum Lifecycle {
    /// Open a fresh channel on `connection_id` if it is still the live connection.
    Reopen { connection_id: u64 },
    /// The broker cancelled this consumer's subscription on `channel_id`.
    Resubscribe { consumer_id: u64, channel_id: u64 },
}

struct WrapperInner {
    name: Option<String>,
    manager: ConnectionManager,
    setup: SetupPipeline,
    state: Mutex<WrapperState>,
    events: broadcast::Sender<ChannelEvent>,
    lifecycle_tx: mpsc::UnboundedSender<Lifecycle>,
    lifecycle_task: Mutex<Option<JoinHandle<()>>>,
}

/// One logical channel bound to a [`ConnectionManager`].
///
/// Publishes made while disconnected are queued and flushed in order once a
/// channel is available. Setup actions run on every new channel before any
/// traffic, then consumers are re-subscribed, then the queue drains.
///
/// Must be created inside a tokio runtime. Clones share the same channel.
#[derive(Clone)]
pub struct ChannelWrapper {
    inner: Arc<WrapperInner>,
}

impl fmt::Debug for ChannelWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelWrapper")
            .field("name", &self.inner.name)
            .field("setup", &self.inner.setup)
            .field("queue_length", &self.queue_length())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a channel wrapper bound to this manager.
    pub fn create_channel(&self, options: ChannelWrapperOptions) -> ChannelWrapper {
        ChannelWrapper::new(self, options)
    }
}

impl ChannelWrapper {
    pub fn builder(manager: &ConnectionManager) -> ChannelWrapperBuilder {
        ChannelWrapperBuilder {
            manager: manager.clone(),
            options: ChannelWrapperOptions::default(),
        }
    }

    pub fn new(manager: &ConnectionManager, options: ChannelWrapperOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        // Subscribe before looking at the live connection so no connect is missed
        let manager_events = manager.subscribe();

        let inner = Arc::new(WrapperInner {
            name: options.name,
            manager: manager.clone(),
            setup: SetupPipeline::new(options.setup),
            state: Mutex::new(WrapperState {
                live: None,
                connection_id: None,
                next_channel_id: 0,
                queue: OutboundQueue::default(),
                consumers: ConsumerRegistry::default(),
                generation: 0,
                has_room: true,
                setting_up: false,
                worker_active: false,
                worker_turns: 0,
                ready: false,
                closed: false,
            }),
            events,
            lifecycle_tx,
            lifecycle_task: Mutex::new(None),
        });

        debug!(channel = %inner.label(), setup_steps = inner.setup.len(), "Creating channel wrapper");

        let task = tokio::spawn(run_lifecycle(
            Arc::downgrade(&inner),
            manager_events,
            lifecycle_rx,
        ));
        *inner
            .lifecycle_task
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(task);

        manager.start();
        Self { inner }
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// True while a live underlying channel is held.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().live.is_some()
    }

    /// Registered consumers, subscribed or waiting for a channel.
    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    /// Messages accepted by `publish` but not yet handed to a channel.
    pub fn queue_length(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Wait until the wrapper has emitted `connect` for its current channel.
    pub async fn wait_for_connect(&self, timeout: Option<Duration>) -> Result<()> {
        let mut events = self.subscribe();
        let wait = async {
            loop {
                {
                    let state = self.inner.lock();
                    if state.closed {
                        return Err(channel_closed());
                    }
                    if state.ready {
                        return Ok(());
                    }
                }
                match events.recv().await {
                    Ok(ChannelEvent::Connect) => return Ok(()),
                    Ok(ChannelEvent::Close) | Err(broadcast::error::RecvError::Closed) => {
                        return Err(channel_closed())
                    }
                    Ok(ChannelEvent::Error { .. }) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await?,
            None => wait.await,
        }
    }

    /// Publish a message, or queue it until a channel is available.
    ///
    /// Resolves with the channel's flow-control answer (`true` while the broker
    /// buffer still has room) once the message is handed to a channel. Rejects
    /// if the wrapper closes first.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> Result<bool> {
        let payload = payload.into();

        let direct = {
            let state = self.inner.lock();
            if state.closed {
                return Err(channel_closed());
            }
            if state.can_send_directly() {
                state.live.clone()
            } else {
                None
            }
        };

        let Some(live) = direct else {
            let (message, completion) = PendingMessage::new(exchange, routing_key, payload, options);
            return self.inner.enqueue(message, completion, false).await;
        };

        let sent = live
            .channel
            .basic_publish(
                exchange,
                routing_key,
                options.publish.clone(),
                &payload,
                options.properties.clone(),
            )
            .await;

        match sent {
            Ok(room) => {
                let mut state = self.inner.lock();
                if state.is_current(live.id) {
                    state.has_room = room;
                }
                Ok(room)
            }
            Err(err) if err.is_channel_closed() => {
                // Anything queued meanwhile was published after us, so go first
                debug!(channel = %self.inner.label(), "Channel closed mid-publish, queueing message");
                let (message, completion) = PendingMessage::new(exchange, routing_key, payload, options);
                self.inner.enqueue(message, completion, true).await
            }
            Err(err) => Err(err),
        }
    }

    /// Register a consumer. It is subscribed now if a channel is ready, after
    /// setup if setup is running, and again after every reconnect. Resolves
    /// with the consumer tag that `cancel` accepts.
    pub async fn consume<H>(&self, queue: &str, handler: H, options: ConsumeOptions) -> Result<String>
    where
        H: MessageHandler + 'static,
    {
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);

        let (id, consumer_tag, target) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(channel_closed());
            }
            let (id, consumer_tag) = state.consumers.register(queue, handler, options);
            let target = match (&state.live, state.setting_up) {
                (Some(live), false) => Some(live.id),
                _ => None,
            };
            if let (Some(channel_id), Some(entry)) = (target, state.consumers.get_mut(id)) {
                entry.bound_channel = Some(channel_id);
            }
            (id, consumer_tag, target)
        };

        if let Some(channel_id) = target {
            match self.inner.subscribe(id, channel_id).await {
                Ok(()) => {}
                // Picked up again when the next channel is set up
                Err(err) if err.is_channel_closed() => {}
                Err(err) => {
                    self.inner.lock().consumers.remove_by_tag(&consumer_tag);
                    return Err(err);
                }
            }
        }

        debug!(channel = %self.inner.label(), consumer_tag = %consumer_tag, queue, "Consumer registered");
        Ok(consumer_tag)
    }

    /// Remove the consumer registered under `consumer_tag` and cancel it on the broker.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let (entry, live) = {
            let mut state = self.inner.lock();
            (state.consumers.remove_by_tag(consumer_tag), state.live.clone())
        };

        let Some(mut entry) = entry else {
            return Ok(());
        };

        let result = match (live, entry.broker_tag.take()) {
            (Some(live), Some(broker_tag)) => {
                live.channel
                    .basic_cancel(&broker_tag, BasicCancelOptions::default())
                    .await
            }
            _ => Ok(()),
        };
        entry.detach();
        ignore_closed(result)
    }

    /// Cancel every registered consumer in one batch and clear the registry.
    pub async fn cancel_all(&self) -> Result<()> {
        let (mut entries, live) = {
            let mut state = self.inner.lock();
            (state.consumers.drain(), state.live.clone())
        };

        let mut result = Ok(());
        if let Some(live) = live {
            let tags: Vec<String> = entries.iter_mut().filter_map(|e| e.broker_tag.take()).collect();
            let cancels = tags
                .iter()
                .map(|tag| live.channel.basic_cancel(tag, BasicCancelOptions::default()));
            for outcome in join_all(cancels).await {
                if let Err(err) = ignore_closed(outcome) {
                    result = Err(err);
                }
            }
        }

        for entry in &mut entries {
            entry.detach();
        }
        result
    }

    pub fn ack(&self, message: &IncomingMessage) {
        self.acknowledge(message.channel_id, Ack::One(message.delivery_tag));
    }

    pub fn ack_all(&self) {
        self.acknowledge(0, Ack::All);
    }

    pub fn nack(&self, message: &IncomingMessage, requeue: bool) {
        self.acknowledge(
            message.channel_id,
            Ack::Nack {
                delivery_tag: message.delivery_tag,
                multiple: false,
                requeue,
            },
        );
    }

    pub fn nack_all(&self, requeue: bool) {
        self.acknowledge(
            0,
            Ack::Nack {
                delivery_tag: 0,
                multiple: true,
                requeue,
            },
        );
    }

    // Fire-and-forget; a missing or replaced channel makes this a no-op.
    // `channel_id` 0 means "whatever channel is live".
    fn acknowledge(&self, channel_id: u64, ack: Ack) {
        let live = self.inner.lock().live.clone();
        let Some(live) = live else {
            debug!(channel = %self.inner.label(), "Not connected, dropping acknowledgement");
            return;
        };
        if channel_id != 0 && channel_id != live.id {
            debug!(channel = %self.inner.label(), "Message came from an older channel, dropping acknowledgement");
            return;
        }

        let label = self.inner.label();
        tokio::spawn(async move {
            let result = match ack {
                Ack::One(delivery_tag) => {
                    live.channel
                        .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
                        .await
                }
                Ack::All => live.channel.basic_ack(0, BasicAckOptions { multiple: true }).await,
                Ack::Nack {
                    delivery_tag,
                    multiple,
                    requeue,
                } => {
                    live.channel
                        .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
                        .await
                }
            };
            if let Err(err) = result {
                warn!(channel = %label, "Failed to acknowledge message: {}", err);
            }
        });
    }

    fn live_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        self.inner
            .lock()
            .live
            .as_ref()
            .map(|live| Arc::clone(&live.channel))
            .ok_or(RabbitMQError::NotConnected)
    }

    /// Declare a queue. While disconnected this answers with an empty queue
    /// summary instead of failing; declare it in a setup action to be sure it exists.
    pub async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo> {
        match self.live_channel() {
            Ok(channel) => channel.queue_declare(queue, options, arguments).await,
            Err(_) => Ok(QueueInfo {
                name: queue.to_string(),
                message_count: 0,
                consumer_count: 0,
            }),
        }
    }

    /// Passive declare; fails if the queue does not exist or we are disconnected.
    pub async fn check_queue(&self, queue: &str) -> Result<QueueInfo> {
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        self.live_channel()?
            .queue_declare(queue, options, FieldTable::default())
            .await
    }

    pub async fn queue_delete(&self, queue: &str, options: QueueDeleteOptions) -> Result<u32> {
        self.live_channel()?.queue_delete(queue, options).await
    }

    pub async fn queue_purge(&self, queue: &str) -> Result<u32> {
        self.live_channel()?
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
    }

    pub async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.live_channel()?
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), arguments)
            .await
    }

    pub async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.live_channel()?
            .queue_unbind(queue, exchange, routing_key, arguments)
            .await
    }

    /// Declare an exchange. A no-op while disconnected.
    pub async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<()> {
        match self.live_channel() {
            Ok(channel) => channel.exchange_declare(exchange, kind, options, arguments).await,
            Err(_) => Ok(()),
        }
    }

    pub async fn check_exchange(&self, exchange: &str) -> Result<()> {
        let options = ExchangeDeclareOptions {
            passive: true,
            ..ExchangeDeclareOptions::default()
        };
        self.live_channel()?
            .exchange_declare(exchange, ExchangeKind::Direct, options, FieldTable::default())
            .await
    }

    pub async fn exchange_delete(&self, exchange: &str, options: ExchangeDeleteOptions) -> Result<()> {
        self.live_channel()?.exchange_delete(exchange, options).await
    }

    pub async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.live_channel()?
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions::default(),
                arguments,
            )
            .await
    }

    pub async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.live_channel()?
            .exchange_unbind(
                destination,
                source,
                routing_key,
                ExchangeUnbindOptions::default(),
                arguments,
            )
            .await
    }

    /// `basic.get` one message from `queue`.
    pub async fn get(&self, queue: &str, options: BasicGetOptions) -> Result<Option<IncomingMessage>> {
        let live = self
            .inner
            .lock()
            .live
            .clone()
            .ok_or(RabbitMQError::NotConnected)?;
        let message = live.channel.basic_get(queue, options).await?;
        Ok(message.map(|mut m| {
            m.channel_id = live.id;
            m
        }))
    }

    /// Close the wrapper: reject queued messages, detach from the manager and
    /// close the underlying channel.
    pub async fn close(&self) -> Result<()> {
        let (live, mut consumers, mut queue) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Ok(());
            }
            // A running worker sees this and stops before its next send
            state.closed = true;
            state.setting_up = false;
            state.ready = false;
            state.worker_active = false;
            (
                state.live.take(),
                state.consumers.drain(),
                std::mem::take(&mut state.queue),
            )
        };

        let rejected = queue.reject_all(&channel_closed());

        let task = self
            .inner
            .lifecycle_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        let result = match live {
            Some(live) => ignore_closed(live.channel.close().await),
            None => Ok(()),
        };

        for entry in &mut consumers {
            entry.detach();
        }

        info!(channel = %self.inner.label(), rejected, "Channel wrapper closed");
        let _ = self.inner.events.send(ChannelEvent::Close);
        result
    }

    #[cfg(test)]
    pub(crate) fn worker_turns(&self) -> u64 {
        self.inner.lock().worker_turns
    }
}

enum Ack {
    One(u64),
    All,
    Nack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
}

fn ignore_closed(result: Result<()>) -> Result<()> {
    match result {
        Err(err) if err.is_channel_closed() => Ok(()),
        other => other,
    }
}

impl WrapperInner {
    fn lock(&self) -> MutexGuard<'_, WrapperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| "unnamed".to_string())
    }

    fn emit_error(&self, error: RabbitMQError) {
        error!(channel = %self.label(), "Channel error: {}", error);
        let _ = self.events.send(ChannelEvent::Error {
            error,
            name: self.name.clone(),
        });
    }

    async fn enqueue(
        self: &Arc<Self>,
        message: PendingMessage,
        completion: oneshot::Receiver<Result<bool>>,
        at_front: bool,
    ) -> Result<bool> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(channel_closed());
            }
            if at_front {
                state.queue.push_front(message);
            } else {
                state.queue.push_back(message);
            }
            trace!(channel = %self.label(), queued = state.queue.len(), "Message queued");
        }

        self.start_worker();
        completion.await.unwrap_or_else(|_| Err(channel_closed()))
    }

    /// Start the publish worker if messages are waiting and the channel can take them.
    fn start_worker(self: &Arc<Self>) {
        let start = {
            let mut state = self.lock();
            if state.worker_active
                || state.closed
                || state.setting_up
                || !state.has_room
                || state.queue.is_empty()
            {
                None
            } else if let Some(live) = state.live.clone() {
                state.worker_active = true;
                state.generation += 1;
                Some((state.generation, live))
            } else {
                None
            }
        };

        if let Some((generation, live)) = start {
            trace!(channel = %self.label(), generation, "Starting publish worker");
            tokio::spawn(publish_queued(Arc::clone(self), generation, live));
        }
    }

    async fn on_connect(self: &Arc<Self>, live_connection: LiveConnection) {
        {
            let state = self.lock();
            if state.closed
                || (state.connection_id == Some(live_connection.id) && state.live.is_some())
            {
                return;
            }
        }

        let opened = match live_connection.connection.create_channel().await {
            Ok(opened) => opened,
            Err(err) => {
                self.emit_error(err);
                self.schedule_reopen(live_connection.id);
                return;
            }
        };

        let (channel_id, replaced) = {
            let mut state = self.lock();
            if state.closed {
                (None, None)
            } else {
                state.next_channel_id += 1;
                let id = state.next_channel_id;
                let replaced = state.live.take();
                if replaced.is_some() {
                    state.consumers.detach_all();
                }
                state.live = Some(LiveChannel {
                    channel: Arc::clone(&opened.channel),
                    id,
                });
                state.connection_id = Some(live_connection.id);
                state.has_room = true;
                state.setting_up = true;
                state.ready = false;
                (Some(id), replaced)
            }
        };
        let Some(channel_id) = channel_id else {
            let _ = opened.channel.close().await;
            return;
        };
        // Only one channel is ever current; an old one still open is closed here
        if let Some(old) = replaced {
            debug!(channel = %self.label(), channel_id = old.id, "Closing replaced channel");
            let _ = old.channel.close().await;
        }

        self.watch_channel(channel_id, opened.signals);
        debug!(channel = %self.label(), channel_id, "Channel opened, running setup");

        self.setup
            .run(opened.channel.as_ref(), |err| {
                self.emit_error(err);
                async {}
            })
            .await;

        // Consumers in registry order, including any registered while setup ran
        let ready = loop {
            let claimed = {
                let mut state = self.lock();
                if !state.is_current(channel_id) || !opened.channel.is_open() {
                    Claim::Lost
                } else if let Some(id) = state.consumers.claim_unbound(channel_id) {
                    Claim::Consumer(id)
                } else {
                    state.setting_up = false;
                    state.ready = true;
                    Claim::Done
                }
            };

            match claimed {
                Claim::Lost => break false,
                Claim::Done => break true,
                Claim::Consumer(id) => match self.subscribe(id, channel_id).await {
                    Ok(()) => {}
                    Err(err) if err.is_channel_closed() => {}
                    Err(err) => self.emit_error(err),
                },
            }
        };

        if !ready {
            debug!(channel = %self.label(), channel_id, "Channel lost during setup");
            return;
        }

        info!(channel = %self.label(), channel_id, "Channel ready");
        let _ = self.events.send(ChannelEvent::Connect);
        self.start_worker();
    }

    fn on_disconnect(&self, error: Option<RabbitMQError>) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.lose_channel();
        state.connection_id = None;
        match error {
            Some(err) => debug!(channel = %self.label(), queued = state.queue.len(), "Connection lost: {}", err),
            None => debug!(channel = %self.label(), queued = state.queue.len(), "Connection closed"),
        }
    }

    fn on_channel_closed(self: &Arc<Self>, channel_id: u64, error: Option<RabbitMQError>) {
        let connection_id = {
            let mut state = self.lock();
            if state.closed || !state.is_current(channel_id) {
                return;
            }
            state.lose_channel();
            state.connection_id
        };

        match error {
            Some(err) => warn!(channel = %self.label(), channel_id, "Channel closed: {}", err),
            None => debug!(channel = %self.label(), channel_id, "Channel closed"),
        }

        if let Some(connection_id) = connection_id {
            self.schedule_reopen(connection_id);
        }
    }

    fn on_drain(self: &Arc<Self>, channel_id: u64) {
        {
            let mut state = self.lock();
            if !state.is_current(channel_id) {
                return;
            }
            trace!(channel = %self.label(), "Channel drained");
            state.has_room = true;
        }
        self.start_worker();
    }

    /// The connection is fine but the channel is not; try again after the reconnect delay.
    fn schedule_reopen(&self, connection_id: u64) {
        let tx = self.lifecycle_tx.clone();
        let delay = self.manager.options().reconnect_delay();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(Lifecycle::Reopen { connection_id });
        });
    }

    fn watch_channel(self: &Arc<Self>, channel_id: u64, mut signals: mpsc::UnboundedReceiver<ChannelSignal>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut error = None;
            while let Some(signal) = signals.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match signal {
                    ChannelSignal::Drain => inner.on_drain(channel_id),
                    ChannelSignal::Closed(reason) => {
                        error = reason;
                        break;
                    }
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.on_channel_closed(channel_id, error);
            }
        });
    }

    /// Subscribe one registered consumer on `channel_id`, if that is still the live channel.
    async fn subscribe(self: &Arc<Self>, consumer_id: u64, channel_id: u64) -> Result<()> {
        let (channel, queue, requested_tag, options, handler) = {
            let state = self.lock();
            let Some(live) = state.current(channel_id) else {
                return Ok(());
            };
            let Some(entry) = state.consumers.get(consumer_id) else {
                return Ok(());
            };
            (
                Arc::clone(&live.channel),
                entry.queue.clone(),
                entry.requested_tag().to_string(),
                entry.options.clone(),
                Arc::clone(&entry.handler),
            )
        };

        if let Some(prefetch) = options.prefetch {
            channel.basic_qos(prefetch, BasicQosOptions::default()).await?;
        }

        let (sink, deliveries) = mpsc::unbounded_channel();
        let broker_tag = channel
            .basic_consume(&queue, &requested_tag, options.consume, options.arguments, sink)
            .await?;

        let stale = {
            let mut state = self.lock();
            let current = !state.closed && state.is_current(channel_id);
            match state.consumers.get_mut(consumer_id) {
                Some(entry) if current => {
                    entry.broker_tag = Some(broker_tag.clone());
                    entry.bound_channel = Some(channel_id);
                    if let Some(previous) = entry.task.take() {
                        previous.abort();
                    }
                    entry.task = Some(tokio::spawn(run_consumer(
                        Arc::downgrade(self),
                        consumer_id,
                        channel_id,
                        handler,
                        deliveries,
                    )));
                    false
                }
                _ => true,
            }
        };

        if stale {
            // Cancelled or replaced while the broker was answering
            if channel.is_open() {
                let _ = channel
                    .basic_cancel(&broker_tag, BasicCancelOptions::default())
                    .await;
            }
        } else {
            debug!(channel = %self.label(), queue = %queue, broker_tag = %broker_tag, "Consumer subscribed");
        }
        Ok(())
    }

    /// The broker cancelled a subscription: clear its tag and subscribe it again.
    async fn on_consumer_cancelled(self: &Arc<Self>, consumer_id: u64, channel_id: u64) {
        let resubscribe = {
            let mut state = self.lock();
            let current = !state.closed && state.is_current(channel_id);
            match state.consumers.get_mut(consumer_id) {
                Some(entry) if current && entry.bound_channel == Some(channel_id) => {
                    warn!(
                        channel = %self.name.as_deref().unwrap_or("unnamed"),
                        queue = %entry.queue,
                        "Consumer cancelled by broker, re-subscribing"
                    );
                    entry.broker_tag = None;
                    // Its delivery loop has already ended
                    entry.task = None;
                    true
                }
                _ => false,
            }
        };

        if !resubscribe {
            return;
        }

        match self.subscribe(consumer_id, channel_id).await {
            Ok(()) => {}
            // Queue is gone; the next setup run recreates it and subscribes again
            Err(err) if err.is_not_found() => {
                debug!(channel = %self.label(), "Queue missing on re-subscribe: {}", err);
            }
            Err(err) if err.is_channel_closed() => {}
            Err(err) => self.emit_error(err),
        }
    }
}

enum Claim {
    Consumer(u64),
    Done,
    Lost,
}

async fn run_lifecycle(
    weak: Weak<WrapperInner>,
    mut manager_events: broadcast::Receiver<ConnectionEvent>,
    mut lifecycle: mpsc::UnboundedReceiver<Lifecycle>,
) {
    if let Some(inner) = weak.upgrade() {
        if let Some(live) = inner.manager.live_connection() {
            inner.on_connect(live).await;
        }
    }

    loop {
        tokio::select! {
            event = manager_events.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    Ok(ConnectionEvent::Connected { connection, connection_id, .. }) => {
                        inner
                            .on_connect(LiveConnection { connection, id: connection_id })
                            .await;
                    }
                    Ok(ConnectionEvent::Disconnected { error }) => inner.on_disconnect(error),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(channel = %inner.label(), missed, "Missed connection events, resyncing");
                        match inner.manager.live_connection() {
                            Some(live) => inner.on_connect(live).await,
                            None => inner.on_disconnect(None),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            signal = lifecycle.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                match signal {
                    Some(Lifecycle::Reopen { connection_id }) => {
                        if let Some(live) = inner.manager.live_connection() {
                            if live.id == connection_id {
                                inner.on_connect(live).await;
                            }
                        }
                    }
                    Some(Lifecycle::Resubscribe { consumer_id, channel_id }) => {
                        inner.on_consumer_cancelled(consumer_id, channel_id).await;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Drain the outbound queue onto `live`, at most one batch per scheduling turn.
/// Stops as soon as `generation` is no longer current, the channel changes,
/// setup starts or flow control says there is no room.
async fn publish_queued(inner: Arc<WrapperInner>, generation: u64, live: LiveChannel) {
    drain_queue(&inner, generation, &live).await;
    // A newer channel may have come up while this worker held the active flag
    inner.start_worker();
}

async fn drain_queue(inner: &Arc<WrapperInner>, generation: u64, live: &LiveChannel) {
    loop {
        inner.lock().worker_turns += 1;

        for _ in 0..PUBLISH_BATCH_SIZE {
            let mut message = {
                let mut state = inner.lock();
                if state.generation != generation {
                    return;
                }
                if state.closed || state.setting_up || !state.has_room || !state.is_current(live.id) {
                    state.worker_active = false;
                    return;
                }
                match state.queue.pop_front() {
                    Some(message) => message,
                    None => {
                        state.worker_active = false;
                        return;
                    }
                }
            };

            let sent = live
                .channel
                .basic_publish(
                    &message.exchange,
                    &message.routing_key,
                    message.options.publish.clone(),
                    &message.payload,
                    message.options.properties.clone(),
                )
                .await;

            match sent {
                Ok(room) => {
                    {
                        let mut state = inner.lock();
                        if state.generation == generation && state.is_current(live.id) {
                            state.has_room = room;
                        }
                    }
                    message.settle(Ok(room));
                }
                Err(err) if err.is_channel_closed() => {
                    let rejected = {
                        let mut state = inner.lock();
                        if state.generation == generation {
                            state.worker_active = false;
                        }
                        // Nothing queued behind it was sent yet, so it still goes first
                        if state.closed {
                            Some(message)
                        } else {
                            state.queue.push_front(message);
                            None
                        }
                    };
                    debug!(channel = %inner.label(), "Channel closed under the publish worker");
                    if let Some(mut message) = rejected {
                        message.settle(Err(channel_closed()));
                    }
                    return;
                }
                Err(err) => {
                    warn!(channel = %inner.label(), "Failed to publish queued message: {}", err);
                    message.settle(Err(err));
                }
            }
        }

        // Give the rest of the runtime a turn before the next batch
        trace!(channel = %inner.label(), generation, "Publish batch done, yielding");
        tokio::task::yield_now().await;
    }
}

async fn run_consumer(
    weak: Weak<WrapperInner>,
    consumer_id: u64,
    channel_id: u64,
    handler: Arc<dyn MessageHandler>,
    mut deliveries: mpsc::UnboundedReceiver<ConsumerDelivery>,
) {
    while let Some(delivery) = deliveries.recv().await {
        match delivery {
            ConsumerDelivery::Message(mut message) => {
                message.channel_id = channel_id;
                handler.handle(message).await;
            }
            ConsumerDelivery::Cancelled => {
                if let Some(inner) = weak.upgrade() {
                    let _ = inner.lifecycle_tx.send(Lifecycle::Resubscribe {
                        consumer_id,
                        channel_id,
                    });
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::connection::ManagerOptions;
    use crate::rabbitmq::endpoint::BrokerEndpoint;
    use crate::rabbitmq::setup;
    use crate::testing::{MockCall, MockConnector};
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const URL: &str = "amqp://a";

    fn manager(connector: &MockConnector) -> ConnectionManager {
        ConnectionManager::new(
            vec![BrokerEndpoint::new(URL).unwrap()],
            ManagerOptions {
                heartbeat_seconds: 5,
                reconnect_delay: Some(Duration::from_millis(20)),
                connect_timeout: None,
            },
            Arc::new(connector.clone()),
        )
        .unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !check() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn next_connect(events: &mut broadcast::Receiver<ChannelEvent>) -> Vec<ChannelEvent> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match events.recv().await.unwrap() {
                    ChannelEvent::Connect => break,
                    other => seen.push(other),
                }
            }
        })
        .await
        .expect("no connect event");
        seen
    }

    fn publish_all(
        wrapper: &ChannelWrapper,
        keys: Vec<String>,
    ) -> JoinHandle<Vec<Result<bool>>> {
        let wrapper = wrapper.clone();
        tokio::spawn(async move {
            let publishes = keys.iter().map(|key| {
                wrapper.publish("", key, key.as_bytes().to_vec(), PublishOptions::default())
            });
            join_all(publishes).await
        })
    }

    #[tokio::test]
    async fn queued_publishes_flush_in_call_order() {
        let connector = MockConnector::new();
        connector.set_reachable(URL, false);
        let manager = manager(&connector);
        let wrapper = manager.create_channel(ChannelWrapperOptions::named("orders"));

        let keys: Vec<String> = ["a", "b", "c"].iter().map(|k| k.to_string()).collect();
        let pending = publish_all(&wrapper, keys);
        wait_until(|| wrapper.queue_length() == 3).await;
        assert!(connector.broker().published().is_empty());

        connector.set_reachable(URL, true);
        let results = pending.await.unwrap();
        assert!(results.iter().all(|r| r == &Ok(true)));
        assert_eq!(
            connector.broker().published_payloads(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(wrapper.queue_length(), 0);

        wrapper.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_rejects_every_pending_message() {
        let connector = MockConnector::new();
        connector.set_reachable(URL, false);
        let manager = manager(&connector);
        let wrapper = manager.create_channel(ChannelWrapperOptions::default());

        let keys: Vec<String> = (0..5).map(|i| format!("k{}", i)).collect();
        let pending = publish_all(&wrapper, keys);
        wait_until(|| wrapper.queue_length() == 5).await;

        wrapper.close().await.unwrap();
        assert_eq!(wrapper.queue_length(), 0);

        let results = pending.await.unwrap();
        assert_eq!(results.len(), 5);
        for result in results {
            assert!(matches!(result, Err(RabbitMQError::ChannelClosed(msg)) if msg == "Channel closed"));
        }
        assert!(wrapper
            .publish("", "late", b"x".to_vec(), PublishOptions::default())
            .await
            .is_err());
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn large_backlog_drains_over_several_turns() {
        let connector = MockConnector::new();
        connector.set_reachable(URL, false);
        let manager = manager(&connector);
        let wrapper = manager.create_channel(ChannelWrapperOptions::default());

        let keys: Vec<String> = (0..2500).map(|i| format!("m{}", i)).collect();
        let pending = publish_all(&wrapper, keys);
        wait_until(|| wrapper.queue_length() == 2500).await;

        connector.set_reachable(URL, true);
        let results = pending.await.unwrap();
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(connector.broker().published().len(), 2500);
        assert!(wrapper.worker_turns() >= 3);

        wrapper.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn setup_runs_again_on_every_new_channel() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let wrapper = ChannelWrapper::builder(&manager)
            .name("orders")
            .setup(setup::declare_exchange(
                "orders",
                ExchangeKind::Topic,
                ExchangeDeclareOptions::default(),
            ))
            .setup(setup::declare_queue("orders.created", QueueDeclareOptions::default()))
            .setup(setup::bind_queue("orders.created", "orders", "orders.created"))
            .build();
        wrapper.wait_for_connect(Some(Duration::from_secs(2))).await.unwrap();

        let expected = vec![
            MockCall::ExchangeDeclare("orders".to_string()),
            MockCall::QueueDeclare("orders.created".to_string()),
            MockCall::QueueBind(
                "orders.created".to_string(),
                "orders".to_string(),
                "orders.created".to_string(),
            ),
        ];
        let first = connector.last_connection().unwrap();
        assert_eq!(first.last_channel().unwrap().calls(), expected);

        let mut events = wrapper.subscribe();
        first.drop_connection();
        next_connect(&mut events).await;

        let second = connector.last_connection().unwrap();
        assert_eq!(connector.connections().len(), 2);
        assert_eq!(second.last_channel().unwrap().calls(), expected);

        wrapper.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn setup_failure_is_reported_and_channel_still_connects() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let wrapper = ChannelWrapper::builder(&manager)
            .name("broken")
            .setup(setup::from_fn("always fails", |_| {
                Box::pin(async { Err(RabbitMQError::ChannelError("PRECONDITION_FAILED".into())) })
            }))
            .build();
        let mut events = wrapper.subscribe();

        let seen = next_connect(&mut events).await;
        assert!(seen.iter().any(|e| matches!(
            e,
            ChannelEvent::Error { error: RabbitMQError::SetupError(_), name: Some(name) } if name == "broken"
        )));

        wrapper.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn consumer_is_resubscribed_after_broker_cancel() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let wrapper = ChannelWrapper::builder(&manager)
            .setup(setup::declare_queue("jobs", QueueDeclareOptions::default()))
            .build();
        wrapper.wait_for_connect(Some(Duration::from_secs(2))).await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let tag = wrapper
            .consume(
                "jobs",
                move |message: IncomingMessage| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().unwrap().push(message.data);
                    }
                },
                ConsumeOptions::default(),
            )
            .await
            .unwrap();

        let broker = connector.broker();
        assert_eq!(broker.consumer_tags("jobs"), vec!["amq.ctag-1".to_string()]);

        assert_eq!(broker.cancel_consumers("jobs"), 1);
        wait_until(|| broker.consumer_tags("jobs") == vec!["amq.ctag-2".to_string()]).await;

        assert!(broker.deliver("jobs", b"hello"));
        wait_until(|| received.lock().unwrap().len() == 1).await;

        assert_eq!(wrapper.consumer_count(), 1);
        wrapper.cancel(&tag).await.unwrap();
        assert_eq!(wrapper.consumer_count(), 0);
        assert!(broker.consumer_tags("jobs").is_empty());
        let channel = connector.last_connection().unwrap().last_channel().unwrap();
        assert!(channel
            .calls()
            .contains(&MockCall::Cancel("amq.ctag-2".to_string())));

        wrapper.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn deleted_queue_comes_back_without_an_error_event() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let wrapper = ChannelWrapper::builder(&manager)
            .setup(setup::declare_queue("jobs", QueueDeclareOptions::default()))
            .build();
        wrapper.wait_for_connect(Some(Duration::from_secs(2))).await.unwrap();
        wrapper
            .consume("jobs", |_message: IncomingMessage| async {}, ConsumeOptions::default())
            .await
            .unwrap();

        let mut events = wrapper.subscribe();
        let broker = connector.broker();
        broker.delete_queue("jobs");

        let seen = next_connect(&mut events).await;
        assert!(
            !seen.iter().any(|e| matches!(e, ChannelEvent::Error { .. })),
            "unexpected events: {:?}",
            seen
        );
        assert!(broker.has_queue("jobs"));
        assert_eq!(broker.consumer_tags("jobs").len(), 1);
        // Same connection, fresh channel
        assert_eq!(connector.connections().len(), 1);
        assert_eq!(connector.last_connection().unwrap().channels().len(), 2);

        wrapper.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn backpressure_holds_the_queue_until_drain() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let wrapper = manager.create_channel(ChannelWrapperOptions::default());
        wrapper.wait_for_connect(Some(Duration::from_secs(2))).await.unwrap();

        let channel = connector.last_connection().unwrap().last_channel().unwrap();
        channel.report_full_after(0);

        let first = wrapper
            .publish("", "first", b"1".to_vec(), PublishOptions::default())
            .await;
        assert_eq!(first, Ok(false));

        let pending = publish_all(&wrapper, vec!["second".to_string()]);
        wait_until(|| wrapper.queue_length() == 1).await;
        sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.broker().published().len(), 1);

        channel.drain();
        let results = pending.await.unwrap();
        assert_eq!(results, vec![Ok(true)]);
        assert_eq!(
            connector.broker().published_payloads(),
            vec![b"1".to_vec(), b"second".to_vec()]
        );

        wrapper.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn publish_failure_rejects_only_that_message() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let wrapper = manager.create_channel(ChannelWrapperOptions::default());
        wrapper.wait_for_connect(Some(Duration::from_secs(2))).await.unwrap();

        let channel = connector.last_connection().unwrap().last_channel().unwrap();
        channel.fail_publishes(Some(RabbitMQError::PublishError("frame too large".into())));
        let failed = wrapper
            .publish("", "big", vec![0; 16], PublishOptions::default())
            .await;
        assert!(matches!(failed, Err(RabbitMQError::PublishError(_))));

        channel.fail_publishes(None);
        let sent = wrapper
            .publish("", "small", b"ok".to_vec(), PublishOptions::persistent_json())
            .await;
        assert_eq!(sent, Ok(true));
        assert_eq!(wrapper.queue_length(), 0);

        wrapper.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn ack_from_an_old_channel_is_ignored() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let wrapper = ChannelWrapper::builder(&manager)
            .setup(setup::declare_queue("jobs", QueueDeclareOptions::default()))
            .build();
        wrapper.wait_for_connect(Some(Duration::from_secs(2))).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        wrapper
            .consume(
                "jobs",
                move |message: IncomingMessage| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message);
                    }
                },
                ConsumeOptions::default().with_prefetch(10),
            )
            .await
            .unwrap();

        let broker = connector.broker();
        broker.deliver("jobs", b"one");
        let stale = rx.recv().await.unwrap();

        let mut events = wrapper.subscribe();
        connector.last_connection().unwrap().drop_connection();
        next_connect(&mut events).await;

        let channel = connector.last_connection().unwrap().last_channel().unwrap();
        wrapper.ack(&stale);
        broker.deliver("jobs", b"two");
        let fresh = rx.recv().await.unwrap();
        wrapper.ack(&fresh);

        let acked = fresh.delivery_tag;
        wait_until(|| channel.calls().contains(&MockCall::Ack(acked, false))).await;
        assert!(!channel
            .calls()
            .contains(&MockCall::Ack(stale.delivery_tag, false)));
        assert!(channel.calls().contains(&MockCall::Qos(10)));

        wrapper.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn pass_throughs_while_disconnected() {
        let connector = MockConnector::new();
        connector.set_reachable(URL, false);
        let manager = manager(&connector);
        let wrapper = manager.create_channel(ChannelWrapperOptions::default());

        let info = wrapper
            .queue_declare("jobs", QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();
        assert_eq!(info.name, "jobs");
        assert_eq!(info.message_count, 0);
        assert!(wrapper
            .exchange_declare(
                "orders",
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default()
            )
            .await
            .is_ok());
        assert_eq!(wrapper.check_queue("jobs").await, Err(RabbitMQError::NotConnected));
        assert_eq!(wrapper.queue_purge("jobs").await, Err(RabbitMQError::NotConnected));
        assert!(wrapper.get("jobs", BasicGetOptions::default()).await.is_err());

        wrapper.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_detaches_from_the_manager() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        assert_eq!(manager.listener_count(), 0);

        let wrapper = manager.create_channel(ChannelWrapperOptions::named("short-lived"));
        assert_eq!(manager.listener_count(), 1);
        wrapper.wait_for_connect(Some(Duration::from_secs(2))).await.unwrap();

        let mut events = wrapper.subscribe();
        wrapper.close().await.unwrap();
        assert_eq!(manager.listener_count(), 0);
        assert!(matches!(events.recv().await.unwrap(), ChannelEvent::Close));
        assert!(connector
            .last_connection()
            .unwrap()
            .last_channel()
            .unwrap()
            .is_closed());

        // Closing twice is harmless
        wrapper.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn send_in_flight_across_reconnect_resumes_on_the_new_channel() {
        let connector = MockConnector::new();
        connector.set_reachable(URL, false);
        let manager = manager(&connector);
        let wrapper = manager.create_channel(ChannelWrapperOptions::named("straddle"));

        let keys: Vec<String> = ["a", "b", "c"].iter().map(|k| k.to_string()).collect();
        let pending = publish_all(&wrapper, keys);
        wait_until(|| wrapper.queue_length() == 3).await;

        // The worker takes "a" and parks inside the send
        let broker = connector.broker().clone();
        broker.hold_publishes();
        connector.set_reachable(URL, true);
        wait_until(|| broker.held_publishes() == 1).await;

        let mut events = wrapper.subscribe();
        connector.last_connection().unwrap().drop_connection();
        next_connect(&mut events).await;
        assert_eq!(connector.connections().len(), 2);

        broker.release_publishes();
        let results = tokio::time::timeout(Duration::from_secs(3), pending)
            .await
            .expect("queue stalled on the new channel")
            .unwrap();
        assert!(results.iter().all(|r| r == &Ok(true)), "{:?}", results);

        let current = connector.last_connection().unwrap().last_channel().unwrap().id();
        let published = broker.published();
        let keys: Vec<&str> = published.iter().map(|m| m.routing_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert!(published.iter().all(|m| m.channel_id == current));
        assert_eq!(wrapper.queue_length(), 0);

        wrapper.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn setup_cut_off_by_connection_loss_is_not_reported() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let runs = Arc::new(AtomicUsize::new(0));
        let (dropper, counter) = (connector.clone(), Arc::clone(&runs));
        let wrapper = ChannelWrapper::builder(&manager)
            .name("flaky")
            .setup(setup::from_fn("declare jobs", move |channel| {
                let dropper = dropper.clone();
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    // First run loses the connection halfway through setup
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        if let Some(connection) = dropper.last_connection() {
                            connection.drop_connection();
                        }
                    }
                    channel
                        .queue_declare("jobs", QueueDeclareOptions::default(), FieldTable::default())
                        .await
                        .map(|_| ())
                })
            }))
            .build();
        let mut events = wrapper.subscribe();

        let seen = next_connect(&mut events).await;
        assert!(seen.is_empty(), "unexpected events: {:?}", seen);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(connector.connections().len(), 2);
        assert!(connector.broker().has_queue("jobs"));

        wrapper.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn only_the_current_channel_stays_open() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let wrapper = manager.create_channel(ChannelWrapperOptions::named("single"));
        wrapper.wait_for_connect(Some(Duration::from_secs(2))).await.unwrap();
        let mut events = wrapper.subscribe();

        let open_channels = || {
            connector
                .connections()
                .iter()
                .flat_map(|connection| connection.channels())
                .filter(|channel| !channel.is_closed())
                .count()
        };

        // Broker closes the channel; a new one opens on the same connection
        let first = connector.last_connection().unwrap();
        first
            .last_channel()
            .unwrap()
            .close_from_broker(RabbitMQError::ChannelError("PRECONDITION_FAILED".into()));
        next_connect(&mut events).await;
        assert_eq!(first.channels().len(), 2);
        assert_eq!(open_channels(), 1);

        // Connection drops; the replacement lives on the new connection
        first.drop_connection();
        next_connect(&mut events).await;
        assert_eq!(connector.connections().len(), 2);
        assert_eq!(open_channels(), 1);
        assert!(wrapper.is_connected());

        wrapper.close().await.unwrap();
        assert_eq!(open_channels(), 0);
        manager.close().await.unwrap();
    }
}
