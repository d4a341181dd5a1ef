// src/rabbitmq/setup.rs
// Idempotent channel setup, re-run in registration order on every new channel

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use lapin::options::{BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::ExchangeKind;
use tracing::{debug, warn};

use super::amqp_client::AmqpChannel;
use super::errors::{RabbitMQError, Result};

/// One declarative step that must succeed before a channel carries traffic.
#[async_trait]
pub trait SetupAction: Send + Sync {
    async fn run(&self, channel: &dyn AmqpChannel) -> Result<()>;

    fn describe(&self) -> String {
        "setup action".to_string()
    }
}

struct FnSetup<F> {
    label: String,
    action: F,
}

#[async_trait]
impl<F> SetupAction for FnSetup<F>
where
    F: for<'a> Fn(&'a dyn AmqpChannel) -> BoxFuture<'a, Result<()>> + Send + Sync,
{
    async fn run(&self, channel: &dyn AmqpChannel) -> Result<()> {
        (self.action)(channel).await
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Wrap a closure as a setup action.
///
/// ```ignore
/// let action = setup::from_fn("declare jobs", |channel| Box::pin(async move {
///     channel.queue_declare("jobs", Default::default(), Default::default()).await?;
///     Ok(())
/// }));
/// ```
pub fn from_fn<F>(label: &str, action: F) -> Arc<dyn SetupAction>
where
    F: for<'a> Fn(&'a dyn AmqpChannel) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    Arc::new(FnSetup {
        label: label.to_string(),
        action,
    })
}

pub fn declare_exchange(
    exchange: &str,
    kind: ExchangeKind,
    options: ExchangeDeclareOptions,
) -> Arc<dyn SetupAction> {
    Arc::new(DeclareExchange {
        exchange: exchange.to_string(),
        kind,
        options,
    })
}

pub fn declare_queue(queue: &str, options: QueueDeclareOptions) -> Arc<dyn SetupAction> {
    Arc::new(DeclareQueue {
        queue: queue.to_string(),
        options,
    })
}

pub fn bind_queue(queue: &str, exchange: &str, routing_key: &str) -> Arc<dyn SetupAction> {
    Arc::new(BindQueue {
        queue: queue.to_string(),
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
    })
}

pub fn prefetch(count: u16) -> Arc<dyn SetupAction> {
    Arc::new(Prefetch { count })
}

struct DeclareExchange {
    exchange: String,
    kind: ExchangeKind,
    options: ExchangeDeclareOptions,
}

#[async_trait]
impl SetupAction for DeclareExchange {
    async fn run(&self, channel: &dyn AmqpChannel) -> Result<()> {
        channel
            .exchange_declare(&self.exchange, self.kind.clone(), self.options.clone(), FieldTable::default())
            .await
    }

    fn describe(&self) -> String {
        format!("declare exchange '{}'", self.exchange)
    }
}

struct DeclareQueue {
    queue: String,
    options: QueueDeclareOptions,
}

#[async_trait]
impl SetupAction for DeclareQueue {
    async fn run(&self, channel: &dyn AmqpChannel) -> Result<()> {
        let info = channel
            .queue_declare(&self.queue, self.options.clone(), FieldTable::default())
            .await?;
        debug!("Queue '{}' declared with {} messages", info.name, info.message_count);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("declare queue '{}'", self.queue)
    }
}

struct BindQueue {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[async_trait]
impl SetupAction for BindQueue {
    async fn run(&self, channel: &dyn AmqpChannel) -> Result<()> {
        channel
            .queue_bind(
                &self.queue,
                &self.exchange,
                &self.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
    }

    fn describe(&self) -> String {
        format!(
            "bind queue '{}' to '{}' with '{}'",
            self.queue, self.exchange, self.routing_key
        )
    }
}

struct Prefetch {
    count: u16,
}

#[async_trait]
impl SetupAction for Prefetch {
    async fn run(&self, channel: &dyn AmqpChannel) -> Result<()> {
        channel.basic_qos(self.count, BasicQosOptions::default()).await
    }

    fn describe(&self) -> String {
        format!("prefetch {}", self.count)
    }
}

/// Ordered, append-only list of setup actions.
#[derive(Clone, Default)]
pub struct SetupPipeline {
    actions: Vec<Arc<dyn SetupAction>>,
}

impl fmt::Debug for SetupPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.actions.iter().map(|a| a.describe()))
            .finish()
    }
}

impl SetupPipeline {
    pub fn new(actions: Vec<Arc<dyn SetupAction>>) -> Self {
        Self { actions }
    }

    pub fn push(&mut self, action: Arc<dyn SetupAction>) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action in order, each to completion. Failures do not stop the
    /// remaining actions; each one is handed to `report`.
    /// Failures caused by the channel closing underneath are dropped.
    pub async fn run<R, Fut>(&self, channel: &dyn AmqpChannel, mut report: R)
    where
        R: FnMut(RabbitMQError) -> Fut,
        Fut: Future<Output = ()>,
    {
        for action in &self.actions {
            match action.run(channel).await {
                Ok(()) => debug!("Setup step '{}' done", action.describe()),
                Err(err) if err.is_channel_closed() => {
                    debug!("Channel closed during setup step '{}'", action.describe());
                }
                Err(err) => {
                    warn!("Setup step '{}' failed: {}", action.describe(), err);
                    report(RabbitMQError::SetupError(format!("{}: {}", action.describe(), err)))
                        .await;
                }
            }
        }
    }
}
