// src/rabbitmq/consumer.rs
// Consumer registry: every entry is re-subscribed whenever the channel is recreated

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::BasicConsumeOptions;
use lapin::types::FieldTable;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::amqp_client::IncomingMessage;

/// Receives deliveries for one consumer.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: IncomingMessage);
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(IncomingMessage) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, message: IncomingMessage) {
        (self)(message).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Tag to request from the broker on every subscription. When absent the
    /// broker assigns a fresh tag each time and a local one identifies the consumer.
    pub consumer_tag: Option<String>,
    /// `basic.qos` prefetch applied before subscribing.
    pub prefetch: Option<u16>,
    pub consume: BasicConsumeOptions,
    pub arguments: FieldTable,
}

impl ConsumeOptions {
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_string());
        self
    }
}

pub(crate) struct ConsumerEntry {
    pub id: u64,
    /// Stable identifier handed back to the caller of `consume`.
    pub consumer_tag: String,
    /// Set only while subscribed on a live channel.
    pub broker_tag: Option<String>,
    pub queue: String,
    pub handler: Arc<dyn MessageHandler>,
    pub options: ConsumeOptions,
    /// Channel the latest subscribe attempt targeted.
    pub bound_channel: Option<u64>,
    pub task: Option<JoinHandle<()>>,
}

impl ConsumerEntry {
    pub fn requested_tag(&self) -> &str {
        self.options.consumer_tag.as_deref().unwrap_or("")
    }

    /// Forget the current subscription; the delivery loop stops with it.
    pub fn detach(&mut self) {
        self.broker_tag = None;
        self.bound_channel = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
pub(crate) struct ConsumerRegistry {
    entries: Vec<ConsumerEntry>,
    next_id: u64,
}

impl ConsumerRegistry {
    pub fn register(
        &mut self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> (u64, String) {
        self.next_id += 1;
        let id = self.next_id;
        let consumer_tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("ctag-{}", Uuid::new_v4()));

        self.entries.push(ConsumerEntry {
            id,
            consumer_tag: consumer_tag.clone(),
            broker_tag: None,
            queue: queue.to_string(),
            handler,
            options,
            bound_channel: None,
            task: None,
        });
        (id, consumer_tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&ConsumerEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut ConsumerEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// Remove the first consumer with this tag.
    pub fn remove_by_tag(&mut self, consumer_tag: &str) -> Option<ConsumerEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.consumer_tag == consumer_tag)?;
        Some(self.entries.remove(index))
    }

    pub fn drain(&mut self) -> Vec<ConsumerEntry> {
        std::mem::take(&mut self.entries)
    }

    pub fn detach_all(&mut self) {
        for entry in &mut self.entries {
            entry.detach();
        }
    }

    /// Next consumer, in registry order, not yet tried on `channel_id`. It is
    /// marked as tried so each consumer gets one attempt per channel.
    pub fn claim_unbound(&mut self, channel_id: u64) -> Option<u64> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.bound_channel != Some(channel_id))?;
        entry.bound_channel = Some(channel_id);
        Some(entry.id)
    }
}
