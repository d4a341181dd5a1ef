// src/rabbitmq/publisher.rs
// Outbound message queue for a channel wrapper

use std::collections::VecDeque;

use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;
use tokio::sync::oneshot;

use super::errors::{RabbitMQError, Result};

/// Messages the publish worker sends per scheduling turn before yielding.
pub const PUBLISH_BATCH_SIZE: usize = 1000;

/// Protocol-level options for a publish.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub publish: BasicPublishOptions,
    pub properties: BasicProperties,
}

impl PublishOptions {
    pub fn new(properties: BasicProperties) -> Self {
        Self {
            publish: BasicPublishOptions::default(),
            properties,
        }
    }

    /// Delivery mode 2, with a JSON content type.
    pub fn persistent_json() -> Self {
        Self::new(
            BasicProperties::default()
                .with_delivery_mode(2)
                .with_content_type("application/json".into()),
        )
    }

    pub fn mandatory(mut self) -> Self {
        self.publish.mandatory = true;
        self
    }
}

pub(crate) type Completion = oneshot::Sender<Result<bool>>;

/// A queued publish waiting for a live channel.
pub(crate) struct PendingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub options: PublishOptions,
    // Taken on settle, so a message resolves or rejects at most once
    completion: Option<Completion>,
}

impl PendingMessage {
    pub fn new(
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> (Self, oneshot::Receiver<Result<bool>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload,
                options,
                completion: Some(tx),
            },
            rx,
        )
    }

    pub fn is_settled(&self) -> bool {
        self.completion.is_none()
    }

    /// Resolve or reject the caller's completion. A caller that stopped
    /// waiting is not an error.
    pub fn settle(&mut self, result: Result<bool>) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(result);
        }
    }
}

/// FIFO queue of pending messages; insertion order is publish call order.
#[derive(Default)]
pub(crate) struct OutboundQueue {
    messages: VecDeque<PendingMessage>,
}

impl OutboundQueue {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push_back(&mut self, message: PendingMessage) {
        self.messages.push_back(message);
    }

    /// Put a message back at the head after a send raced with the channel closing.
    pub fn push_front(&mut self, message: PendingMessage) {
        self.messages.push_front(message);
    }

    pub fn pop_front(&mut self) -> Option<PendingMessage> {
        self.messages.pop_front()
    }

    /// Reject every unsettled message with `error`, leaving the queue empty.
    /// Returns how many were rejected.
    pub fn reject_all(&mut self, error: &RabbitMQError) -> usize {
        let mut rejected = 0;
        for mut message in self.messages.drain(..) {
            if !message.is_settled() {
                message.settle(Err(error.clone()));
                rejected += 1;
            }
        }
        rejected
    }
}
