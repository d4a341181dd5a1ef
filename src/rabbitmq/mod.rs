// src/rabbitmq/mod.rs
// Resilient RabbitMQ connection management and channel wrapping

// RabbitMQ-specific errors
pub mod errors;
pub mod endpoint;
pub mod connection;
pub mod channel_wrapper;
pub mod setup;

// Transport seam and its lapin implementation
pub mod amqp_client;
pub mod lapin_client;

mod consumer;
mod publisher;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{AmqpChannel, IncomingMessage, QueueInfo};
pub use channel_wrapper::{ChannelEvent, ChannelWrapper, ChannelWrapperBuilder, ChannelWrapperOptions};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, ManagerOptions, ManagerStatus};
pub use consumer::{ConsumeOptions, MessageHandler};
pub use endpoint::{BrokerEndpoint, ConnectionOptions};
pub use errors::{RabbitMQError, Result};
pub use publisher::{PublishOptions, PUBLISH_BATCH_SIZE};
pub use setup::SetupAction;
