//! Resilient RabbitMQ client
//!
//! A [`ConnectionManager`] keeps one logical AMQP connection alive across a
//! list of brokers, reconnecting round-robin after a fixed delay. A
//! [`ChannelWrapper`] sits on top of it and hides reconnects from callers:
//! publishes queue while disconnected, setup re-runs on every new channel and
//! consumers are re-subscribed automatically.

pub mod config;
pub mod env;
pub mod rabbitmq;
pub mod testing;

pub use rabbitmq::{
    BrokerEndpoint, ChannelEvent, ChannelWrapper, ChannelWrapperOptions, ConnectionEvent,
    ConnectionManager, ConnectionState, ConsumeOptions, IncomingMessage, ManagerOptions,
    PublishOptions, RabbitMQError, Result,
};
