// src/rabbitmq/errors.rs

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::Error as LapinError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ refused the connection: {0}")]
    AccessRefused(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("RabbitMQ connection lost: {0}")]
    ConnectionLost(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Channel setup failed: {0}")]
    SetupError(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("Connection manager closed")]
    ManagerClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// The broker answered 404: the queue or exchange does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RabbitMQError::NotFound(_))
    }

    /// The operation raced with the channel, or the connection under it, going away.
    pub fn is_channel_closed(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ChannelClosed(_) | RabbitMQError::ConnectionLost(_)
        )
    }

    /// Credentials or vhost were refused; retrying the same endpoint will not help.
    pub fn is_refusal(&self) -> bool {
        matches!(self, RabbitMQError::AccessRefused(_))
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        let error_text = error.to_string();

        match &error {
            LapinError::ProtocolError(amqp_error) => match amqp_error.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => RabbitMQError::NotFound(error_text),
                AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => {
                    RabbitMQError::AccessRefused(error_text)
                }
                _ => classify_text(error_text),
            },
            LapinError::InvalidChannelState(_) | LapinError::InvalidChannel(_) => {
                RabbitMQError::ChannelClosed(error_text)
            }
            LapinError::InvalidConnectionState(_) | LapinError::IOError(_) => {
                RabbitMQError::ConnectionLost(error_text)
            }
            _ => classify_text(error_text),
        }
    }
}

// Use string representation for anything the variant alone does not settle
fn classify_text(error_text: String) -> RabbitMQError {
    let lowered = error_text.to_lowercase();

    if lowered.contains("access_refused") || lowered.contains("access-refused") {
        RabbitMQError::AccessRefused(error_text)
    } else if lowered.contains("not_found") || lowered.contains("not-found") {
        RabbitMQError::NotFound(error_text)
    } else if lowered.contains("connection") {
        RabbitMQError::ConnectionError(error_text)
    } else if lowered.contains("channel") {
        RabbitMQError::ChannelError(error_text)
    } else if lowered.contains("publish") {
        RabbitMQError::PublishError(error_text)
    } else if lowered.contains("consume") {
        RabbitMQError::ConsumeError(error_text)
    } else if lowered.contains("ack") || lowered.contains("nack") {
        RabbitMQError::AckError(error_text)
    } else {
        RabbitMQError::Unknown(error_text)
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}

impl From<url::ParseError> for RabbitMQError {
    fn from(error: url::ParseError) -> Self {
        RabbitMQError::ConfigError(format!("Invalid broker URL: {}", error))
    }
}

impl From<String> for RabbitMQError {
    fn from(message: String) -> Self {
        RabbitMQError::Unknown(message)
    }
}

impl From<&str> for RabbitMQError {
    fn from(message: &str) -> Self {
        RabbitMQError::Unknown(message.to_string())
    }
}
