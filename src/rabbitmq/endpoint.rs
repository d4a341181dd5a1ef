// src/rabbitmq/endpoint.rs
// Broker addresses and the round-robin cursor over them

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use url::Url;

use super::errors::{RabbitMQError, Result};

/// Raw per-connection options handed to the transport with each attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Shown in the broker management UI as the client-provided name.
    pub connection_name: Option<String>,

    /// Bound on a single connect attempt against this endpoint.
    pub connect_timeout: Option<Duration>,
}

/// One candidate broker. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    url: String,
    options: ConnectionOptions,
}

impl BrokerEndpoint {
    pub fn new(url: &str) -> Result<Self> {
        Self::with_options(url, ConnectionOptions::default())
    }

    pub fn with_options(url: &str, options: ConnectionOptions) -> Result<Self> {
        let parsed = Url::parse(url)?;
        match parsed.scheme() {
            "amqp" | "amqps" => {}
            other => {
                return Err(RabbitMQError::ConfigError(format!(
                    "Unsupported scheme '{}' in broker URL",
                    other
                )))
            }
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(RabbitMQError::ConfigError(
                "Broker URL has no host".to_string(),
            ));
        }

        Ok(Self {
            url: url.to_string(),
            options,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// The URL with any password masked, safe for logs and events.
    pub fn redacted_url(&self) -> String {
        match Url::parse(&self.url) {
            Ok(mut parsed) if parsed.password().is_some() => {
                let _ = parsed.set_password(Some("****"));
                parsed.to_string()
            }
            _ => self.url.clone(),
        }
    }
}

impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("url", &self.redacted_url())
            .field("options", &self.options)
            .finish()
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted_url())
    }
}

/// Ordered, non-empty list of endpoints with a wrapping cursor.
#[derive(Debug)]
pub struct EndpointList {
    endpoints: Vec<BrokerEndpoint>,
    cursor: AtomicUsize,
}

impl EndpointList {
    pub fn new(endpoints: Vec<BrokerEndpoint>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(RabbitMQError::ConfigError(
                "At least one broker endpoint is required".to_string(),
            ));
        }

        Ok(Self {
            endpoints,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Endpoint under the cursor.
    pub fn current(&self) -> &BrokerEndpoint {
        &self.endpoints[self.cursor() % self.endpoints.len()]
    }

    /// Move the cursor to the next endpoint, wrapping at the end of the list.
    pub fn advance(&self) -> usize {
        let len = self.endpoints.len();
        let next = (self.cursor() + 1) % len;
        self.cursor.store(next, Ordering::SeqCst);
        next
    }

    pub fn iter(&self) -> impl Iterator<Item = &BrokerEndpoint> {
        self.endpoints.iter()
    }
}
