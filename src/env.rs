use serde::Deserialize;
use std::time::Duration;
use std::env;
use dotenv::dotenv;

use crate::rabbitmq::{self, BrokerEndpoint, ConnectionOptions, ManagerOptions};

#[derive(Deserialize, Debug)]
pub struct Config {
    /// Comma-separated broker URLs.
    #[serde(rename = "AMQP_URLS")]
    pub amqp_urls: Vec<String>,

    #[serde(default = "default_heartbeat_seconds")]
    #[serde(rename = "AMQP_HEARTBEAT_SECONDS")]
    pub heartbeat_seconds: u16,

    #[serde(rename = "AMQP_RECONNECT_DELAY_SECONDS")]
    pub reconnect_delay_seconds: Option<u64>,

    #[serde(default = "default_connect_timeout_seconds")]
    #[serde(rename = "AMQP_CONNECT_TIMEOUT_SECONDS")]
    pub connect_timeout_seconds: u64,

    #[serde(rename = "AMQP_CONNECTION_NAME")]
    pub connection_name: Option<String>,
}

fn default_heartbeat_seconds() -> u16 {
    5
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

impl Config {
    /// Read `.env` if present, then the process environment.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let urls = lookup("AMQP_URLS").ok_or("AMQP_URLS is not set")?;
        let amqp_urls: Vec<String> = urls
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(String::from)
            .collect();
        if amqp_urls.is_empty() {
            return Err("AMQP_URLS contains no broker URLs".into());
        }

        Ok(Config {
            amqp_urls,
            heartbeat_seconds: match lookup("AMQP_HEARTBEAT_SECONDS") {
                Some(val) => val.parse()?,
                None => default_heartbeat_seconds(),
            },
            reconnect_delay_seconds: match lookup("AMQP_RECONNECT_DELAY_SECONDS") {
                Some(val) => Some(val.parse()?),
                None => None,
            },
            connect_timeout_seconds: match lookup("AMQP_CONNECT_TIMEOUT_SECONDS") {
                Some(val) => val.parse()?,
                None => default_connect_timeout_seconds(),
            },
            connection_name: lookup("AMQP_CONNECTION_NAME"),
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            heartbeat_seconds: self.heartbeat_seconds,
            reconnect_delay: self.reconnect_delay_seconds.map(Duration::from_secs),
            connect_timeout: Some(self.connect_timeout()),
        }
    }

    pub fn endpoints(&self) -> rabbitmq::Result<Vec<BrokerEndpoint>> {
        let options = ConnectionOptions {
            connection_name: self.connection_name.clone(),
            connect_timeout: Some(self.connect_timeout()),
        };
        self.amqp_urls
            .iter()
            .map(|url| BrokerEndpoint::with_options(url, options.clone()))
            .collect()
    }
}
