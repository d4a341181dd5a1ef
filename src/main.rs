use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lapin::options::{ExchangeDeclareOptions, QueueDeclareOptions};
use lapin::ExchangeKind;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use resilient_rabbitmq::config::{self, ChannelSettings};
use resilient_rabbitmq::env::Config;
use resilient_rabbitmq::rabbitmq::setup;
use resilient_rabbitmq::{
    BrokerEndpoint, ChannelEvent, ChannelWrapper, ConnectionEvent, ConnectionManager,
    ConsumeOptions, IncomingMessage, ManagerOptions, PublishOptions,
};

#[derive(Debug, Serialize, Deserialize)]
struct DemoEvent {
    id: Uuid,
    sequence: u64,
    sent_at: DateTime<Utc>,
}

struct Topology {
    name: String,
    exchange: String,
    queue: String,
    routing_key: String,
    prefetch: u16,
}

impl From<&ChannelSettings> for Topology {
    fn from(settings: &ChannelSettings) -> Self {
        Self {
            name: settings.name.clone(),
            exchange: settings.exchange.clone(),
            queue: settings.queue.clone(),
            routing_key: settings.routing_key.clone(),
            prefetch: settings.prefetch,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if std::env::args().any(|arg| arg == "--init-config") {
        return config::create_default_config_file(Path::new("resilient-rabbitmq.json"));
    }

    let (endpoints, options, topology) = load_settings()?;
    let manager = ConnectionManager::with_lapin(endpoints, options)?;
    spawn_connection_logger(&manager);

    let wrapper = ChannelWrapper::builder(&manager)
        .name(&topology.name)
        .setup(setup::declare_exchange(
            &topology.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
        ))
        .setup(setup::declare_queue(
            &topology.queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
        ))
        .setup(setup::bind_queue(&topology.queue, &topology.exchange, &topology.routing_key))
        .build();
    spawn_channel_logger(&wrapper);

    let acker = wrapper.clone();
    wrapper
        .consume(
            &topology.queue,
            move |message: IncomingMessage| {
                let acker = acker.clone();
                async move {
                    match serde_json::from_slice::<DemoEvent>(&message.data) {
                        Ok(event) => info!(
                            id = %event.id,
                            sequence = event.sequence,
                            sent_at = %event.sent_at,
                            "Received event"
                        ),
                        Err(e) => warn!("Received a message that is not a demo event: {}", e),
                    }
                    acker.ack(&message);
                }
            },
            ConsumeOptions::default().with_prefetch(topology.prefetch),
        )
        .await?;

    let publisher = wrapper.clone();
    let exchange = topology.exchange.clone();
    let routing_key = topology.routing_key.clone();
    let producer = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        for sequence in 1.. {
            interval.tick().await;
            let event = DemoEvent {
                id: Uuid::new_v4(),
                sequence,
                sent_at: Utc::now(),
            };
            let payload = match serde_json::to_vec(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            // Resolves once the event is on a channel, however long that takes
            match publisher
                .publish(&exchange, &routing_key, payload, PublishOptions::persistent_json())
                .await
            {
                Ok(_) => info!(sequence, "Published event"),
                Err(e) => {
                    warn!("Stopped publishing: {}", e);
                    break;
                }
            }
        }
    });

    info!("Running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;

    info!(queued = wrapper.queue_length(), "Shutting down");
    wrapper.close().await?;
    producer.abort();
    manager.close().await?;
    Ok(())
}

/// Prefer the JSON config file; fall back to environment variables.
fn load_settings() -> Result<(Vec<BrokerEndpoint>, ManagerOptions, Topology)> {
    match config::load_config() {
        Ok(config) => {
            let topology = Topology::from(&config.channel);
            Ok((config.endpoints()?, config.manager_options(), topology))
        }
        Err(file_error) => {
            info!("No usable config file ({}), reading environment", file_error);
            let env = Config::load().map_err(|e| anyhow::anyhow!("{}", e))?;
            let topology = Topology::from(&ChannelSettings::default());
            Ok((env.endpoints()?, env.manager_options(), topology))
        }
    }
}

fn spawn_connection_logger(manager: &ConnectionManager) {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::Connected { url, .. } => info!(url = %url, "connect"),
                ConnectionEvent::ConnectFailed { url, error } => {
                    warn!(url = %url, "connectFailed: {}", error)
                }
                ConnectionEvent::Disconnected { error: Some(error) } => {
                    warn!("disconnect: {}", error)
                }
                ConnectionEvent::Disconnected { error: None } => info!("disconnect"),
                ConnectionEvent::Blocked { reason } => warn!("blocked: {}", reason),
                ConnectionEvent::Unblocked => info!("unblocked"),
            }
        }
    });
}

fn spawn_channel_logger(wrapper: &ChannelWrapper) {
    let mut events = wrapper.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ChannelEvent::Connect => info!("channel connect"),
                ChannelEvent::Error { error, name } => {
                    error!(channel = ?name, "channel error: {}", error)
                }
                ChannelEvent::Close => break,
            }
        }
    });
}
