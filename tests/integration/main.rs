// Integration tests run against the in-memory broker; no RabbitMQ needed.

mod channel_test;
mod connection_test;

use std::sync::Arc;
use std::time::Duration;

use resilient_rabbitmq::testing::MockConnector;
use resilient_rabbitmq::{BrokerEndpoint, ConnectionManager, ManagerOptions};

pub const RECONNECT_DELAY: Duration = Duration::from_millis(20);

pub fn manager(connector: &MockConnector, urls: &[&str]) -> ConnectionManager {
    manager_with(connector, urls, None)
}

pub fn manager_with(
    connector: &MockConnector,
    urls: &[&str],
    connect_timeout: Option<Duration>,
) -> ConnectionManager {
    let endpoints = urls
        .iter()
        .map(|url| BrokerEndpoint::new(url).expect("valid test URL"))
        .collect();
    ConnectionManager::new(
        endpoints,
        ManagerOptions {
            heartbeat_seconds: 5,
            reconnect_delay: Some(RECONNECT_DELAY),
            connect_timeout,
        },
        Arc::new(connector.clone()),
    )
    .expect("manager")
}

pub async fn wait_until<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
