use std::time::Duration;

use resilient_rabbitmq::rabbitmq::amqp_client::AmqpConnection;
use resilient_rabbitmq::testing::MockConnector;
use resilient_rabbitmq::{ConnectionEvent, ConnectionState, RabbitMQError};
use tokio::sync::broadcast;

use crate::{manager, manager_with, wait_until};

const A: &str = "amqp://node-a:5672";
const B: &str = "amqp://node-b:5672";
const C: &str = "amqp://node-c:5672";

/// Collect `ConnectFailed` urls until the next `Connected`, returning both.
async fn until_connected(events: &mut broadcast::Receiver<ConnectionEvent>) -> (Vec<String>, String) {
    let mut failed = Vec::new();
    let connected = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await.unwrap() {
                ConnectionEvent::ConnectFailed { url, .. } => failed.push(url),
                ConnectionEvent::Connected { url, .. } => return url,
                _ => {}
            }
        }
    })
    .await
    .expect("never connected");
    (failed, connected)
}

#[tokio::test]
async fn test_fails_over_round_robin() {
    let connector = MockConnector::new();
    connector.set_reachable(A, false);
    connector.set_reachable(B, false);
    let manager = manager(&connector, &[A, B, C]);
    let mut events = manager.subscribe();

    manager.start();
    let (failed, connected) = until_connected(&mut events).await;
    assert_eq!(failed, vec![A.to_string(), B.to_string()]);
    assert_eq!(connected, C);
    assert_eq!(manager.current_url().as_deref(), Some(C));
    assert_eq!(manager.status().failed_attempts, 2);

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_lost_connection_moves_to_next_broker() {
    let connector = MockConnector::new();
    let manager = manager(&connector, &[A, B]);
    let mut events = manager.subscribe();
    manager.connect(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(manager.current_url().as_deref(), Some(A));

    connector.last_connection().unwrap().drop_connection();
    loop {
        if let ConnectionEvent::Disconnected { error } = events.recv().await.unwrap() {
            assert!(matches!(error, Some(RabbitMQError::ConnectionError(_))));
            break;
        }
    }

    let (failed, connected) = until_connected(&mut events).await;
    assert!(failed.is_empty());
    assert_eq!(connected, B);
    assert_eq!(connector.attempts(), vec![A.to_string(), B.to_string()]);

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_keeps_retrying_until_a_broker_comes_back() {
    let connector = MockConnector::new();
    connector.set_reachable(A, false);
    let manager = manager(&connector, &[A]);
    manager.start();

    wait_until(|| connector.attempts().len() >= 3).await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!manager.is_connected());

    connector.set_reachable(A, true);
    manager.connect(Some(Duration::from_secs(2))).await.unwrap();
    assert!(manager.is_connected());

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_hanging_broker_is_abandoned_after_connect_timeout() {
    let connector = MockConnector::new();
    connector.set_hanging(A, true);
    let manager = manager_with(&connector, &[A, B], Some(Duration::from_millis(50)));
    let mut events = manager.subscribe();

    manager.start();
    let first_failure = loop {
        if let ConnectionEvent::ConnectFailed { url, error } = events.recv().await.unwrap() {
            break (url, error);
        }
    };
    assert_eq!(first_failure.0, A);
    assert!(matches!(first_failure.1, RabbitMQError::TimeoutError(_)));

    let (_, connected) = until_connected(&mut events).await;
    assert_eq!(connected, B);

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_close_emits_disconnect_and_ends_the_loop() {
    let connector = MockConnector::new();
    let manager = manager(&connector, &[A]);
    manager.connect(Some(Duration::from_secs(2))).await.unwrap();
    let mut events = manager.subscribe();

    manager.close().await.unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        ConnectionEvent::Disconnected { error: None }
    ));
    assert!(!connector.last_connection().unwrap().is_connected());
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(connector.attempts().len(), 1);
}
