use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use lapin::options::QueueDeclareOptions;
use resilient_rabbitmq::rabbitmq::setup;
use resilient_rabbitmq::testing::MockConnector;
use resilient_rabbitmq::{
    ChannelEvent, ChannelWrapper, ChannelWrapperOptions, ConnectionEvent, ConsumeOptions,
    IncomingMessage, PublishOptions, RabbitMQError,
};

use crate::{manager, wait_until};

const A: &str = "amqp://node-a:5672";
const B: &str = "amqp://node-b:5672";

async fn wait_for_event<F>(wrapper: &ChannelWrapper, events: &mut tokio::sync::broadcast::Receiver<ChannelEvent>, wanted: F)
where
    F: Fn(&ChannelEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if wanted(&events.recv().await.unwrap()) {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("event never arrived on {:?}", wrapper));
}

#[tokio::test]
async fn test_publish_order_survives_failover() {
    let connector = MockConnector::new();
    let manager = manager(&connector, &[A, B]);
    let wrapper = manager.create_channel(ChannelWrapperOptions::named("orders"));
    wrapper.wait_for_connect(Some(Duration::from_secs(2))).await.unwrap();

    for key in ["1", "2"] {
        assert_eq!(
            wrapper.publish("", key, key.as_bytes().to_vec(), PublishOptions::default()).await,
            Ok(true)
        );
    }

    // Take everything down, then queue more while nothing is reachable
    connector.set_reachable(A, false);
    connector.set_reachable(B, false);
    connector.last_connection().unwrap().drop_connection();
    wait_until(|| !wrapper.is_connected()).await;

    let queued = {
        let wrapper = wrapper.clone();
        tokio::spawn(async move {
            let publishes = ["3", "4", "5"].map(|key| {
                wrapper.publish("", key, key.as_bytes().to_vec(), PublishOptions::default())
            });
            join_all(publishes).await
        })
    };
    wait_until(|| wrapper.queue_length() == 3).await;

    let mut events = wrapper.subscribe();
    connector.set_reachable(B, true);
    wait_for_event(&wrapper, &mut events, |e| matches!(e, ChannelEvent::Connect)).await;

    let results = queued.await.unwrap();
    assert!(results.iter().all(|r| r == &Ok(true)));
    assert_eq!(
        connector.broker().published_payloads(),
        ["1", "2", "3", "4", "5"].map(|k| k.as_bytes().to_vec()).to_vec()
    );
    assert_eq!(manager.current_url().as_deref(), Some(B));

    wrapper.close().await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_consumer_follows_reconnects() {
    let connector = MockConnector::new();
    let manager = manager(&connector, &[A]);
    let wrapper = ChannelWrapper::builder(&manager)
        .name("jobs")
        .setup(setup::declare_queue("jobs", QueueDeclareOptions::default()))
        .build();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    // Registered before any connection exists
    wrapper
        .consume(
            "jobs",
            move |message: IncomingMessage| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(String::from_utf8_lossy(&message.data).to_string());
                }
            },
            ConsumeOptions::default(),
        )
        .await
        .unwrap();
    wrapper.wait_for_connect(Some(Duration::from_secs(2))).await.unwrap();

    let broker = connector.broker();
    assert!(broker.deliver("jobs", b"before"));
    wait_until(|| received.lock().unwrap().len() == 1).await;

    let mut events = wrapper.subscribe();
    connector.last_connection().unwrap().drop_connection();
    wait_for_event(&wrapper, &mut events, |e| matches!(e, ChannelEvent::Connect)).await;

    assert_eq!(broker.consumer_tags("jobs").len(), 1);
    assert!(broker.deliver("jobs", b"after"));
    wait_until(|| received.lock().unwrap().len() == 2).await;
    assert_eq!(*received.lock().unwrap(), vec!["before".to_string(), "after".to_string()]);

    wrapper.cancel_all().await.unwrap();
    assert!(broker.consumer_tags("jobs").is_empty());
    assert_eq!(wrapper.consumer_count(), 0);

    wrapper.close().await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_blocked_connection_is_reported_to_listeners() {
    let connector = MockConnector::new();
    let manager = manager(&connector, &[A]);
    let wrapper = manager.create_channel(ChannelWrapperOptions::default());
    wrapper.wait_for_connect(Some(Duration::from_secs(2))).await.unwrap();
    let mut events = manager.subscribe();

    connector.last_connection().unwrap().block("low on memory");
    let reason = loop {
        if let ConnectionEvent::Blocked { reason } = events.recv().await.unwrap() {
            break reason;
        }
    };
    assert_eq!(reason, "low on memory");
    assert!(wrapper.is_connected());

    wrapper.close().await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_closing_the_manager_leaves_publishes_queued_until_wrapper_close() {
    let connector = MockConnector::new();
    let manager = manager(&connector, &[A]);
    let wrapper = manager.create_channel(ChannelWrapperOptions::default());
    wrapper.wait_for_connect(Some(Duration::from_secs(2))).await.unwrap();

    manager.close().await.unwrap();
    wait_until(|| !wrapper.is_connected()).await;

    let pending = {
        let wrapper = wrapper.clone();
        tokio::spawn(async move {
            wrapper
                .publish("", "never", b"x".to_vec(), PublishOptions::default())
                .await
        })
    };
    wait_until(|| wrapper.queue_length() == 1).await;

    wrapper.close().await.unwrap();
    assert!(matches!(pending.await.unwrap(), Err(RabbitMQError::ChannelClosed(_))));
    assert_eq!(wrapper.queue_length(), 0);
    assert_eq!(manager.listener_count(), 0);
}
