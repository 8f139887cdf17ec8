use std::sync::Arc;
use std::time::Duration;

use bridge::{
    ConnectionConfig, ConnectionError, Credentials, DeliveryMode, MessageCodec, Payload,
    QueueKind, QueueName, SubscriptionError, SubscriptionSpec, TopicFilter, TopicName,
};
use memory_broker::InMemoryBroker;
use serde_json::json;
use session::{CloseOutcome, QueueSubscription, SessionFactory};

fn config() -> ConnectionConfig {
    ConnectionConfig::new(
        "tcp://localhost:55555",
        "default",
        "admin",
        Credentials::Password("admin".to_string()),
    )
    .unwrap()
}

fn spec(topics: &[&str]) -> SubscriptionSpec {
    SubscriptionSpec {
        queue: QueueName::new("test").unwrap(),
        topics: topics.iter().map(|t| TopicFilter::parse(*t).unwrap()).collect(),
        kind: QueueKind::DurableExclusive,
        auto_create: true,
    }
}

fn setup() -> (InMemoryBroker, SessionFactory) {
    let broker = InMemoryBroker::new().with_user("default", "admin", "admin");
    let factory = SessionFactory::new(Arc::new(broker.clone()));
    (broker, factory)
}

#[tokio::test]
async fn published_payload_is_received_and_acknowledged() {
    let (broker, factory) = setup();
    let mut session = factory.open(&config()).await.unwrap();
    let mut subscription = QueueSubscription::subscribe(&session, spec(&["topic"]))
        .await
        .unwrap();

    let payload = Payload::new().with("payload", "value1");
    let body = MessageCodec::new().encode(&payload).unwrap();
    session
        .publish(
            &TopicName::parse("topic").unwrap(),
            body,
            DeliveryMode::Persistent,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    let message = subscription
        .receive(Duration::from_millis(100))
        .await
        .unwrap()
        .expect("message");
    assert_eq!(
        MessageCodec::new().decode(&message).unwrap().into_value(),
        json!({"payload": "value1"})
    );

    subscription.acknowledge(message.delivery_tag).await.unwrap();
    assert_eq!(broker.in_flight(&subscription.spec().queue), Some(0));

    subscription.unsubscribe().await.unwrap();
    assert_eq!(session.close().await, CloseOutcome::Closed);
}

#[tokio::test(start_paused = true)]
async fn receive_returns_none_when_nothing_arrives() {
    let (_broker, factory) = setup();
    let mut session = factory.open(&config()).await.unwrap();
    let mut subscription = QueueSubscription::subscribe(&session, spec(&["topic"]))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let received = subscription.receive(Duration::from_secs(3)).await.unwrap();
    assert!(received.is_none());
    assert_eq!(started.elapsed(), Duration::from_secs(3));

    session.close().await;
}

#[tokio::test]
async fn empty_topic_set_is_rejected() {
    let (_broker, factory) = setup();
    let mut session = factory.open(&config()).await.unwrap();
    let err = QueueSubscription::subscribe(&session, spec(&[]))
        .await
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::NoTopics { .. }));
    session.close().await;
}

#[tokio::test]
async fn subscribing_on_a_closed_session_fails() {
    let (_broker, factory) = setup();
    let mut session = factory.open(&config()).await.unwrap();
    session.close().await;

    let err = QueueSubscription::subscribe(&session, spec(&["topic"]))
        .await
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::SessionClosed(_)));
}

#[tokio::test]
async fn unsubscribe_after_close_is_a_no_op() {
    let (broker, factory) = setup();
    let mut session = factory.open(&config()).await.unwrap();
    let mut subscription = QueueSubscription::subscribe(&session, spec(&["topic"]))
        .await
        .unwrap();

    assert_eq!(session.close().await, CloseOutcome::Closed);
    assert!(!subscription.is_active());
    subscription.unsubscribe().await.unwrap();
    subscription.unsubscribe().await.unwrap();
    assert!(subscription.receive(Duration::from_millis(10)).await.is_err());
    assert_eq!(broker.active_connections(), 0);
}

#[tokio::test]
async fn released_delivery_is_redelivered() {
    let (broker, factory) = setup();
    let mut session = factory.open(&config()).await.unwrap();
    let mut subscription = QueueSubscription::subscribe(&session, spec(&["orders/>"]))
        .await
        .unwrap();
    broker.publish_raw(&TopicName::parse("orders/eu/1").unwrap(), b"{}", None);

    let first = subscription
        .receive(Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert!(!first.redelivered);
    subscription.release(first.delivery_tag).await.unwrap();

    let again = subscription
        .receive(Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert!(again.redelivered);
    assert_eq!(again.topic.as_str(), "orders/eu/1");

    session.close().await;
}

#[tokio::test]
async fn broker_disconnect_surfaces_as_session_closed() {
    let (broker, factory) = setup();
    let mut session = factory.open(&config()).await.unwrap();
    let mut subscription = QueueSubscription::subscribe(&session, spec(&["topic"]))
        .await
        .unwrap();

    broker.disconnect_all();

    assert!(!session.is_open());
    assert!(subscription.receive(Duration::from_millis(10)).await.is_err());
    // Closing a session the broker already dropped still succeeds.
    assert_eq!(session.close().await, CloseOutcome::Closed);
    assert_eq!(factory.live_sessions(), 0);
}

#[tokio::test]
async fn bad_credentials_fail_fast() {
    let (_broker, factory) = setup();
    let bad = ConnectionConfig::new(
        "tcp://localhost:55555",
        "default",
        "admin",
        Credentials::Token("expired".to_string()),
    )
    .unwrap();

    let err = factory.open(&bad).await.unwrap_err();
    assert!(matches!(err, ConnectionError::Authentication { .. }));
    assert!(err.retry_policy().is_retryable());
    assert_eq!(factory.live_sessions(), 0);
}

#[tokio::test]
async fn dropped_session_frees_the_exclusive_queue() {
    let (broker, factory) = setup();
    let session = factory.open(&config()).await.unwrap();
    let subscription = QueueSubscription::subscribe(&session, spec(&["topic"]))
        .await
        .unwrap();

    drop(subscription);
    drop(session);
    for _ in 0..10 {
        if factory.live_sessions() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(factory.live_sessions(), 0);
    assert_eq!(broker.active_connections(), 0);

    let mut session = factory.open(&config()).await.unwrap();
    let mut subscription = QueueSubscription::subscribe(&session, spec(&["topic"]))
        .await
        .unwrap();
    subscription.unsubscribe().await.unwrap();
    session.close().await;
}
