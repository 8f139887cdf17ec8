use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bridge::{
    BatchPolicy, ConnectionConfig, Credentials, EmitError, EvaluationError, ExecutionSink, FlowId,
    QueueName, SubscriptionError, TopicFilter, TopicName, TriggerConfig, TriggerContext, TriggerId,
};
use listener::{TriggerEvaluator, TriggerRunner};
use memory_broker::InMemoryBroker;
use session::SessionFactory;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingSink {
    contexts: Mutex<Vec<TriggerContext>>,
    refuse: bool,
}

impl RecordingSink {
    fn counts(&self) -> Vec<usize> {
        self.contexts
            .lock()
            .unwrap()
            .iter()
            .map(TriggerContext::messages_count)
            .collect()
    }
}

#[async_trait]
impl ExecutionSink for RecordingSink {
    async fn emit(&self, context: TriggerContext) -> Result<(), EmitError> {
        if self.refuse {
            return Err(EmitError {
                reason: "engine unavailable".to_string(),
            });
        }
        self.contexts.lock().unwrap().push(context);
        Ok(())
    }
}

fn queue() -> QueueName {
    QueueName::new("test").unwrap()
}

fn runner(broker: &InMemoryBroker, sink: Arc<RecordingSink>) -> TriggerRunner {
    let connection = ConnectionConfig::new(
        "tcp://localhost:55555",
        "default",
        "admin",
        Credentials::Password("admin".to_string()),
    )
    .unwrap();
    let mut config = TriggerConfig::new(
        FlowId::new("trigger").unwrap(),
        TriggerId::new("solace").unwrap(),
        connection,
        queue(),
        vec![TopicFilter::parse("events/>").unwrap()],
        Duration::from_millis(500),
    )
    .unwrap();
    config.interval = Duration::from_secs(1);
    config.batch = BatchPolicy::default().with_max_messages(10).unwrap();

    let evaluator = TriggerEvaluator::new(config, SessionFactory::new(Arc::new(broker.clone())));
    TriggerRunner::new(evaluator, sink)
}

fn broker_with_queue() -> InMemoryBroker {
    let broker = InMemoryBroker::new().with_user("default", "admin", "admin");
    broker.create_queue_with_subscription(&queue(), &TopicFilter::parse("events/>").unwrap());
    broker
}

fn publish(broker: &InMemoryBroker, topic: &str) {
    broker.publish_raw(&TopicName::parse(topic).unwrap(), br#"{"ok":true}"#, None);
}

#[tokio::test(start_paused = true)]
async fn runner_emits_each_batch_until_stopped() {
    let broker = broker_with_queue();
    let sink = Arc::new(RecordingSink::default());
    let runner = Arc::new(runner(&broker, Arc::clone(&sink)));
    let stop = CancellationToken::new();

    publish(&broker, "events/a");
    publish(&broker, "events/a/b");
    let task = tokio::spawn({
        let runner = Arc::clone(&runner);
        let stop = stop.clone();
        async move { runner.run(stop).await }
    });

    tokio::time::sleep(Duration::from_secs(3)).await;
    publish(&broker, "events/c");
    // Not routed: the queue only listens below `events/`.
    publish(&broker, "audit/c");
    tokio::time::sleep(Duration::from_secs(3)).await;
    stop.cancel();

    let summary = task.await.unwrap().unwrap();
    assert_eq!(sink.counts(), vec![2, 1]);
    assert_eq!(summary.emitted, 2);
    assert_eq!(summary.emit_failures, 0);
    assert!(summary.cycles >= 3);
    assert_eq!(broker.active_connections(), 0);
    assert_eq!(runner.evaluator().stats().messages, 3);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_error_stops_the_runner() {
    let broker = InMemoryBroker::new().with_user("default", "admin", "admin");
    let sink = Arc::new(RecordingSink::default());
    let runner = runner(&broker, Arc::clone(&sink));

    let err = runner.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(
        err,
        EvaluationError::Subscription(SubscriptionError::QueueNotFound { .. })
    ));
    assert!(sink.counts().is_empty());
    assert_eq!(broker.active_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn retryable_errors_are_retried() {
    let broker = broker_with_queue();
    broker.set_reachable(false);
    let sink = Arc::new(RecordingSink::default());
    let runner = Arc::new(runner(&broker, Arc::clone(&sink)));
    let stop = CancellationToken::new();

    let task = tokio::spawn({
        let runner = Arc::clone(&runner);
        let stop = stop.clone();
        async move { runner.run(stop).await }
    });

    tokio::time::sleep(Duration::from_millis(2500)).await;
    broker.set_reachable(true);
    publish(&broker, "events/a");
    tokio::time::sleep(Duration::from_secs(3)).await;
    stop.cancel();

    let summary = task.await.unwrap().unwrap();
    assert!(summary.failed_cycles >= 2);
    assert_eq!(sink.counts(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn refused_emits_are_counted_and_do_not_stop_the_runner() {
    let broker = broker_with_queue();
    let sink = Arc::new(RecordingSink {
        refuse: true,
        ..RecordingSink::default()
    });
    let runner = Arc::new(runner(&broker, Arc::clone(&sink)));
    let stop = CancellationToken::new();
    publish(&broker, "events/a");

    let task = tokio::spawn({
        let runner = Arc::clone(&runner);
        let stop = stop.clone();
        async move { runner.run(stop).await }
    });
    tokio::time::sleep(Duration::from_secs(2)).await;
    stop.cancel();

    let summary = task.await.unwrap().unwrap();
    assert_eq!(summary.emit_failures, 1);
    assert_eq!(summary.emitted, 0);
}
