//! Port traits implemented by infrastructure crates.
//!
//! The broker is modelled as a capability set (connect, bind, receive,
//! acknowledge, release, publish, disconnect) rather than a vendor type, so any broker
//! adapter can sit behind the session and subscription contracts. The
//! orchestration engine is reached through [`ExecutionSink`].
//!
//! Adapters report transport failures through the typed errors in
//! [`crate::errors`]; they never retry internally.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    ConnectionConfig, ConnectionError, DeliveryMode, DeliveryTag, EmitError, MessageBody,
    PublishError, QueueKind, QueueName, RawMessage, SessionClosedError, SessionId,
    SubscriptionError, TopicFilter, TopicName, TriggerContext,
};

/// What a queue binding should look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub queue: QueueName,
    pub topics: Vec<TopicFilter>,
    pub kind: QueueKind,
    /// Create the queue when it does not exist instead of failing.
    pub auto_create: bool,
}

/// Opens authenticated connections to a broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Connects and authenticates. Fails fast; no retry.
    async fn connect(
        &self,
        session_id: SessionId,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn BrokerConnection>, ConnectionError>;
}

/// One live, authenticated broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Binds a consumer to `spec.queue`, adding the topic subscriptions.
    async fn bind_queue(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<Box<dyn QueueConsumer>, SubscriptionError>;

    /// Publishes one message to a topic.
    ///
    /// For [`DeliveryMode::Persistent`] the call completes when the broker
    /// acknowledges the message; `ack_timeout` bounds that wait.
    async fn publish(
        &self,
        topic: &TopicName,
        body: MessageBody,
        mode: DeliveryMode,
        ack_timeout: Duration,
    ) -> Result<(), PublishError>;

    /// Tears the connection down. Called at most once by the session.
    async fn disconnect(&self) -> Result<(), SessionClosedError>;

    /// `false` once the broker or the client has closed the connection.
    fn is_connected(&self) -> bool;
}

/// A consumer bound to one queue.
#[async_trait]
pub trait QueueConsumer: Send {
    /// Waits up to `timeout` for the next message. `Ok(None)` means the
    /// timeout elapsed with nothing to deliver.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a message.
    async fn receive(&mut self, timeout: Duration)
        -> Result<Option<RawMessage>, SessionClosedError>;

    /// Acknowledges one delivered message so the broker removes it.
    async fn acknowledge(&mut self, tag: DeliveryTag) -> Result<(), SessionClosedError>;

    /// Hands a delivered message back to the queue unacknowledged so it is
    /// redelivered, flagged as such.
    async fn release(&mut self, tag: DeliveryTag) -> Result<(), SessionClosedError>;

    /// Releases the binding. Unacknowledged messages return to the queue.
    async fn unbind(&mut self) -> Result<(), SessionClosedError>;
}

/// Hands trigger contexts to the orchestration engine.
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    async fn emit(&self, context: TriggerContext) -> Result<(), EmitError>;
}
