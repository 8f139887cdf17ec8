//! Connection and consumer handles handed out by [`crate::InMemoryBroker`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge::{
    BrokerConnection, DeliveryMode, DeliveryTag, MessageBody, PublishError, QueueConsumer,
    RawMessage, SessionClosedError, SessionId, SubscriptionError, SubscriptionSpec, Timestamp,
    TopicName,
};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::broker::{lock, QueueState, Shared, StoredMessage};

pub(crate) struct MemoryConnection {
    shared: Shared,
    session_id: SessionId,
    connected: Arc<AtomicBool>,
}

impl MemoryConnection {
    pub(crate) fn new(shared: Shared, session_id: SessionId, connected: Arc<AtomicBool>) -> Self {
        Self {
            shared,
            session_id,
            connected,
        }
    }

    fn ensure_connected(&self) -> Result<(), SessionClosedError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SessionClosedError::new("connection dropped by broker"))
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn bind_queue(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<Box<dyn QueueConsumer>, SubscriptionError> {
        self.ensure_connected()?;
        let mut inner = lock(&self.shared);

        if !inner.queues.contains_key(&spec.queue) {
            if !spec.auto_create {
                return Err(SubscriptionError::QueueNotFound {
                    queue: spec.queue.to_string(),
                });
            }
            inner
                .queues
                .insert(spec.queue.clone(), QueueState::new(spec.kind, Vec::new()));
            debug!(queue = %spec.queue, kind = ?spec.kind, "Queue created on bind");
        }

        inner.next_consumer += 1;
        let consumer_id = inner.next_consumer;

        let Some(queue) = inner.queues.get_mut(&spec.queue) else {
            return Err(SubscriptionError::QueueNotFound {
                queue: spec.queue.to_string(),
            });
        };
        if queue.kind.is_exclusive() && !queue.consumers.is_empty() {
            return Err(SubscriptionError::Refused {
                queue: spec.queue.to_string(),
                reason: "exclusive queue already has a consumer".to_string(),
            });
        }
        for topic in &spec.topics {
            if !queue.subscriptions.contains(topic) {
                queue.subscriptions.push(topic.clone());
            }
        }
        queue.consumers.insert(consumer_id);
        let notify = Arc::clone(&queue.notify);

        inner
            .consumers
            .insert(consumer_id, (self.session_id, spec.queue.clone()));

        Ok(Box::new(MemoryConsumer {
            shared: Arc::clone(&self.shared),
            consumer_id,
            queue: spec.queue.clone(),
            notify,
            connected: Arc::clone(&self.connected),
        }))
    }

    async fn publish(
        &self,
        topic: &TopicName,
        body: MessageBody,
        mode: DeliveryMode,
        ack_timeout: Duration,
    ) -> Result<(), PublishError> {
        self.ensure_connected()?;

        let ack_delay = {
            let mut inner = lock(&self.shared);
            if let Some(limit) = inner.reject_publishes_after {
                if inner.published >= limit {
                    return Err(PublishError::Rejected {
                        reason: "publish quota exhausted".to_string(),
                    });
                }
            }
            inner.published += 1;
            let routed = inner.route(StoredMessage {
                body: body.bytes,
                content_type: Some(body.content_type),
                topic: topic.clone(),
                properties: body.properties,
                redelivered: false,
            });
            debug!(%topic, routed, ?mode, "Message published");
            match mode {
                DeliveryMode::Direct => None,
                DeliveryMode::Persistent => inner.persistent_ack_delay,
            }
        };

        if let Some(delay) = ack_delay {
            if delay > ack_timeout {
                tokio::time::sleep(ack_timeout).await;
                return Err(PublishError::AcknowledgementTimeout {
                    timeout: ack_timeout,
                });
            }
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionClosedError> {
        if !self.connected.load(Ordering::Acquire) {
            debug!(session_id = %self.session_id, "Connection already dropped");
            return Ok(());
        }
        lock(&self.shared).drop_session(self.session_id);
        debug!(session_id = %self.session_id, "Client disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

pub(crate) struct MemoryConsumer {
    shared: Shared,
    consumer_id: u64,
    queue: bridge::QueueName,
    notify: Arc<Notify>,
    connected: Arc<AtomicBool>,
}

impl MemoryConsumer {
    /// Pops the next ready message and records it as in flight.
    fn try_take(&self) -> Result<Option<RawMessage>, SessionClosedError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(SessionClosedError::new("connection dropped by broker"));
        }
        let mut inner = lock(&self.shared);
        if !inner.consumers.contains_key(&self.consumer_id) {
            return Err(SessionClosedError::new("consumer was unbound"));
        }
        let Some(queue) = inner.queues.get_mut(&self.queue) else {
            return Err(SessionClosedError::new("queue no longer exists"));
        };
        let Some(message) = queue.ready.pop_front() else {
            return Ok(None);
        };

        let tag = queue.next_tag;
        queue.next_tag += 1;
        queue
            .in_flight
            .insert(tag, (self.consumer_id, message.clone()));

        Ok(Some(RawMessage {
            body: message.body,
            content_type: message.content_type,
            topic: message.topic,
            received_at: Timestamp::now(),
            delivery_tag: DeliveryTag::new(tag),
            properties: message.properties,
            redelivered: message.redelivered,
        }))
    }
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    async fn receive(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<RawMessage>, SessionClosedError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a publish between the
            // check and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_take()? {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn acknowledge(&mut self, tag: DeliveryTag) -> Result<(), SessionClosedError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(SessionClosedError::new("connection dropped by broker"));
        }
        let mut inner = lock(&self.shared);
        let Some(queue) = inner.queues.get_mut(&self.queue) else {
            return Err(SessionClosedError::new("queue no longer exists"));
        };
        match queue.in_flight.get(&tag.as_u64()) {
            Some((owner, _)) if *owner == self.consumer_id => {
                queue.in_flight.remove(&tag.as_u64());
            }
            _ => warn!(queue = %self.queue, %tag, "Acknowledgement for unknown delivery ignored"),
        }
        Ok(())
    }

    async fn release(&mut self, tag: DeliveryTag) -> Result<(), SessionClosedError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(SessionClosedError::new("connection dropped by broker"));
        }
        let mut inner = lock(&self.shared);
        let Some(queue) = inner.queues.get_mut(&self.queue) else {
            return Err(SessionClosedError::new("queue no longer exists"));
        };
        match queue.in_flight.remove(&tag.as_u64()) {
            Some((owner, mut message)) if owner == self.consumer_id => {
                message.redelivered = true;
                queue.ready.push_front(message);
                queue.notify.notify_waiters();
            }
            Some(entry) => {
                queue.in_flight.insert(tag.as_u64(), entry);
                warn!(queue = %self.queue, %tag, "Release for another consumer's delivery ignored");
            }
            None => warn!(queue = %self.queue, %tag, "Release for unknown delivery ignored"),
        }
        Ok(())
    }

    async fn unbind(&mut self) -> Result<(), SessionClosedError> {
        lock(&self.shared).release_consumer(self.consumer_id);
        Ok(())
    }
}
