//! Queue subscriptions bound through a [`BrokerSession`].
//!
//! [`QueueSubscription::receive`] is the only suspension point of the polling
//! path. It is wrapped in a hard timeout so a misbehaving adapter can never
//! block a cycle past the caller's deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bridge::{
    DeliveryTag, QueueConsumer, RawMessage, SessionClosedError, SessionId, SubscriptionError,
    SubscriptionSpec,
};
use tracing::{debug, info, instrument, warn};

use crate::BrokerSession;

/// A queue bound to its topic filters, with a live consumer.
pub struct QueueSubscription {
    spec: SubscriptionSpec,
    session_id: SessionId,
    consumer: Option<Box<dyn QueueConsumer>>,
    session_closed: Arc<AtomicBool>,
}

impl QueueSubscription {
    /// Binds `spec.queue` and adds its topic subscriptions.
    #[instrument(skip(session, spec), fields(session_id = %session.id(), queue = %spec.queue))]
    pub async fn subscribe(
        session: &BrokerSession,
        spec: SubscriptionSpec,
    ) -> Result<Self, SubscriptionError> {
        if spec.topics.is_empty() {
            return Err(SubscriptionError::NoTopics {
                queue: spec.queue.to_string(),
            });
        }
        if !session.is_open() {
            return Err(SessionClosedError::new("cannot subscribe on a closed session").into());
        }

        let consumer = session.connection().bind_queue(&spec).await?;

        info!(
            topics = ?spec.topics.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            kind = ?spec.kind,
            "Queue subscription bound"
        );

        Ok(Self {
            spec,
            session_id: session.id(),
            consumer: Some(consumer),
            session_closed: session.closed_flag(),
        })
    }

    pub fn spec(&self) -> &SubscriptionSpec {
        &self.spec
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// `true` while bound and the owning session has not been closed.
    pub fn is_active(&self) -> bool {
        self.consumer.is_some() && !self.session_closed.load(Ordering::Acquire)
    }

    /// Waits at most `timeout` for the next message.
    ///
    /// `Ok(None)` means the timeout elapsed with nothing to deliver.
    pub async fn receive(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<RawMessage>, SessionClosedError> {
        let consumer = self.live_consumer()?;
        match tokio::time::timeout(timeout, consumer.receive(timeout)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(?timeout, "Receive deadline reached");
                Ok(None)
            }
        }
    }

    /// Acknowledges one delivery so the broker removes it from the queue.
    pub async fn acknowledge(&mut self, tag: DeliveryTag) -> Result<(), SessionClosedError> {
        self.live_consumer()?.acknowledge(tag).await
    }

    /// Returns one delivery to the queue for redelivery.
    pub async fn release(&mut self, tag: DeliveryTag) -> Result<(), SessionClosedError> {
        self.live_consumer()?.release(tag).await
    }

    /// Releases the queue binding.
    ///
    /// A no-op when already unsubscribed or when the session has been closed,
    /// since closing the session already released the binding broker-side.
    #[instrument(skip(self), fields(queue = %self.spec.queue))]
    pub async fn unsubscribe(&mut self) -> Result<(), SessionClosedError> {
        let Some(mut consumer) = self.consumer.take() else {
            return Ok(());
        };
        if self.session_closed.load(Ordering::Acquire) {
            debug!("Session already closed; nothing to unbind");
            return Ok(());
        }
        match consumer.unbind().await {
            Ok(()) => {
                info!("Queue subscription released");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Queue unbind failed");
                Err(err)
            }
        }
    }

    fn live_consumer(&mut self) -> Result<&mut Box<dyn QueueConsumer>, SessionClosedError> {
        if self.session_closed.load(Ordering::Acquire) {
            return Err(SessionClosedError::new("session is closed"));
        }
        self.consumer
            .as_mut()
            .ok_or_else(|| SessionClosedError::new("subscription was released"))
    }
}

impl std::fmt::Debug for QueueSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSubscription")
            .field("spec", &self.spec)
            .field("session_id", &self.session_id)
            .field("active", &self.is_active())
            .finish()
    }
}
