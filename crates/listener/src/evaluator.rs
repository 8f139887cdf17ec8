//! One trigger instance: session, subscription and batch accumulator.

use std::sync::Mutex as StdMutex;

use bridge::{
    AccumulatorState, BatchAccumulator, DeliveryTag, EvaluationError, OfferOutcome,
    SubscriptionSpec, TriggerConfig, TriggerContext,
};
use session::{BrokerSession, CloseOutcome, QueueSubscription, SessionFactory};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Cumulative counters over the lifetime of one evaluator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluatorStats {
    /// Evaluation cycles started, including failed and cancelled ones.
    pub cycles: u64,
    /// Cycles that produced a trigger context.
    pub batches: u64,
    /// Well-formed messages delivered in emitted batches.
    pub messages: u64,
    /// Messages skipped because they could not be decoded.
    pub decode_failures: u64,
}

struct EvaluatorState {
    session: Option<BrokerSession>,
    subscription: Option<QueueSubscription>,
    accumulator: BatchAccumulator,
}

/// Evaluates one polling trigger.
///
/// Each call to [`Self::evaluate`] runs one cycle: it opens (or reuses) the
/// broker session, makes sure the queue subscription exists, collects
/// messages until the batch is flush-ready or the cycle deadline passes,
/// acknowledges what was received and returns a [`TriggerContext`] when at
/// least one well-formed message arrived.
///
/// Concurrent calls on the same instance run one after the other.
pub struct TriggerEvaluator {
    config: TriggerConfig,
    factory: SessionFactory,
    state: Mutex<EvaluatorState>,
    stats: StdMutex<EvaluatorStats>,
}

impl TriggerEvaluator {
    pub fn new(config: TriggerConfig, factory: SessionFactory) -> Self {
        let accumulator = BatchAccumulator::new(config.batch);
        Self {
            config,
            factory,
            state: Mutex::new(EvaluatorState {
                session: None,
                subscription: None,
                accumulator,
            }),
            stats: StdMutex::default(),
        }
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    pub fn stats(&self) -> EvaluatorStats {
        *self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs one evaluation cycle.
    ///
    /// Returns `Ok(None)` when no well-formed message arrived before the
    /// cycle ended. On any error the partial batch is discarded without
    /// acknowledgement, so the broker redelivers it. The subscription is
    /// kept for the next cycle unless the session itself was lost.
    #[instrument(
        skip(self, cancel),
        fields(flow_id = %self.config.flow_id, trigger_id = %self.config.trigger_id)
    )]
    pub async fn evaluate(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<TriggerContext>, EvaluationError> {
        let mut state = self.state.lock().await;
        self.record(|stats| stats.cycles += 1);

        let result = self.run_cycle(&mut state, cancel).await;

        if let Err(err) = &result {
            let received = state.accumulator.reset();
            let dropped = received.len();
            match err {
                EvaluationError::SessionClosed(_) => {
                    // The broker requeues everything the lost session held.
                    warn!(error = %err, dropped, "Broker session lost; rebuilding next cycle");
                    Self::discard_session(&mut state).await;
                }
                EvaluationError::Cancelled => {
                    info!(dropped, "Evaluation cancelled; partial batch returned to the queue");
                    Self::release_all(&mut state, received).await;
                }
                _ => {
                    warn!(error = %err, dropped, "Evaluation failed");
                    Self::release_all(&mut state, received).await;
                }
            }
        }
        result
    }

    /// Releases the subscription and closes the session.
    ///
    /// Returns `None` when no session was open. The evaluator can be used
    /// again afterwards; the next cycle opens a fresh session.
    #[instrument(skip(self), fields(trigger_id = %self.config.trigger_id))]
    pub async fn shutdown(&self) -> Option<CloseOutcome> {
        let mut state = self.state.lock().await;
        let received = state.accumulator.reset();
        if !received.is_empty() {
            debug!(dropped = received.len(), "Discarded partial batch on shutdown");
        }
        Self::discard_session(&mut state).await
    }

    async fn run_cycle(
        &self,
        state: &mut EvaluatorState,
        cancel: &CancellationToken,
    ) -> Result<Option<TriggerContext>, EvaluationError> {
        if cancel.is_cancelled() {
            return Err(EvaluationError::Cancelled);
        }
        self.ensure_subscription(state).await?;

        let EvaluatorState {
            subscription,
            accumulator,
            ..
        } = state;
        let Some(subscription) = subscription.as_mut() else {
            return Ok(None);
        };

        let cycle_deadline = Instant::now() + self.config.evaluation_timeout;
        accumulator.begin_cycle(cycle_deadline.into_std());

        loop {
            let now = Instant::now();
            if accumulator.poll(now.into_std()) == AccumulatorState::FlushReady {
                break;
            }
            let wait_until = accumulator
                .next_deadline()
                .map(Instant::from_std)
                .unwrap_or(cycle_deadline);
            let wait = wait_until.saturating_duration_since(now);

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EvaluationError::Cancelled),
                received = subscription.receive(wait) => received?,
            };

            let Some(message) = received else {
                continue;
            };
            let tag = message.delivery_tag;
            match accumulator.offer(message, Instant::now().into_std()) {
                OfferOutcome::Accepted => {}
                OfferOutcome::Malformed(err) => {
                    warn!(error = %err, %tag, "Malformed message skipped");
                }
                OfferOutcome::Refused => {
                    debug!(%tag, "Batch already flush-ready; returning message to the queue");
                    subscription.release(tag).await?;
                    break;
                }
            }
        }

        // A batch whose acknowledgement fails part way is still returned; the
        // unacknowledged remainder comes back as redeliveries. The lost session
        // is noticed and rebuilt at the start of the next cycle.
        let tags = accumulator.pending_acknowledgements().to_vec();
        for tag in tags {
            if let Err(err) = subscription.acknowledge(tag).await {
                warn!(error = %err, %tag, "Acknowledgement failed; remaining messages will be redelivered");
                break;
            }
        }

        let Some(finalized) = accumulator.finalize() else {
            return Ok(None);
        };

        self.record(|stats| stats.decode_failures += finalized.decode_failures as u64);
        debug!(reason = ?finalized.reason, decode_failures = finalized.decode_failures, "Batch finalized");

        let Some(batch) = finalized.batch else {
            debug!("No messages this cycle");
            return Ok(None);
        };
        let count = batch.count();
        let context = TriggerContext::from_batch(
            self.config.flow_id.clone(),
            self.config.trigger_id.clone(),
            batch,
        );
        if context.is_some() {
            self.record(|stats| {
                stats.batches += 1;
                stats.messages += count as u64;
            });
            info!(messages_count = count, "Batch ready for execution");
        }
        Ok(context)
    }

    async fn ensure_subscription(&self, state: &mut EvaluatorState) -> Result<(), EvaluationError> {
        if state.session.as_ref().is_some_and(|session| !session.is_open()) {
            debug!("Session no longer open; reconnecting");
            Self::discard_session(state).await;
        }

        if state.session.is_none() {
            state.session = Some(self.factory.open(&self.config.connection).await?);
        }
        let Some(session) = state.session.as_ref() else {
            return Ok(());
        };

        if state.subscription.is_none() {
            let spec = SubscriptionSpec {
                queue: self.config.queue.clone(),
                topics: self.config.topics.clone(),
                kind: self.config.queue_kind,
                auto_create: self.config.auto_create_queue,
            };
            state.subscription = Some(QueueSubscription::subscribe(session, spec).await?);
        }
        Ok(())
    }

    /// Returns discarded deliveries to the queue. A failure here is harmless:
    /// the broker requeues them anyway once the consumer goes away.
    ///
    /// Each release goes to the head of the queue, so the newest delivery is
    /// released first to keep receive order.
    async fn release_all(state: &mut EvaluatorState, tags: Vec<DeliveryTag>) {
        let Some(subscription) = state.subscription.as_mut() else {
            return;
        };
        for tag in tags.into_iter().rev() {
            if let Err(err) = subscription.release(tag).await {
                debug!(error = %err, %tag, "Release failed");
                return;
            }
        }
    }

    async fn discard_session(state: &mut EvaluatorState) -> Option<CloseOutcome> {
        if let Some(mut subscription) = state.subscription.take() {
            if let Err(err) = subscription.unsubscribe().await {
                debug!(error = %err, "Unsubscribe during teardown failed");
            }
        }
        let mut session = state.session.take()?;
        let outcome = session.close().await;
        debug!(?outcome, session_id = %session.id(), "Session discarded");
        Some(outcome)
    }

    fn record(&self, update: impl FnOnce(&mut EvaluatorStats)) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut stats);
    }
}

impl std::fmt::Debug for TriggerEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerEvaluator")
            .field("flow_id", &self.config.flow_id)
            .field("trigger_id", &self.config.trigger_id)
            .field("stats", &self.stats())
            .finish()
    }
}
