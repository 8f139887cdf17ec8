//! The trigger's batching state machine.
//!
//! ```text
//!            offer (decoded)             threshold / deadline / request
//!   Empty ─────────────────▶ Collecting ─────────────────────────────▶ FlushReady
//!     │  ▲                     │  ▲ offer (decoded)                       │
//!     │  │                     └──┘                                       │ finalize
//!     │  └──────────── begin_cycle / offer ◀──────── Finalized ◀──────────┘
//!     └─────────────── deadline / request ──────────────────────────────▶ FlushReady
//! ```
//!
//! The accumulator never talks to the broker. It decides *when* a batch is
//! complete and which delivery tags may be acknowledged; the evaluator
//! performs the acknowledgements before calling [`BatchAccumulator::finalize`].
//! Time is passed in by the caller so the machine stays deterministic.

use std::time::Instant;

use tracing::debug;

use crate::{
    Batch, BatchPolicy, DeliveryTag, MalformedPayloadError, MessageCodec, Payload, RawMessage,
    Timestamp,
};

/// Lifecycle state of the accumulator within one evaluation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    /// No well-formed message has been collected this cycle.
    Empty,
    /// At least one message collected; no flush condition met yet.
    Collecting,
    /// A flush condition was met; no further messages are accepted.
    FlushReady,
    /// The batch was read out. The next cycle starts from `Empty`.
    Finalized,
}

/// Why the accumulator became flush-ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// `max_messages` well-formed messages were collected.
    CountReached,
    /// `max_duration` elapsed since the first message of the batch.
    WindowElapsed,
    /// The evaluation-cycle deadline passed.
    CycleDeadline,
    /// The caller asked for a flush.
    Requested,
}

/// What happened to a message handed to [`BatchAccumulator::offer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferOutcome {
    /// The message was decoded and appended to the batch.
    Accepted,
    /// The message could not be decoded. It is skipped but still acknowledged
    /// with the batch.
    Malformed(MalformedPayloadError),
    /// The batch is already flush-ready. The message was not taken and must
    /// not be acknowledged; the broker will redeliver it.
    Refused,
}

/// Result of reading out a flush-ready accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedCycle {
    /// The batch, or `None` when no well-formed message arrived this cycle.
    pub batch: Option<Batch>,
    /// Messages skipped because they could not be decoded.
    pub decode_failures: usize,
    pub reason: FlushReason,
}

/// Collects decoded messages until a flush condition is met.
#[derive(Debug)]
pub struct BatchAccumulator {
    policy: BatchPolicy,
    codec: MessageCodec,
    state: AccumulatorState,
    payloads: Vec<Payload>,
    pending_acks: Vec<DeliveryTag>,
    decode_failures: usize,
    first_received_at: Option<Timestamp>,
    last_received_at: Option<Timestamp>,
    window_started: Option<Instant>,
    cycle_deadline: Option<Instant>,
    flush_reason: Option<FlushReason>,
}

impl BatchAccumulator {
    pub fn new(policy: BatchPolicy) -> Self {
        Self::with_codec(policy, MessageCodec::new())
    }

    pub fn with_codec(policy: BatchPolicy, codec: MessageCodec) -> Self {
        Self {
            policy,
            codec,
            state: AccumulatorState::Empty,
            payloads: Vec::new(),
            pending_acks: Vec::new(),
            decode_failures: 0,
            first_received_at: None,
            last_received_at: None,
            window_started: None,
            cycle_deadline: None,
            flush_reason: None,
        }
    }

    pub fn state(&self) -> AccumulatorState {
        self.state
    }

    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    /// Number of well-formed messages collected in the current cycle.
    pub fn count(&self) -> usize {
        self.payloads.len()
    }

    /// Messages skipped as malformed in the current cycle.
    pub fn decode_failures(&self) -> usize {
        self.decode_failures
    }

    pub fn flush_reason(&self) -> Option<FlushReason> {
        self.flush_reason
    }

    /// Starts a new evaluation cycle ending at `deadline`.
    ///
    /// A batch still collecting from an earlier, interrupted cycle is kept;
    /// callers that must discard it use [`Self::reset`] first.
    pub fn begin_cycle(&mut self, deadline: Instant) {
        if self.state == AccumulatorState::Finalized {
            self.state = AccumulatorState::Empty;
        }
        self.cycle_deadline = Some(deadline);
    }

    /// Decodes and collects one received message.
    pub fn offer(&mut self, message: RawMessage, now: Instant) -> OfferOutcome {
        match self.state {
            AccumulatorState::FlushReady => return OfferOutcome::Refused,
            AccumulatorState::Finalized => self.state = AccumulatorState::Empty,
            AccumulatorState::Empty | AccumulatorState::Collecting => {}
        }

        self.pending_acks.push(message.delivery_tag);

        let payload = match self.codec.decode(&message) {
            Ok(payload) => payload,
            Err(err) => {
                self.decode_failures += 1;
                debug!(
                    delivery_tag = %message.delivery_tag,
                    topic = %message.topic,
                    error = %err,
                    "Skipping malformed message"
                );
                return OfferOutcome::Malformed(err);
            }
        };

        if self.state == AccumulatorState::Empty {
            self.state = AccumulatorState::Collecting;
            self.window_started = Some(now);
            self.first_received_at = Some(message.received_at);
        }
        self.last_received_at = Some(message.received_at);
        self.payloads.push(payload);

        if self
            .policy
            .max_messages()
            .is_some_and(|max| self.payloads.len() >= max)
        {
            self.mark_flush_ready(FlushReason::CountReached);
        } else {
            self.poll(now);
        }
        OfferOutcome::Accepted
    }

    /// Applies the time-based flush conditions and returns the resulting state.
    pub fn poll(&mut self, now: Instant) -> AccumulatorState {
        if matches!(
            self.state,
            AccumulatorState::Empty | AccumulatorState::Collecting
        ) {
            if self.window_deadline().is_some_and(|end| now >= end) {
                self.mark_flush_ready(FlushReason::WindowElapsed);
            } else if self.cycle_deadline.is_some_and(|end| now >= end) {
                self.mark_flush_ready(FlushReason::CycleDeadline);
            }
        }
        self.state
    }

    /// The next instant at which a time-based flush condition fires.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.window_deadline(), self.cycle_deadline) {
            (Some(window), Some(cycle)) => Some(window.min(cycle)),
            (window, cycle) => window.or(cycle),
        }
    }

    /// Forces a flush of whatever has been collected.
    pub fn request_flush(&mut self) {
        if matches!(
            self.state,
            AccumulatorState::Empty | AccumulatorState::Collecting
        ) {
            self.mark_flush_ready(FlushReason::Requested);
        }
    }

    /// Delivery tags that may be acknowledged once the batch is flush-ready.
    ///
    /// Empty in any other state: nothing is acknowledged before the batch is
    /// about to be finalized.
    pub fn pending_acknowledgements(&self) -> &[DeliveryTag] {
        if self.state == AccumulatorState::FlushReady {
            &self.pending_acks
        } else {
            &[]
        }
    }

    /// Reads out a flush-ready batch and moves to `Finalized`.
    ///
    /// Returns `None` (and changes nothing) in any other state.
    pub fn finalize(&mut self) -> Option<FinalizedCycle> {
        if self.state != AccumulatorState::FlushReady {
            return None;
        }
        let reason = self.flush_reason.unwrap_or(FlushReason::Requested);
        let decode_failures = self.decode_failures;
        let payloads = std::mem::take(&mut self.payloads);

        let batch = match (self.first_received_at, self.last_received_at) {
            (Some(first), Some(last)) if !payloads.is_empty() => {
                Some(Batch::new(payloads, first, last))
            }
            _ => None,
        };

        self.clear();
        self.state = AccumulatorState::Finalized;

        Some(FinalizedCycle {
            batch,
            decode_failures,
            reason,
        })
    }

    /// Discards a partially collected batch without acknowledging anything.
    ///
    /// Returns the delivery tags of every message received since the batch
    /// started. Callers release them so the broker redelivers.
    pub fn reset(&mut self) -> Vec<DeliveryTag> {
        let received = std::mem::take(&mut self.pending_acks);
        self.clear();
        self.state = AccumulatorState::Empty;
        received
    }

    fn clear(&mut self) {
        self.payloads.clear();
        self.pending_acks.clear();
        self.decode_failures = 0;
        self.first_received_at = None;
        self.last_received_at = None;
        self.window_started = None;
        self.cycle_deadline = None;
        self.flush_reason = None;
    }

    fn window_deadline(&self) -> Option<Instant> {
        match (self.window_started, self.policy.max_duration()) {
            (Some(started), Some(window)) => Some(started + window),
            _ => None,
        }
    }

    fn mark_flush_ready(&mut self, reason: FlushReason) {
        debug!(
            ?reason,
            count = self.payloads.len(),
            decode_failures = self.decode_failures,
            "Batch flush-ready"
        );
        self.state = AccumulatorState::FlushReady;
        self.flush_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::TopicName;
    use serde_json::json;

    fn message(tag: u64, body: &str) -> RawMessage {
        RawMessage {
            body: body.as_bytes().to_vec(),
            content_type: Some("application/json".to_string()),
            topic: TopicName::parse("topic").unwrap(),
            received_at: Timestamp::now(),
            delivery_tag: DeliveryTag::new(tag),
            properties: BTreeMap::new(),
            redelivered: false,
        }
    }

    fn value(n: u64) -> String {
        format!(r#"{{"payload":"value{n}"}}"#)
    }

    fn count_policy(max: usize) -> BatchPolicy {
        BatchPolicy::default().with_max_messages(max).unwrap()
    }

    #[test]
    fn first_message_moves_empty_to_collecting() {
        let now = Instant::now();
        let mut acc = BatchAccumulator::new(count_policy(10));
        acc.begin_cycle(now + Duration::from_secs(5));
        assert_eq!(acc.state(), AccumulatorState::Empty);

        assert_eq!(acc.offer(message(1, &value(1)), now), OfferOutcome::Accepted);
        assert_eq!(acc.state(), AccumulatorState::Collecting);
        assert_eq!(acc.count(), 1);
    }

    #[test]
    fn count_threshold_makes_batch_flush_ready_and_refuses_more() {
        let now = Instant::now();
        let mut acc = BatchAccumulator::new(count_policy(2));
        acc.begin_cycle(now + Duration::from_secs(5));

        acc.offer(message(1, &value(1)), now);
        acc.offer(message(2, &value(2)), now);
        assert_eq!(acc.state(), AccumulatorState::FlushReady);
        assert_eq!(acc.flush_reason(), Some(FlushReason::CountReached));

        assert_eq!(acc.offer(message(3, &value(3)), now), OfferOutcome::Refused);
        assert_eq!(
            acc.pending_acknowledgements(),
            &[DeliveryTag::new(1), DeliveryTag::new(2)]
        );
    }

    #[test]
    fn finalize_preserves_receive_order_and_resets_count() {
        let now = Instant::now();
        let mut acc = BatchAccumulator::new(count_policy(3));
        acc.begin_cycle(now + Duration::from_secs(5));
        for n in [3, 1, 2] {
            acc.offer(message(n, &value(n)), now);
        }

        let cycle = acc.finalize().unwrap();
        let batch = cycle.batch.unwrap();
        assert_eq!(batch.count(), 3);
        let order: Vec<_> = batch
            .payloads()
            .iter()
            .map(|p| p.get("payload").cloned().unwrap())
            .collect();
        assert_eq!(order, [json!("value3"), json!("value1"), json!("value2")]);

        assert_eq!(acc.state(), AccumulatorState::Finalized);
        assert_eq!(acc.count(), 0);
        assert!(acc.pending_acknowledgements().is_empty());

        acc.begin_cycle(now + Duration::from_secs(10));
        assert_eq!(acc.state(), AccumulatorState::Empty);
    }

    #[test]
    fn count_is_monotonic_while_collecting() {
        let now = Instant::now();
        let mut acc = BatchAccumulator::new(BatchPolicy::default());
        acc.begin_cycle(now + Duration::from_secs(5));
        let mut previous = acc.count();
        for n in 1..=5 {
            acc.offer(message(n, &value(n)), now);
            assert!(acc.count() >= previous);
            previous = acc.count();
        }
        assert_eq!(previous, 5);
    }

    #[test]
    fn empty_cycle_at_deadline_yields_no_batch() {
        let start = Instant::now();
        let deadline = start + Duration::from_millis(100);
        let mut acc = BatchAccumulator::new(count_policy(10));
        acc.begin_cycle(deadline);

        assert_eq!(acc.poll(start), AccumulatorState::Empty);
        assert_eq!(acc.poll(deadline), AccumulatorState::FlushReady);

        let cycle = acc.finalize().unwrap();
        assert_eq!(cycle.reason, FlushReason::CycleDeadline);
        assert!(cycle.batch.is_none());
    }

    #[test]
    fn time_window_starts_at_first_message() {
        let start = Instant::now();
        let policy = BatchPolicy::default()
            .with_max_duration(Duration::from_millis(200))
            .unwrap();
        let mut acc = BatchAccumulator::new(policy);
        acc.begin_cycle(start + Duration::from_secs(5));
        assert_eq!(acc.next_deadline(), Some(start + Duration::from_secs(5)));

        let first = start + Duration::from_millis(50);
        acc.offer(message(1, &value(1)), first);
        assert_eq!(acc.next_deadline(), Some(first + Duration::from_millis(200)));

        assert_eq!(
            acc.poll(first + Duration::from_millis(199)),
            AccumulatorState::Collecting
        );
        assert_eq!(
            acc.poll(first + Duration::from_millis(200)),
            AccumulatorState::FlushReady
        );
        assert_eq!(acc.flush_reason(), Some(FlushReason::WindowElapsed));
    }

    #[test]
    fn malformed_message_is_skipped_counted_and_acknowledged() {
        let now = Instant::now();
        let mut acc = BatchAccumulator::new(BatchPolicy::default());
        acc.begin_cycle(now + Duration::from_secs(5));

        acc.offer(message(1, &value(1)), now);
        assert!(matches!(
            acc.offer(message(2, "{not json"), now),
            OfferOutcome::Malformed(MalformedPayloadError::InvalidJson { .. })
        ));
        acc.offer(message(3, &value(3)), now);

        acc.request_flush();
        assert_eq!(acc.pending_acknowledgements().len(), 3);
        let cycle = acc.finalize().unwrap();
        assert_eq!(cycle.batch.unwrap().count(), 2);
        assert_eq!(cycle.decode_failures, 1);
        assert_eq!(cycle.reason, FlushReason::Requested);
    }

    #[test]
    fn malformed_first_message_keeps_accumulator_empty() {
        let now = Instant::now();
        let mut acc = BatchAccumulator::new(BatchPolicy::default());
        acc.begin_cycle(now + Duration::from_secs(5));
        acc.offer(message(1, ""), now);
        assert_eq!(acc.state(), AccumulatorState::Empty);
        assert_eq!(acc.decode_failures(), 1);
    }

    #[test]
    fn reset_discards_partial_batch_without_acknowledging() {
        let now = Instant::now();
        let mut acc = BatchAccumulator::new(BatchPolicy::default());
        acc.begin_cycle(now + Duration::from_secs(5));
        acc.offer(message(1, &value(1)), now);
        acc.offer(message(2, &value(2)), now);

        assert_eq!(acc.reset().len(), 2);
        assert_eq!(acc.state(), AccumulatorState::Empty);
        assert_eq!(acc.count(), 0);
        assert!(acc.finalize().is_none());
    }

    #[test]
    fn finalize_before_flush_ready_changes_nothing() {
        let now = Instant::now();
        let mut acc = BatchAccumulator::new(BatchPolicy::default());
        acc.begin_cycle(now + Duration::from_secs(5));
        acc.offer(message(1, &value(1)), now);
        assert!(acc.finalize().is_none());
        assert_eq!(acc.state(), AccumulatorState::Collecting);
        assert_eq!(acc.count(), 1);
    }
}
