//! Shared value types for the topic bridge.
//!
//! Unlike the identifiers in [`crate::identifiers`], these types carry values
//! with invariants (a [`Batch`] count always equals its payload length, a
//! [`Payload`] is always a key/value mapping) and flow between the broker
//! ports, the accumulator and the orchestration engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::{DeliveryTag, ExecutionId, FlowId, MalformedPayloadError, TopicName, TriggerId};

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// The engine's generic message representation: an insertion-ordered mapping
/// of string keys to JSON values.
///
/// Immutable once built; use [`Payload::with`] or [`FromIterator`] to
/// construct one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(JsonMap<String, JsonValue>);

impl Payload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns this payload extended with one more entry.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &JsonMap<String, JsonValue> {
        &self.0
    }

    /// Converts the payload into a JSON object value.
    pub fn into_value(self) -> JsonValue {
        JsonValue::Object(self.0)
    }
}

impl From<JsonMap<String, JsonValue>> for Payload {
    fn from(map: JsonMap<String, JsonValue>) -> Self {
        Self(map)
    }
}

impl TryFrom<JsonValue> for Payload {
    type Error = MalformedPayloadError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        match value {
            JsonValue::Object(map) => Ok(Self(map)),
            other => Err(MalformedPayloadError::NotAnObject {
                found: json_type_name(&other),
            }),
        }
    }
}

impl<K: Into<String>, V: Into<JsonValue>> FromIterator<(K, V)> for Payload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

pub(crate) fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Broker messages
// ---------------------------------------------------------------------------

/// Content type of a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// `application/json`; the body is a JSON object.
    Json,
    /// `text/plain`; the body is UTF-8 text exposed under the `payload` key.
    Text,
}

impl ContentType {
    /// Returns the MIME string carried in message metadata.
    pub fn mime(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Text => "text/plain",
        }
    }

    /// Parses a MIME string, ignoring parameters such as `; charset=utf-8`.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        if essence.eq_ignore_ascii_case("application/json") {
            Some(Self::Json)
        } else if essence.eq_ignore_ascii_case("text/plain") {
            Some(Self::Text)
        } else {
            None
        }
    }
}

/// An encoded message body ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBody {
    /// Serialised bytes.
    pub bytes: Vec<u8>,
    /// MIME content type of `bytes`.
    pub content_type: String,
    /// User properties attached to the message.
    pub properties: BTreeMap<String, String>,
}

/// A message as delivered by the broker, before decoding.
///
/// Lives from receive until it is acknowledged or its batch is discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Opaque body bytes.
    pub body: Vec<u8>,
    /// MIME content type declared by the publisher, if any.
    pub content_type: Option<String>,
    /// Topic the message was published to.
    pub topic: TopicName,
    /// When the consumer received the message.
    pub received_at: Timestamp,
    /// Tag used to acknowledge this delivery.
    pub delivery_tag: DeliveryTag,
    /// User properties attached by the publisher.
    pub properties: BTreeMap<String, String>,
    /// `true` if the broker delivered this message before without an ack.
    pub redelivered: bool,
}

/// How the broker treats a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Fire-and-forget; no broker acknowledgement is awaited.
    Direct,
    /// Spooled by the broker; the publish completes when the broker acknowledges.
    #[default]
    Persistent,
}

/// Durability and access type of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Survives consumer disconnects; at most one active consumer.
    #[default]
    DurableExclusive,
    /// Survives consumer disconnects; consumers share deliveries.
    DurableNonExclusive,
    /// Temporary queue removed when its consumer unbinds.
    NonDurableExclusive,
}

impl QueueKind {
    pub fn is_durable(self) -> bool {
        !matches!(self, Self::NonDurableExclusive)
    }

    pub fn is_exclusive(self) -> bool {
        !matches!(self, Self::DurableNonExclusive)
    }
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// Summary metadata of a finalized [`Batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    /// Number of payloads in the batch.
    pub count: usize,
    /// Arrival time of the first message.
    pub started_at: Timestamp,
    /// Arrival time of the last message.
    pub completed_at: Timestamp,
}

/// A finalized, immutable group of payloads collected within one cycle.
///
/// Only the accumulator can build one, which keeps `summary.count` equal to
/// the number of payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    payloads: Vec<Payload>,
    summary: BatchSummary,
}

impl Batch {
    pub(crate) fn new(payloads: Vec<Payload>, started_at: Timestamp, completed_at: Timestamp) -> Self {
        let summary = BatchSummary {
            count: payloads.len(),
            started_at,
            completed_at,
        };
        Self { payloads, summary }
    }

    /// Payloads in receive order.
    pub fn payloads(&self) -> &[Payload] {
        &self.payloads
    }

    pub fn summary(&self) -> BatchSummary {
        self.summary
    }

    pub fn count(&self) -> usize {
        self.summary.count
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Engine-facing records
// ---------------------------------------------------------------------------

/// Variable key holding the number of messages in the batch.
pub const MESSAGES_COUNT_VAR: &str = "messagesCount";
/// Variable key holding the decoded payload list.
pub const MESSAGES_VAR: &str = "messages";
/// Variable key holding the arrival time of the first message.
pub const STARTED_AT_VAR: &str = "startedAt";
/// Variable key holding the arrival time of the last message.
pub const COMPLETED_AT_VAR: &str = "completedAt";

/// The data handed to the orchestration engine to materialise one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerContext {
    pub execution_id: ExecutionId,
    pub flow_id: FlowId,
    pub trigger_id: TriggerId,
    /// Trigger variables; always contains [`MESSAGES_COUNT_VAR`].
    pub variables: JsonMap<String, JsonValue>,
}

impl TriggerContext {
    /// Builds the context for a non-empty batch. Returns `None` for an empty one.
    pub fn from_batch(flow_id: FlowId, trigger_id: TriggerId, batch: Batch) -> Option<Self> {
        if batch.is_empty() {
            return None;
        }
        let summary = batch.summary();

        let mut variables = JsonMap::new();
        variables.insert(MESSAGES_COUNT_VAR.to_string(), summary.count.into());
        variables.insert(
            MESSAGES_VAR.to_string(),
            JsonValue::Array(batch.payloads.into_iter().map(Payload::into_value).collect()),
        );
        variables.insert(
            STARTED_AT_VAR.to_string(),
            summary.started_at.to_string().into(),
        );
        variables.insert(
            COMPLETED_AT_VAR.to_string(),
            summary.completed_at.to_string().into(),
        );

        Some(Self {
            execution_id: ExecutionId::new_random(),
            flow_id,
            trigger_id,
            variables,
        })
    }

    /// Returns the `messagesCount` variable.
    pub fn messages_count(&self) -> usize {
        self.variables
            .get(MESSAGES_COUNT_VAR)
            .and_then(JsonValue::as_u64)
            .map_or(0, |count| count as usize)
    }
}

/// Outcome of a successful producer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReport {
    /// Messages published, in order.
    pub published_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: &str) -> Payload {
        Payload::new().with("payload", value)
    }

    #[test]
    fn payload_preserves_insertion_order() {
        let p = Payload::new().with("z", 1).with("a", 2).with("m", 3);
        let keys: Vec<&str> = p.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn payload_rejects_non_object_values() {
        let err = Payload::try_from(json!([1, 2])).unwrap_err();
        assert_eq!(err, MalformedPayloadError::NotAnObject { found: "array" });
    }

    #[test]
    fn content_type_ignores_parameters() {
        assert_eq!(
            ContentType::from_mime("application/json; charset=utf-8"),
            Some(ContentType::Json)
        );
        assert_eq!(ContentType::from_mime("TEXT/PLAIN"), Some(ContentType::Text));
        assert_eq!(ContentType::from_mime("application/xml"), None);
    }

    #[test]
    fn trigger_context_carries_count_and_messages() {
        let now = Timestamp::now();
        let batch = Batch::new(vec![payload("value1"), payload("value2")], now, now);
        let ctx = TriggerContext::from_batch(
            FlowId::new("trigger").unwrap(),
            TriggerId::new("watch").unwrap(),
            batch,
        )
        .unwrap();

        assert_eq!(ctx.messages_count(), 2);
        assert_eq!(
            ctx.variables[MESSAGES_VAR],
            json!([{"payload": "value1"}, {"payload": "value2"}])
        );
    }

    #[test]
    fn empty_batch_yields_no_context() {
        let now = Timestamp::now();
        let batch = Batch::new(Vec::new(), now, now);
        assert!(TriggerContext::from_batch(
            FlowId::new("trigger").unwrap(),
            TriggerId::new("watch").unwrap(),
            batch
        )
        .is_none());
    }

    #[test]
    fn queue_kind_flags() {
        assert!(QueueKind::DurableExclusive.is_durable());
        assert!(QueueKind::DurableExclusive.is_exclusive());
        assert!(!QueueKind::DurableNonExclusive.is_exclusive());
        assert!(!QueueKind::NonDurableExclusive.is_durable());
    }
}
