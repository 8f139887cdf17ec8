//! Core domain for the topic bridge.
//!
//! This crate contains every domain concept shared by the trigger and the
//! producer: identifiers, payload and batch types, configuration, the error
//! taxonomy, the broker port traits, the message codec and the batching state
//! machine. Infrastructure crates implement the ports; they never add domain
//! rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`QueueName`, `FlowId`, `DeliveryTag`, etc.) |
//! | [`topic`] | Topic names and wildcard subscription filters |
//! | [`types`] | Value types (`Payload`, `RawMessage`, `Batch`, `TriggerContext`, etc.) |
//! | [`config`] | Validated connection, trigger and producer configuration |
//! | [`errors`] | Typed errors and retry policy |
//! | [`ports`] | Broker and engine port traits |
//! | [`codec`] | `MessageCodec` |
//! | [`accumulator`] | `BatchAccumulator` state machine |

pub mod accumulator;
pub mod codec;
pub mod config;
pub mod errors;
pub mod identifiers;
pub mod ports;
pub mod topic;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use accumulator::{AccumulatorState, BatchAccumulator, FinalizedCycle, FlushReason, OfferOutcome};
pub use codec::{MessageCodec, TEXT_PAYLOAD_KEY};
pub use config::{
    BatchPolicy, ConnectionConfig, Credentials, ProducerConfig, TlsSettings, TriggerConfig,
    DEFAULT_ACK_TIMEOUT,
};
pub use errors::{
    ConfigError, ConnectionError, EmitError, EvaluationError, MalformedPayloadError,
    ProduceError, PublishError, RetryPolicy, SessionClosedError, SubscriptionError,
};
pub use identifiers::{
    ClientName, DeliveryTag, ExecutionId, FlowId, QueueName, SessionId, TriggerId,
};
pub use ports::{BrokerClient, BrokerConnection, ExecutionSink, QueueConsumer, SubscriptionSpec};
pub use topic::{TopicFilter, TopicName};
pub use types::{
    Batch, BatchSummary, ContentType, DeliveryMode, MessageBody, Payload, PublishReport,
    QueueKind, RawMessage, Timestamp, TriggerContext, COMPLETED_AT_VAR, MESSAGES_COUNT_VAR,
    MESSAGES_VAR, STARTED_AT_VAR,
};
