//! Error and retry-policy types for the topic bridge.
//!
//! Each boundary operation fails with its own typed error so the scheduler
//! can tell a transient broker problem from a misconfigured trigger:
//!
//! | Error | Raised by | Default policy |
//! |-------|-----------|----------------|
//! | [`ConnectionError`] | opening a session | retry next cycle |
//! | [`SubscriptionError`] | binding a queue | do not retry |
//! | [`MalformedPayloadError`] | decoding one message | absorbed by the accumulator |
//! | [`SessionClosedError`] | receive / acknowledge | retry next cycle with a new session |
//! | [`PublishError`] | publishing one message | abort remaining publishes |
//!
//! [`RetryPolicy`] is a cross-cutting concern: every error that reaches the
//! evaluator or producer boundary can produce one.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// - `Retryable` errors: broker unreachable, authentication refused, session
///   dropped mid-receive, publish timeouts.
/// - `NonRetryable` errors: missing queue, invalid topic set, invalid
///   configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means retry on the
        /// caller's own schedule (normally the next evaluation cycle).
        after: Option<Duration>,
    },
    /// The operation must not be retried until the configuration is fixed.
    NonRetryable,
}

impl RetryPolicy {
    /// Retry on the caller's next scheduled cycle.
    pub fn next_cycle() -> Self {
        Self::Retryable { after: None }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// A configuration value failed validation at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required field was absent or blank.
    #[error("Missing required configuration field '{field}'")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// A field was present but its value is out of range or malformed.
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with the value.
        reason: String,
    },

    /// A topic name or topic filter is not well formed.
    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic {
        /// The rejected topic string.
        topic: String,
        /// What is wrong with it.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Opening an authenticated session failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The broker refused the supplied credentials.
    #[error("Authentication failed for user '{username}' on vpn '{vpn}'")]
    Authentication {
        /// Username presented to the broker.
        username: String,
        /// VPN / namespace the login targeted.
        vpn: String,
    },

    /// The broker could not be reached.
    #[error("Broker at '{host}' is unreachable: {reason}")]
    Unreachable {
        /// Host the connection targeted.
        host: String,
        /// Transport-level failure description.
        reason: String,
    },

    /// A session for the same connection descriptor is already live.
    #[error("A session is already open for {descriptor}")]
    AlreadyOpen {
        /// Display form of the conflicting descriptor.
        descriptor: String,
    },

    /// The broker accepted the transport but refused the session.
    #[error("Broker refused the session: {reason}")]
    Refused {
        /// Broker-provided reason.
        reason: String,
    },
}

impl ConnectionError {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::next_cycle()
    }
}

/// The broker closed the session while it was in use.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Broker session closed: {reason}")]
pub struct SessionClosedError {
    /// Why the session is no longer usable.
    pub reason: String,
}

impl SessionClosedError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Binding a queue to its topic filters failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// The queue does not exist and auto-create is disabled.
    #[error("Queue '{queue}' does not exist and auto-create is disabled")]
    QueueNotFound {
        /// The missing queue.
        queue: String,
    },

    /// No topic filters were supplied for the queue.
    #[error("Queue '{queue}' has no topic filters")]
    NoTopics {
        /// The queue that was being bound.
        queue: String,
    },

    /// The broker refused the binding (e.g. an exclusive queue already has a consumer).
    #[error("Broker refused binding for queue '{queue}': {reason}")]
    Refused {
        /// The queue that was being bound.
        queue: String,
        /// Broker-provided reason.
        reason: String,
    },

    /// The session was closed before or during the bind.
    #[error(transparent)]
    SessionClosed(#[from] SessionClosedError),
}

impl SubscriptionError {
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::SessionClosed(_) => RetryPolicy::next_cycle(),
            Self::QueueNotFound { .. } | Self::NoTopics { .. } | Self::Refused { .. } => {
                RetryPolicy::NonRetryable
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Payload decoding
// ---------------------------------------------------------------------------

/// A single message body could not be turned into a payload.
///
/// Recoverable: the accumulator skips the message and counts the failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedPayloadError {
    /// The message body was empty.
    #[error("Message body is empty")]
    EmptyBody,

    /// The message declared a content type the codec does not handle.
    #[error("Unsupported content type '{content_type}'")]
    UnsupportedContentType {
        /// The declared content type.
        content_type: String,
    },

    /// The body is not valid UTF-8.
    #[error("Message body is not valid UTF-8")]
    InvalidUtf8,

    /// The body is not valid JSON.
    #[error("Message body is not valid JSON: {reason}")]
    InvalidJson {
        /// Parser error description.
        reason: String,
    },

    /// The body is valid JSON but not an object.
    #[error("Message body must be a JSON object, found {found}")]
    NotAnObject {
        /// JSON type that was found instead.
        found: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// Publishing a single message failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The broker did not acknowledge a persistent publish in time.
    #[error("Broker did not acknowledge the message within {timeout:?}")]
    AcknowledgementTimeout {
        /// Configured acknowledgement timeout.
        timeout: Duration,
    },

    /// The broker rejected the message.
    #[error("Broker rejected the message: {reason}")]
    Rejected {
        /// Broker-provided reason.
        reason: String,
    },

    /// The payload could not be serialised.
    #[error("Payload could not be encoded: {reason}")]
    Encode {
        /// Serialiser error description.
        reason: String,
    },

    /// The session was closed before or during the publish.
    #[error(transparent)]
    SessionClosed(#[from] SessionClosedError),
}

/// A producer run failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProduceError {
    /// The producer's session could not be opened; nothing was published.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A publish failed; remaining payloads were not sent.
    #[error("Publish failed after {published_count} message(s): {source}")]
    Publish {
        /// Messages successfully published before the failure.
        published_count: usize,
        /// The failure that aborted the run.
        #[source]
        source: PublishError,
    },
}

impl ProduceError {
    /// Number of messages that reached the broker before the failure.
    pub fn published_count(&self) -> usize {
        match self {
            Self::Connection(_) => 0,
            Self::Publish {
                published_count, ..
            } => *published_count,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Connection(err) => err.retry_policy(),
            Self::Publish {
                source: PublishError::Encode { .. },
                ..
            } => RetryPolicy::NonRetryable,
            Self::Publish { .. } => RetryPolicy::next_cycle(),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// One trigger evaluation cycle failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    SessionClosed(#[from] SessionClosedError),

    /// The cycle was stopped by an external signal; any partial batch was discarded.
    #[error("Evaluation cancelled by stop signal")]
    Cancelled,
}

impl EvaluationError {
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Connection(err) => err.retry_policy(),
            Self::Subscription(err) => err.retry_policy(),
            Self::SessionClosed(_) | Self::Cancelled => RetryPolicy::next_cycle(),
        }
    }
}

/// Handing a trigger context to the orchestration engine failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Execution could not be emitted: {reason}")]
pub struct EmitError {
    /// Engine-side failure description.
    pub reason: String,
}
