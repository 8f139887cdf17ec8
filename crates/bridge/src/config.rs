//! Run-context configuration for triggers and producers.
//!
//! Every recognised field is enumerated here; nothing is read dynamically.
//! All types are validated at construction, including when deserialised, so
//! an invalid value never reaches a broker call. Durations are expressed in
//! milliseconds in serialised form (`evaluation_timeout_ms`, ...).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    ClientName, ConfigError, DeliveryMode, FlowId, QueueKind, QueueName, TopicFilter, TopicName,
    TriggerId,
};

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Secret used to authenticate a session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Credentials {
    /// Basic authentication password.
    Password(String),
    /// OAuth / bearer token.
    Token(String),
}

impl Credentials {
    /// Returns the secret regardless of its kind.
    pub fn secret(&self) -> &str {
        match self {
            Self::Password(secret) | Self::Token(secret) => secret,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::Token(_) => f.write_str("Token(<redacted>)"),
        }
    }
}

/// Optional TLS settings for the broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    /// PEM trust store used to verify the broker certificate.
    #[serde(default)]
    pub trust_store: Option<PathBuf>,
    /// Whether the broker host name must match its certificate.
    #[serde(default = "default_true")]
    pub verify_hostname: bool,
}

fn default_true() -> bool {
    true
}

/// Where and as whom a session connects.
///
/// Owned exclusively by the component that opens a session from it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ConnectionConfigFields")]
pub struct ConnectionConfig {
    host: String,
    vpn: String,
    username: String,
    credentials: Credentials,
    tls: Option<TlsSettings>,
    client_name: Option<ClientName>,
}

#[derive(Deserialize)]
struct ConnectionConfigFields {
    host: String,
    vpn: String,
    username: String,
    credentials: Credentials,
    #[serde(default)]
    tls: Option<TlsSettings>,
    #[serde(default)]
    client_name: Option<ClientName>,
}

impl TryFrom<ConnectionConfigFields> for ConnectionConfig {
    type Error = ConfigError;

    fn try_from(fields: ConnectionConfigFields) -> Result<Self, Self::Error> {
        let mut config = Self::new(fields.host, fields.vpn, fields.username, fields.credentials)?;
        config.tls = fields.tls;
        config.client_name = fields.client_name;
        Ok(config)
    }
}

impl ConnectionConfig {
    /// Validates and builds a connection configuration.
    pub fn new(
        host: impl Into<String>,
        vpn: impl Into<String>,
        username: impl Into<String>,
        credentials: Credentials,
    ) -> Result<Self, ConfigError> {
        let host = required("host", host.into())?;
        let vpn = required("vpn", vpn.into())?;
        let username = required("username", username.into())?;
        if credentials.secret().is_empty() {
            return Err(ConfigError::MissingField {
                field: "credentials",
            });
        }
        Ok(Self {
            host,
            vpn,
            username,
            credentials,
            tls: None,
            client_name: None,
        })
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn with_client_name(mut self, client_name: ClientName) -> Self {
        self.client_name = Some(client_name);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn vpn(&self) -> &str {
        &self.vpn
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn tls(&self) -> Option<&TlsSettings> {
        self.tls.as_ref()
    }

    pub fn client_name(&self) -> Option<&ClientName> {
        self.client_name.as_ref()
    }
}

fn required(field: &'static str, value: String) -> Result<String, ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::MissingField { field })
    } else {
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

/// Flush thresholds for the batch accumulator.
///
/// Both thresholds are optional and independent. The evaluation-cycle
/// deadline always applies on top of them, so a policy with neither set
/// collects until the cycle times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "BatchPolicyFields", into = "BatchPolicyFields")]
pub struct BatchPolicy {
    max_messages: Option<usize>,
    max_duration: Option<Duration>,
}

#[derive(Clone, Copy, Serialize, Deserialize)]
struct BatchPolicyFields {
    #[serde(default)]
    max_messages: Option<usize>,
    #[serde(default)]
    max_duration_ms: Option<u64>,
}

impl TryFrom<BatchPolicyFields> for BatchPolicy {
    type Error = ConfigError;

    fn try_from(fields: BatchPolicyFields) -> Result<Self, Self::Error> {
        let mut policy = Self::default();
        if let Some(max) = fields.max_messages {
            policy = policy.with_max_messages(max)?;
        }
        if let Some(ms) = fields.max_duration_ms {
            policy = policy.with_max_duration(Duration::from_millis(ms))?;
        }
        Ok(policy)
    }
}

impl From<BatchPolicy> for BatchPolicyFields {
    fn from(policy: BatchPolicy) -> Self {
        Self {
            max_messages: policy.max_messages,
            max_duration_ms: policy
                .max_duration
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

impl BatchPolicy {
    /// Flush once this many well-formed messages are collected.
    pub fn with_max_messages(mut self, max: usize) -> Result<Self, ConfigError> {
        if max == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_messages",
                reason: "must be at least 1".to_string(),
            });
        }
        self.max_messages = Some(max);
        Ok(self)
    }

    /// Flush once this much time has passed since the first message of the batch.
    pub fn with_max_duration(mut self, window: Duration) -> Result<Self, ConfigError> {
        if window.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "max_duration",
                reason: "must be greater than zero".to_string(),
            });
        }
        self.max_duration = Some(window);
        Ok(self)
    }

    pub fn max_messages(&self) -> Option<usize> {
        self.max_messages
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// Everything one trigger instance needs to evaluate.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "TriggerConfigFields")]
pub struct TriggerConfig {
    pub flow_id: FlowId,
    pub trigger_id: TriggerId,
    pub connection: ConnectionConfig,
    pub queue: QueueName,
    pub topics: Vec<TopicFilter>,
    pub queue_kind: QueueKind,
    /// Create the queue on first bind when it does not exist.
    pub auto_create_queue: bool,
    pub batch: BatchPolicy,
    /// Hard deadline of one evaluation cycle.
    pub evaluation_timeout: Duration,
    /// Delay between two evaluation cycles when driven by the runner.
    pub interval: Duration,
}

#[derive(Deserialize)]
struct TriggerConfigFields {
    flow_id: FlowId,
    trigger_id: TriggerId,
    connection: ConnectionConfig,
    queue: QueueName,
    topics: Vec<TopicFilter>,
    #[serde(default)]
    queue_kind: QueueKind,
    #[serde(default)]
    auto_create_queue: bool,
    #[serde(default)]
    batch: BatchPolicy,
    evaluation_timeout_ms: u64,
    #[serde(default)]
    interval_ms: u64,
}

impl TryFrom<TriggerConfigFields> for TriggerConfig {
    type Error = ConfigError;

    fn try_from(fields: TriggerConfigFields) -> Result<Self, Self::Error> {
        let mut config = Self::new(
            fields.flow_id,
            fields.trigger_id,
            fields.connection,
            fields.queue,
            fields.topics,
            Duration::from_millis(fields.evaluation_timeout_ms),
        )?;
        config.queue_kind = fields.queue_kind;
        config.auto_create_queue = fields.auto_create_queue;
        config.batch = fields.batch;
        config.interval = Duration::from_millis(fields.interval_ms);
        Ok(config)
    }
}

impl TriggerConfig {
    /// Builds a trigger configuration with default queue kind, no auto-create,
    /// no batch thresholds and no delay between cycles.
    pub fn new(
        flow_id: FlowId,
        trigger_id: TriggerId,
        connection: ConnectionConfig,
        queue: QueueName,
        topics: Vec<TopicFilter>,
        evaluation_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if topics.is_empty() {
            return Err(ConfigError::MissingField { field: "topics" });
        }
        if evaluation_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "evaluation_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(Self {
            flow_id,
            trigger_id,
            connection,
            queue,
            topics,
            queue_kind: QueueKind::default(),
            auto_create_queue: false,
            batch: BatchPolicy::default(),
            evaluation_timeout,
            interval: Duration::ZERO,
        })
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// Default time to wait for the broker to acknowledge a persistent publish.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything one producer run needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProducerConfig {
    pub connection: ConnectionConfig,
    pub topic_destination: TopicName,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    /// User properties attached to every published message.
    #[serde(default)]
    pub message_properties: BTreeMap<String, String>,
    /// Acknowledgement timeout for persistent publishes.
    #[serde(
        rename = "ack_timeout_ms",
        deserialize_with = "duration_ms",
        default = "default_ack_timeout"
    )]
    pub ack_timeout: Duration,
}

fn default_ack_timeout() -> Duration {
    DEFAULT_ACK_TIMEOUT
}

impl ProducerConfig {
    pub fn new(connection: ConnectionConfig, topic_destination: TopicName) -> Self {
        Self {
            connection,
            topic_destination,
            delivery_mode: DeliveryMode::default(),
            message_properties: BTreeMap::new(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

fn duration_ms<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connection() -> ConnectionConfig {
        ConnectionConfig::new(
            "tcp://localhost:55555",
            "default",
            "admin",
            Credentials::Password("admin".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn connection_requires_host_and_credentials() {
        let err = ConnectionConfig::new("", "default", "admin", Credentials::Password("x".into()))
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingField { field: "host" });

        let err = ConnectionConfig::new("h", "default", "admin", Credentials::Token(String::new()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingField {
                field: "credentials"
            }
        );
    }

    #[test]
    fn credentials_are_redacted_in_debug_output() {
        let rendered = format!("{:?}", connection());
        assert!(!rendered.contains("\"admin\")"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn deserialised_connection_is_validated() {
        let err = serde_json::from_value::<ConnectionConfig>(json!({
            "host": "  ",
            "vpn": "default",
            "username": "admin",
            "credentials": { "password": "admin" }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("host"));
    }

    #[test]
    fn batch_policy_rejects_zero_thresholds() {
        assert!(BatchPolicy::default().with_max_messages(0).is_err());
        assert!(BatchPolicy::default()
            .with_max_duration(Duration::ZERO)
            .is_err());
    }

    #[test]
    fn oversized_batch_window_serialises_as_max_millis() {
        let policy = BatchPolicy::default()
            .with_max_duration(Duration::MAX)
            .unwrap();
        assert_eq!(
            serde_json::to_value(policy).unwrap(),
            json!({ "max_messages": null, "max_duration_ms": u64::MAX })
        );
    }

    #[test]
    fn trigger_config_parses_millisecond_fields() {
        let config: TriggerConfig = serde_json::from_value(json!({
            "flow_id": "trigger",
            "trigger_id": "watch",
            "connection": {
                "host": "tcp://localhost:55555",
                "vpn": "default",
                "username": "admin",
                "credentials": { "password": "admin" }
            },
            "queue": "test",
            "topics": ["topic"],
            "batch": { "max_messages": 2, "max_duration_ms": 500 },
            "evaluation_timeout_ms": 1000,
            "interval_ms": 250
        }))
        .unwrap();

        assert_eq!(config.batch.max_messages(), Some(2));
        assert_eq!(config.batch.max_duration(), Some(Duration::from_millis(500)));
        assert_eq!(config.evaluation_timeout, Duration::from_secs(1));
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.queue_kind, QueueKind::DurableExclusive);
    }

    #[test]
    fn trigger_config_requires_topics() {
        let err = TriggerConfig::new(
            FlowId::new("trigger").unwrap(),
            TriggerId::new("watch").unwrap(),
            connection(),
            QueueName::new("test").unwrap(),
            Vec::new(),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::MissingField { field: "topics" });
    }

    #[test]
    fn producer_config_defaults() {
        let config: ProducerConfig = serde_json::from_value(json!({
            "connection": {
                "host": "tcp://localhost:55555",
                "vpn": "default",
                "username": "admin",
                "credentials": { "password": "admin" }
            },
            "topic_destination": "topic"
        }))
        .unwrap();
        assert_eq!(config.delivery_mode, DeliveryMode::Persistent);
        assert_eq!(config.ack_timeout, DEFAULT_ACK_TIMEOUT);
        assert!(config.message_properties.is_empty());
    }
}
