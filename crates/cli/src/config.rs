//! Scenario file: broker provisioning plus trigger and producer settings.
//!
//! ```json
//! {
//!   "broker": {
//!     "users": [{ "vpn": "default", "username": "admin", "secret": "admin" }],
//!     "queues": [{ "name": "test", "topics": ["topic"] }]
//!   },
//!   "trigger": { "flow_id": "trigger", "trigger_id": "solace", ... },
//!   "producer": { "topic_destination": "topic", ... },
//!   "from": [{ "payload": "value1" }, { "payload": "value2" }]
//! }
//! ```

use std::path::Path;

use anyhow::{ensure, Context, Result};
use bridge::{Payload, ProducerConfig, QueueKind, QueueName, TopicFilter, TriggerConfig};
use memory_broker::InMemoryBroker;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub vpn: String,
    pub username: String,
    /// Password or token accepted for this user.
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueEntry {
    pub name: QueueName,
    #[serde(default)]
    pub kind: QueueKind,
    pub topics: Vec<TopicFilter>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerSetup {
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub queues: Vec<QueueEntry>,
}

impl BrokerSetup {
    /// Builds an in-process broker with these users and queues.
    pub fn provision(&self) -> InMemoryBroker {
        let broker = self
            .users
            .iter()
            .fold(InMemoryBroker::new(), |broker, user| {
                broker.with_user(&user.vpn, &user.username, &user.secret)
            });
        for queue in &self.queues {
            broker.create_queue(&queue.name, queue.kind, &queue.topics);
        }
        broker
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub broker: BrokerSetup,
    pub trigger: TriggerConfig,
    pub producer: ProducerConfig,
    /// Payloads the producer publishes, in order.
    #[serde(default)]
    pub from: Vec<Payload>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid scenario file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let scenario: Self = serde_json::from_str(raw)?;
        ensure!(
            scenario
                .broker
                .users
                .iter()
                .all(|user| !user.secret.is_empty()),
            "broker users must have a non-empty secret"
        );
        Ok(scenario)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bridge::DeliveryMode;

    const SCENARIO: &str = r#"{
        "broker": {
            "users": [{ "vpn": "default", "username": "admin", "secret": "admin" }],
            "queues": [{ "name": "test", "topics": ["topic"] }]
        },
        "trigger": {
            "flow_id": "trigger",
            "trigger_id": "solace",
            "connection": {
                "host": "tcp://localhost:55555",
                "vpn": "default",
                "username": "admin",
                "credentials": { "password": "admin" }
            },
            "queue": "test",
            "topics": ["topic"],
            "batch": { "max_messages": 10 },
            "evaluation_timeout_ms": 2000
        },
        "producer": {
            "connection": {
                "host": "tcp://localhost:55555",
                "vpn": "default",
                "username": "admin",
                "credentials": { "password": "admin" }
            },
            "topic_destination": "topic",
            "delivery_mode": "direct"
        },
        "from": [{ "payload": "value1" }, { "payload": "value2" }]
    }"#;

    #[test]
    fn parses_a_full_scenario() {
        let scenario = Scenario::parse(SCENARIO).unwrap();

        assert_eq!(scenario.trigger.queue.as_str(), "test");
        assert_eq!(scenario.trigger.evaluation_timeout, Duration::from_secs(2));
        assert_eq!(scenario.trigger.batch.max_messages(), Some(10));
        assert_eq!(scenario.producer.delivery_mode, DeliveryMode::Direct);
        assert_eq!(scenario.from.len(), 2);
        assert_eq!(scenario.broker.queues[0].kind, QueueKind::DurableExclusive);
    }

    #[test]
    fn provisioned_broker_has_the_declared_queues() {
        let scenario = Scenario::parse(SCENARIO).unwrap();
        let broker = scenario.broker.provision();
        assert!(broker.queue_exists(&QueueName::new("test").unwrap()));
    }

    #[test]
    fn non_object_payloads_are_rejected() {
        let raw = SCENARIO.replace(r#"{ "payload": "value2" }"#, "42");
        assert!(Scenario::parse(&raw).is_err());
    }

    #[test]
    fn zero_evaluation_timeout_is_rejected() {
        let raw = SCENARIO.replace("\"evaluation_timeout_ms\": 2000", "\"evaluation_timeout_ms\": 0");
        assert!(Scenario::parse(&raw).is_err());
    }
}
