//! Shared broker state and the [`InMemoryBroker`] handle.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bridge::{
    BrokerClient, BrokerConnection, ClientName, ConnectionConfig, ConnectionError, QueueKind,
    QueueName, SessionId, TopicFilter, TopicName,
};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::connection::MemoryConnection;

/// A message sitting in a queue.
#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub topic: TopicName,
    pub properties: BTreeMap<String, String>,
    pub redelivered: bool,
}

#[derive(Debug)]
pub(crate) struct QueueState {
    pub kind: QueueKind,
    pub subscriptions: Vec<TopicFilter>,
    pub ready: VecDeque<StoredMessage>,
    /// Delivered but not yet acknowledged, keyed by delivery tag.
    pub in_flight: BTreeMap<u64, (u64, StoredMessage)>,
    pub consumers: HashSet<u64>,
    pub next_tag: u64,
    pub notify: Arc<Notify>,
}

impl QueueState {
    pub fn new(kind: QueueKind, subscriptions: Vec<TopicFilter>) -> Self {
        Self {
            kind,
            subscriptions,
            ready: VecDeque::new(),
            in_flight: BTreeMap::new(),
            consumers: HashSet::new(),
            next_tag: 1,
            notify: Arc::new(Notify::new()),
        }
    }

    fn routes(&self, topic: &TopicName) -> bool {
        self.subscriptions.iter().any(|filter| filter.matches(topic))
    }

    /// Returns every unacknowledged delivery of `consumer` to the head of the
    /// queue, oldest first, flagged as redelivered.
    pub fn requeue_in_flight(&mut self, consumer: u64) -> usize {
        let tags: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, (owner, _))| *owner == consumer)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags.iter().rev() {
            if let Some((_, mut message)) = self.in_flight.remove(tag) {
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }
        tags.len()
    }
}

#[derive(Debug)]
pub(crate) struct Connected {
    pub flag: Arc<AtomicBool>,
    pub vpn: String,
    pub client_name: ClientName,
}

#[derive(Debug, Default)]
pub(crate) struct Inner {
    pub users: HashMap<(String, String), String>,
    pub unreachable: bool,
    pub queues: HashMap<QueueName, QueueState>,
    pub connections: HashMap<SessionId, Connected>,
    /// Consumer id → (owning session, queue).
    pub consumers: HashMap<u64, (SessionId, QueueName)>,
    pub next_consumer: u64,
    pub reject_publishes_after: Option<usize>,
    pub published: usize,
    pub persistent_ack_delay: Option<Duration>,
}

impl Inner {
    /// Removes a consumer, requeues what it held, and drops its queue if it was temporary.
    pub fn release_consumer(&mut self, consumer: u64) {
        let Some((_, queue_name)) = self.consumers.remove(&consumer) else {
            return;
        };
        let remove_queue = match self.queues.get_mut(&queue_name) {
            Some(queue) => {
                queue.consumers.remove(&consumer);
                let requeued = queue.requeue_in_flight(consumer);
                if requeued > 0 {
                    debug!(queue = %queue_name, requeued, "Requeued unacknowledged messages");
                }
                queue.notify.notify_waiters();
                !queue.kind.is_durable() && queue.consumers.is_empty()
            }
            None => false,
        };
        if remove_queue {
            self.queues.remove(&queue_name);
            debug!(queue = %queue_name, "Removed temporary queue");
        }
    }

    /// Marks a session disconnected and releases everything it held.
    pub fn drop_session(&mut self, session: SessionId) {
        if let Some(connected) = self.connections.remove(&session) {
            connected.flag.store(false, Ordering::Release);
        }
        let owned: Vec<u64> = self
            .consumers
            .iter()
            .filter(|(_, (owner, _))| *owner == session)
            .map(|(id, _)| *id)
            .collect();
        for consumer in owned {
            self.release_consumer(consumer);
        }
    }

    /// Routes one message to every queue with a matching filter. Returns the
    /// number of queues it landed in.
    pub fn route(&mut self, message: StoredMessage) -> usize {
        let mut routed = 0;
        for queue in self.queues.values_mut() {
            if queue.routes(&message.topic) {
                queue.ready.push_back(message.clone());
                queue.notify.notify_waiters();
                routed += 1;
            }
        }
        routed
    }
}

pub(crate) type Shared = Arc<Mutex<Inner>>;

pub(crate) fn lock(shared: &Shared) -> MutexGuard<'_, Inner> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An in-process broker.
///
/// Cloning yields another handle to the same broker. Hand one to a
/// `SessionFactory` as the [`BrokerClient`] and keep another to administer
/// queues and inject faults.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Shared,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user allowed to log into `vpn` with `secret` (password or token).
    #[must_use]
    pub fn with_user(
        self,
        vpn: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        lock(&self.shared)
            .users
            .insert((vpn.into(), username.into()), secret.into());
        self
    }

    /// Creates a durable queue subscribed to `topics`, or adds the topics to
    /// an existing queue.
    pub fn create_queue(&self, queue: &QueueName, kind: QueueKind, topics: &[TopicFilter]) {
        let mut inner = lock(&self.shared);
        let state = inner
            .queues
            .entry(queue.clone())
            .or_insert_with(|| QueueState::new(kind, Vec::new()));
        for topic in topics {
            if !state.subscriptions.contains(topic) {
                state.subscriptions.push(topic.clone());
            }
        }
        info!(queue = %queue, ?kind, "Queue provisioned");
    }

    /// Creates a durable exclusive queue with a single topic subscription.
    pub fn create_queue_with_subscription(&self, queue: &QueueName, topic: &TopicFilter) {
        self.create_queue(queue, QueueKind::DurableExclusive, std::slice::from_ref(topic));
    }

    /// Publishes raw bytes as if an external publisher had sent them.
    pub fn publish_raw(&self, topic: &TopicName, body: &[u8], content_type: Option<&str>) -> usize {
        lock(&self.shared).route(StoredMessage {
            body: body.to_vec(),
            content_type: content_type.map(str::to_string),
            topic: topic.clone(),
            properties: BTreeMap::new(),
            redelivered: false,
        })
    }

    /// Simulates the broker being unreachable for new connections.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.shared).unreachable = !reachable;
    }

    /// Rejects every publish once `count` messages have been accepted.
    pub fn reject_publishes_after(&self, count: Option<usize>) {
        let mut inner = lock(&self.shared);
        inner.reject_publishes_after = count;
        inner.published = 0;
    }

    /// Delays the acknowledgement of persistent publishes.
    pub fn set_persistent_ack_delay(&self, delay: Option<Duration>) {
        lock(&self.shared).persistent_ack_delay = delay;
    }

    /// Drops every live connection, as a broker restart would.
    pub fn disconnect_all(&self) {
        let mut inner = lock(&self.shared);
        let sessions: Vec<SessionId> = inner.connections.keys().copied().collect();
        for session in sessions {
            inner.drop_session(session);
        }
        info!("All broker connections dropped");
    }

    /// Messages waiting for delivery, or `None` if the queue does not exist.
    pub fn queue_depth(&self, queue: &QueueName) -> Option<usize> {
        lock(&self.shared).queues.get(queue).map(|q| q.ready.len())
    }

    /// Delivered but unacknowledged messages, or `None` if the queue does not exist.
    pub fn in_flight(&self, queue: &QueueName) -> Option<usize> {
        lock(&self.shared).queues.get(queue).map(|q| q.in_flight.len())
    }

    /// Consumers currently bound to a queue.
    pub fn consumer_count(&self, queue: &QueueName) -> usize {
        lock(&self.shared)
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    pub fn queue_exists(&self, queue: &QueueName) -> bool {
        lock(&self.shared).queues.contains_key(queue)
    }

    pub fn active_connections(&self) -> usize {
        lock(&self.shared).connections.len()
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn connect(
        &self,
        session_id: SessionId,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn BrokerConnection>, ConnectionError> {
        let mut inner = lock(&self.shared);

        if inner.unreachable {
            return Err(ConnectionError::Unreachable {
                host: config.host().to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let key = (config.vpn().to_string(), config.username().to_string());
        if inner.users.get(&key).map(String::as_str) != Some(config.credentials().secret()) {
            return Err(ConnectionError::Authentication {
                username: config.username().to_string(),
                vpn: config.vpn().to_string(),
            });
        }

        let client_name = config
            .client_name()
            .cloned()
            .unwrap_or_else(|| ClientName::for_session(session_id));
        let in_use = inner
            .connections
            .values()
            .any(|c| c.vpn == config.vpn() && c.client_name == client_name);
        if in_use {
            return Err(ConnectionError::Refused {
                reason: format!("client name '{client_name}' already in use"),
            });
        }

        let flag = Arc::new(AtomicBool::new(true));
        inner.connections.insert(
            session_id,
            Connected {
                flag: Arc::clone(&flag),
                vpn: config.vpn().to_string(),
                client_name: client_name.clone(),
            },
        );
        debug!(%session_id, %client_name, "Client connected");

        Ok(Box::new(MemoryConnection::new(
            Arc::clone(&self.shared),
            session_id,
            flag,
        )))
    }
}
