//! Authenticated broker sessions.
//!
//! A [`SessionFactory`] wraps one [`BrokerClient`] and guarantees that at most
//! one session per [`ConnectionDescriptor`] is live at a time. A
//! [`BrokerSession`] owns the connection until [`BrokerSession::close`] is
//! called; closing is idempotent and never fails.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridge::{
    BrokerClient, BrokerConnection, ClientName, ConnectionConfig, ConnectionError, DeliveryMode,
    MessageBody, PublishError, SessionClosedError, SessionId, TopicName,
};
use tracing::{debug, info, instrument, warn};

/// Identity of a logical connection: who connects where, under which client name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub vpn: String,
    pub username: String,
    pub client_name: ClientName,
}

impl std::fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}/{} ({})",
            self.username, self.host, self.vpn, self.client_name
        )
    }
}

/// Result of [`BrokerSession::close`]. Callers log it; it is never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The connection was torn down by this call.
    Closed,
    /// An earlier call already closed the session; nothing was released.
    AlreadyClosed,
    /// The broker reported a failure while disconnecting. The session is
    /// closed regardless.
    Failed(String),
}

type LiveSet = Arc<Mutex<HashSet<ConnectionDescriptor>>>;

/// Opens sessions against one broker client.
#[derive(Clone)]
pub struct SessionFactory {
    client: Arc<dyn BrokerClient>,
    live: LiveSet,
}

impl SessionFactory {
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self {
            client,
            live: Arc::default(),
        }
    }

    /// Opens an authenticated session.
    ///
    /// A client name is generated when the configuration has none. Fails with
    /// [`ConnectionError::AlreadyOpen`] if the same descriptor is still live.
    #[instrument(skip(self, config), fields(host = %config.host(), vpn = %config.vpn()))]
    pub async fn open(&self, config: &ConnectionConfig) -> Result<BrokerSession, ConnectionError> {
        let id = SessionId::new_random();
        let client_name = config
            .client_name()
            .cloned()
            .unwrap_or_else(|| ClientName::for_session(id));
        let config = config.clone().with_client_name(client_name.clone());

        let descriptor = ConnectionDescriptor {
            host: config.host().to_string(),
            vpn: config.vpn().to_string(),
            username: config.username().to_string(),
            client_name,
        };

        let slot = LiveSlot::claim(&self.live, descriptor.clone())?;
        let connection = self.client.connect(id, &config).await?;

        info!(session_id = %id, client_name = %descriptor.client_name, "Broker session opened");

        Ok(BrokerSession {
            id,
            descriptor,
            connection: Arc::from(connection),
            closed: Arc::new(AtomicBool::new(false)),
            slot: Some(slot),
        })
    }

    /// Number of sessions currently live through this factory.
    pub fn live_sessions(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or_default()
    }
}

/// Reservation of a descriptor in the live set, released on drop.
struct LiveSlot {
    live: LiveSet,
    descriptor: ConnectionDescriptor,
}

impl LiveSlot {
    fn claim(live: &LiveSet, descriptor: ConnectionDescriptor) -> Result<Self, ConnectionError> {
        let mut set = live.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !set.insert(descriptor.clone()) {
            return Err(ConnectionError::AlreadyOpen {
                descriptor: descriptor.to_string(),
            });
        }
        Ok(Self {
            live: Arc::clone(live),
            descriptor,
        })
    }
}

impl Drop for LiveSlot {
    fn drop(&mut self) {
        let mut set = self
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.descriptor);
    }
}

/// One live, authenticated connection.
///
/// Owned by exactly one trigger instance or producer run.
pub struct BrokerSession {
    id: SessionId,
    descriptor: ConnectionDescriptor,
    connection: Arc<dyn BrokerConnection>,
    closed: Arc<AtomicBool>,
    slot: Option<LiveSlot>,
}

impl BrokerSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// `true` until the session is closed locally or dropped by the broker.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.connection.is_connected()
    }

    /// Publishes one encoded message.
    pub async fn publish(
        &self,
        topic: &TopicName,
        body: MessageBody,
        mode: DeliveryMode,
        ack_timeout: Duration,
    ) -> Result<(), PublishError> {
        if !self.is_open() {
            return Err(SessionClosedError::new("session is closed").into());
        }
        self.connection.publish(topic, body, mode, ack_timeout).await
    }

    /// Closes the session. Safe to call any number of times from any state.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn close(&mut self) -> CloseOutcome {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Session already closed");
            return CloseOutcome::AlreadyClosed;
        }

        let outcome = match self.connection.disconnect().await {
            Ok(()) => CloseOutcome::Closed,
            Err(err) => CloseOutcome::Failed(err.reason),
        };
        self.slot.take();

        info!(?outcome, "Broker session closed");
        outcome
    }

    pub(crate) fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.connection
    }

    pub(crate) fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

/// An unclosed session is disconnected in the background. Its descriptor
/// stays live until the broker has let go of the connection, so the factory
/// count never undercounts what the broker still holds.
impl Drop for BrokerSession {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(session_id = %self.id, "Broker session dropped without close");

        let slot = self.slot.take();
        let connection = Arc::clone(&self.connection);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = connection.disconnect().await {
                        debug!(session_id = %id, error = %err, "Disconnect after drop failed");
                    }
                    drop(slot);
                });
            }
            Err(_) => {
                warn!(session_id = %id, "No runtime to disconnect a dropped session");
            }
        }
    }
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}
