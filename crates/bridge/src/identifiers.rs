//! Newtype domain identifiers.
//!
//! Every named broker or engine concept is a distinct newtype wrapping a
//! primitive, so a [`QueueName`] can never be passed where a [`FlowId`] is
//! expected even though both are strings under the hood.
//!
//! Topic names and topic filters carry matching rules and live in
//! [`crate::topic`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is blank.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.trim().is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value).ok_or_else(|| format!("{} must not be empty", stringify!($name)))
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Macro for UUID-wrapped newtypes (internally generated).
// Generates: struct (Copy), new_random(), from_uuid(), as_uuid(), Display.
// ---------------------------------------------------------------------------
macro_rules! uuid_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random identifier.
            pub fn new_random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the underlying [`Uuid`].
            pub fn as_uuid(self) -> Uuid {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: engine-assigned
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies the flow an execution is created for (e.g. `"trigger"`).
    FlowId
}

string_id! {
    /// Identifies one trigger declaration within a flow.
    TriggerId
}

// ---------------------------------------------------------------------------
// Identifiers: broker-side names
// ---------------------------------------------------------------------------

string_id! {
    /// Name of a broker queue (e.g. `"test"`).
    QueueName
}

string_id! {
    /// Client name presented to the broker when a session is opened.
    ///
    /// Brokers reject a second live connection with the same client name in
    /// the same VPN, so every session owner picks a distinct one.
    ClientName
}

impl ClientName {
    /// Client name used when the configuration does not supply one.
    pub fn for_session(session_id: SessionId) -> Self {
        Self(format!("topic-bridge/{session_id}"))
    }
}

// ---------------------------------------------------------------------------
// Identifiers: broker-assigned integers
// ---------------------------------------------------------------------------

/// Per-consumer delivery tag used to acknowledge one received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    /// Creates a delivery tag from the raw broker-assigned integer.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying integer value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed
// ---------------------------------------------------------------------------

uuid_id! {
    /// Identifies one opened broker session.
    ///
    /// Attached to every span emitted while the session is live so all
    /// activity on one connection can be correlated.
    SessionId
}

uuid_id! {
    /// Identifies the execution requested by one [`crate::TriggerContext`].
    ExecutionId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_string_ids_are_rejected() {
        assert!(QueueName::new("").is_none());
        assert!(QueueName::new("   ").is_none());
        assert_eq!(QueueName::new("test").unwrap().as_str(), "test");
    }

    #[test]
    fn string_ids_deserialize_through_validation() {
        let flow: FlowId = serde_json::from_str("\"trigger\"").unwrap();
        assert_eq!(flow.to_string(), "trigger");

        let err = serde_json::from_str::<FlowId>("\"\"").unwrap_err();
        assert!(err.to_string().contains("FlowId must not be empty"));
    }

    #[test]
    fn uuid_ids_are_unique() {
        assert_ne!(SessionId::new_random(), SessionId::new_random());
    }
}
