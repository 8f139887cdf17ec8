//! Topic bridge session lifecycle.
//!
//! Sits between the orchestration crates (`listener`, `producer`) and a
//! broker adapter implementing the [`bridge`] port traits:
//!
//! - [`SessionFactory`] / [`BrokerSession`]: authenticated connections, at
//!   most one live per descriptor, idempotent close.
//! - [`QueueSubscription`]: queue binding with a hard receive timeout and a
//!   release that is safe after the session is gone.
//!
//! ## Architectural Layer
//!
//! **Infrastructure core.** No vendor types appear here; adapters are reached
//! only through [`bridge::BrokerClient`] and the traits it hands out.

pub mod session;
pub mod subscription;

pub use session::{BrokerSession, CloseOutcome, ConnectionDescriptor, SessionFactory};
pub use subscription::QueueSubscription;
