//! In-process broker adapter.
//!
//! [`InMemoryBroker`] implements the `bridge` broker ports entirely in memory:
//! VPN users, durable and temporary queues with topic-filter subscriptions,
//! per-delivery acknowledgement, and redelivery of unacknowledged messages when
//! a consumer goes away. It also exposes fault injection (unreachable broker,
//! forced disconnects, rejected or slow publishes) for tests and local runs.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`; consumers wait on a per-queue `tokio::sync::Notify`.

mod broker;
mod connection;

pub use broker::InMemoryBroker;
