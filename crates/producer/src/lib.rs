//! Topic bridge producer.
//!
//! [`Producer::run`] opens an independent session, publishes each payload in
//! order to the configured topic and closes the session on every exit path.
//! A failed run reports how many messages made it out before the failure
//! through [`bridge::ProduceError::published_count`].

mod producer;

pub use producer::Producer;
