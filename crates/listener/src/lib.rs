//! Topic bridge trigger.
//!
//! - [`TriggerEvaluator`] runs one evaluation cycle at a time: it owns the
//!   trigger's broker session, queue subscription and batch accumulator, and
//!   returns a [`bridge::TriggerContext`] when a non-empty batch is flushed.
//! - [`TriggerRunner`] is the scheduler side. It calls the evaluator on a
//!   fixed interval until a stop signal fires and hands every context to an
//!   [`bridge::ExecutionSink`].
//!
//! ## Delivery
//!
//! Messages are acknowledged only once their batch is flush-ready. A cycle
//! that fails or is cancelled discards its partial batch without
//! acknowledging, so the broker redelivers those messages to a later cycle.
//! Malformed messages are skipped and acknowledged with the batch.
//!
//! ## Architectural Layer
//!
//! **Orchestration.** Broker access goes through the `session` crate; this
//! crate never sees an adapter type.

pub mod evaluator;
pub mod runner;

pub use evaluator::{EvaluatorStats, TriggerEvaluator};
pub use runner::{RunSummary, TriggerRunner};
