//! Drives a [`TriggerEvaluator`] on the scheduler's cadence.

use std::sync::Arc;
use std::time::Duration;

use bridge::{EvaluationError, ExecutionSink, RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::TriggerEvaluator;

/// Counters reported when a runner stops on its stop signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    /// Contexts accepted by the sink.
    pub emitted: u64,
    /// Contexts the sink refused.
    pub emit_failures: u64,
    /// Cycles that ended in a retryable error.
    pub failed_cycles: u64,
}

/// Evaluates a trigger repeatedly until stopped, forwarding every produced
/// context to an [`ExecutionSink`].
pub struct TriggerRunner {
    evaluator: TriggerEvaluator,
    sink: Arc<dyn ExecutionSink>,
}

impl TriggerRunner {
    pub fn new(evaluator: TriggerEvaluator, sink: Arc<dyn ExecutionSink>) -> Self {
        Self { evaluator, sink }
    }

    pub fn evaluator(&self) -> &TriggerEvaluator {
        &self.evaluator
    }

    /// Runs until `stop` is cancelled or a cycle fails with a non-retryable
    /// error. The broker session is closed on both paths.
    #[instrument(skip_all, fields(trigger_id = %self.evaluator.config().trigger_id))]
    pub async fn run(&self, stop: CancellationToken) -> Result<RunSummary, EvaluationError> {
        let interval = self.evaluator.config().interval;
        let mut summary = RunSummary::default();
        info!(?interval, "Trigger runner started");

        let result = loop {
            summary.cycles += 1;
            let delay = match self.evaluator.evaluate(&stop).await {
                Ok(Some(context)) => {
                    let execution_id = context.execution_id;
                    match self.sink.emit(context).await {
                        Ok(()) => {
                            summary.emitted += 1;
                            debug!(%execution_id, "Execution emitted");
                        }
                        Err(err) => {
                            summary.emit_failures += 1;
                            error!(%execution_id, error = %err, "Execution could not be emitted");
                        }
                    }
                    interval
                }
                Ok(None) => interval,
                Err(EvaluationError::Cancelled) => break Ok(summary),
                Err(err) => match err.retry_policy() {
                    RetryPolicy::Retryable { after } => {
                        summary.failed_cycles += 1;
                        warn!(error = %err, "Evaluation failed; retrying next cycle");
                        after.map_or(interval, |after| after.max(interval))
                    }
                    RetryPolicy::NonRetryable => {
                        error!(error = %err, "Evaluation failed permanently; stopping runner");
                        break Err(err);
                    }
                },
            };

            if Self::pause(&stop, delay).await {
                break Ok(summary);
            }
        };

        if let Some(outcome) = self.evaluator.shutdown().await {
            info!(?outcome, "Trigger session closed");
        }
        info!(?summary, "Trigger runner stopped");
        result
    }

    /// Sleeps for `delay`. Returns `true` if the stop signal fired first.
    async fn pause(stop: &CancellationToken, delay: Duration) -> bool {
        if delay.is_zero() {
            return stop.is_cancelled();
        }
        tokio::select! {
            _ = stop.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}
