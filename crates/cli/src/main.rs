//! Topic bridge CLI entry point.
//!
//! Composition root for the workspace:
//!
//! 1. **Parse configuration**: read a JSON scenario file (see [`config`]).
//! 2. **Wire observability**: JSON logs on stderr through
//!    `tracing-subscriber`, with an optional OpenTelemetry OTLP exporter.
//! 3. **Construct infrastructure**: provision an [`InMemoryBroker`] and hand
//!    it to a [`SessionFactory`] shared by the trigger and the producer.
//! 4. **Run a mode**:
//!    - `round-trip` publishes the scenario payloads, evaluates the trigger
//!      once and prints the resulting context on stdout.
//!    - `listen` publishes the payloads, then runs the trigger on its
//!      interval until Ctrl-C, printing every context as it is emitted.

mod config;
mod observability;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bridge::{EmitError, ExecutionSink, TriggerContext};
use clap::{Parser, Subcommand};
use listener::{TriggerEvaluator, TriggerRunner};
use memory_broker::InMemoryBroker;
use producer::Producer;
use session::SessionFactory;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Scenario;
use crate::observability::{init_telemetry, shutdown_telemetry, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "topic-bridge", version, about = "Batching topic trigger and producer")]
struct Cli {
    /// Scenario file describing broker, trigger and producer.
    #[arg(long, short)]
    config: PathBuf,

    /// OTLP gRPC endpoint for span export (e.g. http://localhost:4317).
    #[arg(long)]
    otel_endpoint: Option<String>,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Mode {
    /// Publish the payloads and evaluate the trigger once.
    RoundTrip,
    /// Publish the payloads and keep evaluating until Ctrl-C.
    Listen,
}

/// Writes every context to stdout as one JSON line.
struct StdoutSink;

#[async_trait]
impl ExecutionSink for StdoutSink {
    async fn emit(&self, context: TriggerContext) -> Result<(), EmitError> {
        let line = serde_json::to_string(&context).map_err(|err| EmitError {
            reason: err.to_string(),
        })?;
        println!("{line}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(&TelemetryConfig {
        service_name: "topic-bridge".to_string(),
        otel_endpoint: cli.otel_endpoint.clone(),
        log_level: cli.log_level.clone(),
    })?;

    let result = run(&cli).await;
    if let Err(err) = &result {
        tracing::error!(error = %format!("{err:#}"), "topic-bridge failed");
    }

    shutdown_telemetry(telemetry);
    result
}

async fn run(cli: &Cli) -> Result<()> {
    let scenario = Scenario::load(&cli.config)?;
    let broker: InMemoryBroker = scenario.broker.provision();
    let factory = SessionFactory::new(Arc::new(broker.clone()));

    let report = Producer::new(factory.clone())
        .run(&scenario.producer, &scenario.from)
        .await
        .context("producer run failed")?;
    info!(published = report.published_count, "Payloads published");

    let evaluator = TriggerEvaluator::new(scenario.trigger.clone(), factory);

    match cli.mode.unwrap_or(Mode::RoundTrip) {
        Mode::RoundTrip => round_trip(evaluator).await,
        Mode::Listen => listen(evaluator).await,
    }
}

async fn round_trip(evaluator: TriggerEvaluator) -> Result<()> {
    let outcome = evaluator.evaluate(&CancellationToken::new()).await;
    if let Some(close) = evaluator.shutdown().await {
        info!(outcome = ?close, "Trigger session closed");
    }

    match outcome.context("trigger evaluation failed")? {
        Some(context) => {
            StdoutSink.emit(context).await?;
        }
        None => warn!("No messages arrived before the evaluation timeout"),
    }
    info!(stats = ?evaluator.stats(), "Round trip complete");
    Ok(())
}

async fn listen(evaluator: TriggerEvaluator) -> Result<()> {
    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "Failed to listen for Ctrl-C");
                return;
            }
            info!("Stop signal received");
            stop.cancel();
        }
    });

    let runner = TriggerRunner::new(evaluator, Arc::new(StdoutSink));
    let summary = runner.run(stop).await.context("trigger runner stopped")?;
    info!(?summary, "Listener finished");
    Ok(())
}
