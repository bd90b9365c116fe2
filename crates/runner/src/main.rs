mod workload;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use batchstage_core::{
    load_config, metrics, validate_config, Config, ConfigError, DeadEndStep,
    ForkedProcessorStep, RunnerConfig, Stage, StageControl, Step, StepControl, StepError,
};

use workload::{Digest, RecordBatch};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("batchstage {}", VERSION);

    // Determine config path
    let config_path = std::env::var("BATCHSTAGE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    info!("Loading configuration from {:?}", config_path);
    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(ConfigError::FileNotFound(_)) => {
            warn!("No config file at {:?}, using defaults", config_path);
            Config::default()
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to load config from {:?}", config_path))
        }
    };
    validate_config(&config).context("Configuration validation failed")?;

    info!(
        max_processors = config.staging.max_number_of_processors(),
        initial_processors = config.staging.initial_processors(),
        batches = config.runner.batches,
        batch_size = config.runner.batch_size,
        "Configuration loaded"
    );

    let registry = Registry::new();
    for metric in metrics::all_metrics() {
        registry
            .register(metric)
            .context("Failed to register metrics")?;
    }

    // Build the stage: DIGEST -> VERIFY -> END
    let control = Arc::new(StageControl::new("records"));
    let mut stage = Stage::new(
        Arc::clone(&control),
        Duration::from_millis(config.staging.poll_interval_ms),
    );
    let processor = stage.add(Arc::new(ForkedProcessorStep::new(
        Arc::clone(&control),
        "DIGEST",
        &config.staging,
        Digest,
    )));
    let verify = stage.add(Arc::new(ForkedProcessorStep::new(
        Arc::clone(&control),
        "VERIFY",
        &config.staging.clone().with_max_processors(1),
        |_slot: usize, _processors: usize, batch: &RecordBatch| -> anyhow::Result<()> {
            anyhow::ensure!(
                batch.is_digested(),
                "batch starting at record {:?} left records undigested",
                batch.first_id()
            );
            Ok(())
        },
    )));
    let end = stage.add(Arc::new(DeadEndStep::new(Arc::clone(&control), "END")));
    processor.set_downstream(verify.clone());
    verify.set_downstream(end.clone());

    let execution = stage.execute().await.context("Failed to start stage")?;

    tokio::select! {
        result = feed(&processor, &config.runner) => {
            if let Err(e) = result {
                warn!("Stopped feeding batches: {}", e);
            }
        }
        _ = shutdown_signal() => {
            warn!("Shutdown requested, aborting stage");
            control.panic(anyhow::anyhow!("interrupted"));
        }
    }

    processor.end_of_upstream().await;
    let outcome = execution.await_completion().await;

    let stats = execution.stats();
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).context("Failed to serialize stats")?
    );
    print_metrics(&registry)?;

    outcome.context("Stage failed")?;
    info!(batches = end.received(), "All batches processed");
    Ok(())
}

/// Push the configured number of batches, nudging the processor count up
/// and down every `resize_every` batches.
async fn feed(
    processor: &ForkedProcessorStep<RecordBatch, Digest>,
    runner: &RunnerConfig,
) -> Result<(), StepError> {
    for ticket in 0..runner.batches {
        if runner.resize_every > 0 && ticket > 0 && ticket % runner.resize_every == 0 {
            let delta = if (ticket / runner.resize_every) % 4 < 2 { 1 } else { -1 };
            let processors = processor.processors(delta);
            debug!(ticket, processors, "Adjusted processors");
        }

        let batch = RecordBatch::new(ticket * runner.batch_size as u64, runner.batch_size);
        processor.receive(ticket, batch).await?;
    }
    Ok(())
}

fn print_metrics(registry: &Registry) -> Result<()> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("Failed to encode metrics")?;
    println!("{}", String::from_utf8_lossy(&buffer));
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
