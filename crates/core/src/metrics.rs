//! Prometheus metrics for the staging engine.
//!
//! This module provides metrics for:
//! - Step throughput (batches received and forwarded)
//! - Forked processing (per-slot durations, active processor counts)
//! - Stage health (panics)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts};

// =============================================================================
// Step Throughput
// =============================================================================

/// Batches admitted by a step.
pub static BATCHES_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "batchstage_batches_received_total",
            "Total batches admitted by a step",
        ),
        &["step"],
    )
    .unwrap()
});

/// Batches a step handed to its downstream (or sunk, for terminal steps).
pub static BATCHES_FORWARDED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "batchstage_batches_forwarded_total",
            "Total batches a step finished and passed on",
        ),
        &["step"],
    )
    .unwrap()
});

// =============================================================================
// Forked Processing
// =============================================================================

/// Duration of a single slot invocation.
pub static FORKED_PROCESS_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "batchstage_forked_process_duration_seconds",
            "Duration of one processor slot working on one batch",
        )
        .buckets(vec![
            0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
        ]),
        &["step", "result"], // result: "success", "failed"
    )
    .unwrap()
});

/// Currently active processor count per step.
pub static ACTIVE_PROCESSORS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "batchstage_processors",
            "Number of processor slots new batches are forked across",
        ),
        &["step"],
    )
    .unwrap()
});

// =============================================================================
// Stage Health
// =============================================================================

/// Stages that recorded a panic.
pub static STAGE_PANICS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "batchstage_stage_panics_total",
        "Total stages halted by a recorded panic",
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        Box::new(BATCHES_RECEIVED.clone()),
        Box::new(BATCHES_FORWARDED.clone()),
        Box::new(FORKED_PROCESS_DURATION.clone()),
        Box::new(ACTIVE_PROCESSORS.clone()),
        Box::new(STAGE_PANICS.clone()),
    ]
}
