//! Counters and gauges exported in the Prometheus text format.
//!
//! One [`CuMetrics`] registry is shared across the pipeline, caches, and
//! worker pools. Gauges that mirror point-in-time state (cache usage, pool
//! occupancy) are refreshed by [`crate::api`] just before scraping.

use std::sync::Arc;

use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum MetricsError {
    #[error("metric registration failed: {0}")]
    #[diagnostic(code(cueval::metrics::register))]
    Register(#[from] prometheus::Error),
}

/// Registry of every metric the core exports.
#[derive(Clone)]
pub struct CuMetrics {
    registry: Arc<Registry>,
    /// Evaluations applied, labelled by stream type (`scheduled` /
    /// `dry-run`), message type (`message` / `cron` / `assignment`), and
    /// whether the process reported an error.
    pub evaluations: IntCounterVec,
    /// Messages skipped because an identical identity was already
    /// evaluated.
    pub duplicate_messages: IntCounterVec,
    /// Checkpoint attempts by outcome (`uploaded` / `recorded` / `failed` /
    /// `throttled`).
    pub checkpoints: IntCounterVec,
    /// Process-memory cache occupancy.
    pub cache_entries: IntGauge,
    pub cache_bytes: IntGauge,
    pub cache_spilled: IntGauge,
    /// Worker occupancy, labelled by pool (`primary` / `dry-run`) and state
    /// (`active` / `idle` / `pending`).
    pub workers: IntGaugeVec,
    /// In-flight single-flight evaluations.
    pub pending_read_states: IntGauge,
}

impl CuMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let evaluations = IntCounterVec::new(
            Opts::new("cu_evaluations_total", "Messages evaluated"),
            &["stream_type", "message_type", "process_error"],
        )?;
        let duplicate_messages = IntCounterVec::new(
            Opts::new(
                "cu_duplicate_messages_total",
                "Messages skipped as already evaluated",
            ),
            &["message_type"],
        )?;
        let checkpoints = IntCounterVec::new(
            Opts::new("cu_checkpoints_total", "Checkpoint attempts by outcome"),
            &["outcome"],
        )?;
        let cache_entries = IntGauge::new(
            "cu_process_memory_cache_entries",
            "Entries in the process memory cache",
        )?;
        let cache_bytes = IntGauge::new(
            "cu_process_memory_cache_bytes",
            "Resident bytes in the process memory cache",
        )?;
        let cache_spilled = IntGauge::new(
            "cu_process_memory_cache_spilled",
            "File-backed entries in the process memory cache",
        )?;
        let workers = IntGaugeVec::new(
            Opts::new("cu_workers", "Worker pool occupancy"),
            &["pool", "state"],
        )?;
        let pending_read_states = IntGauge::new(
            "cu_pending_read_states",
            "Processes with an evaluation in flight",
        )?;

        registry.register(Box::new(evaluations.clone()))?;
        registry.register(Box::new(duplicate_messages.clone()))?;
        registry.register(Box::new(checkpoints.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(cache_bytes.clone()))?;
        registry.register(Box::new(cache_spilled.clone()))?;
        registry.register(Box::new(workers.clone()))?;
        registry.register(Box::new(pending_read_states.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            evaluations,
            duplicate_messages,
            checkpoints,
            cache_entries,
            cache_bytes,
            cache_spilled,
            workers,
            pending_read_states,
        })
    }

    /// Render every registered metric in the Prometheus exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "metrics encoding failed");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
