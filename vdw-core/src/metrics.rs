//! Prometheus metrics for the orchestrator and the tool registry.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `vdw_mangle_query_latency_ms` | Histogram | |
//! | `vdw_phase_duration_ms` | Histogram | `phase` |
//! | `vdw_tool_success_total` | Counter | `tool_id` |
//! | `vdw_tool_failure_total` | Counter | `tool_id` |
//!
//! Every [`MetricsRegistry`] owns its own Prometheus registry, so separate
//! orchestrators (and tests) never share counters.

use prometheus::{CounterVec, Encoder, Histogram, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Label values longer than this are cut at a char boundary.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

pub const ORACLE_LATENCY_BUCKETS: &[f64] = &[5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0];
pub const PHASE_DURATION_BUCKETS: &[f64] = &[50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 10000.0, 30000.0];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

pub type MetricsResult<T> = std::result::Result<T, MetricsError>;

/// Handles to every VDW metric. Cheap to clone; all clones record into the
/// same registry.
#[derive(Clone)]
pub struct VdwMetrics {
    oracle_latency: Histogram,
    phase_duration: HistogramVec,
    tool_success_total: CounterVec,
    tool_failure_total: CounterVec,
}

impl VdwMetrics {
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let oracle_latency = Histogram::with_opts(
            HistogramOpts::new(
                "vdw_mangle_query_latency_ms",
                "Latency of reasoning oracle queries (ms)",
            )
            .buckets(ORACLE_LATENCY_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(oracle_latency.clone()))?;

        let phase_duration = HistogramVec::new(
            HistogramOpts::new("vdw_phase_duration_ms", "Time spent in a phase before leaving it (ms)")
                .buckets(PHASE_DURATION_BUCKETS.to_vec()),
            &["phase"],
        )?;
        registry.register(Box::new(phase_duration.clone()))?;

        let tool_success_total = CounterVec::new(
            Opts::new("vdw_tool_success_total", "Total successful tool executions"),
            &["tool_id"],
        )?;
        registry.register(Box::new(tool_success_total.clone()))?;

        let tool_failure_total = CounterVec::new(
            Opts::new("vdw_tool_failure_total", "Total failed tool executions"),
            &["tool_id"],
        )?;
        registry.register(Box::new(tool_failure_total.clone()))?;

        Ok(Self {
            oracle_latency,
            phase_duration,
            tool_success_total,
            tool_failure_total,
        })
    }

    pub fn observe_oracle_latency(&self, latency_ms: f64) {
        self.oracle_latency.observe(latency_ms);
    }

    pub fn oracle_query_count(&self) -> u64 {
        self.oracle_latency.get_sample_count()
    }

    /// Records how long a project stayed in `phase`.
    pub fn observe_phase_duration(&self, phase: &str, duration_ms: f64) {
        self.phase_duration
            .with_label_values(&[truncate_label(phase)])
            .observe(duration_ms);
    }

    pub fn phase_sample_count(&self, phase: &str) -> u64 {
        self.phase_duration
            .with_label_values(&[truncate_label(phase)])
            .get_sample_count()
    }

    pub fn tool_outcome(&self, tool_id: &str, success: bool) {
        let counter = if success {
            &self.tool_success_total
        } else {
            &self.tool_failure_total
        };
        counter.with_label_values(&[truncate_label(tool_id)]).inc();
    }

    /// `(successes, failures)` recorded for `tool_id`.
    pub fn tool_outcomes(&self, tool_id: &str) -> (f64, f64) {
        let label = truncate_label(tool_id);
        (
            self.tool_success_total.with_label_values(&[label]).get(),
            self.tool_failure_total.with_label_values(&[label]).get(),
        )
    }
}

/// A Prometheus registry with the VDW metrics registered in it.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    metrics: VdwMetrics,
}

impl MetricsRegistry {
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let metrics = VdwMetrics::new(&registry)?;
        Ok(Self { registry, metrics })
    }

    pub fn metrics(&self) -> &VdwMetrics {
        &self.metrics
    }

    /// Everything gathered so far, in the Prometheus text exposition format.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let end = value
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
        .last()
        .unwrap_or(0);
    &value[..end]
}
