//! Prometheus metrics registration and export.
//!
//! All dayforge metrics live in one registry held in `OnceLock` statics.
//! Recording before [`init_metrics`] is a no-op.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock, PoisonError};

/// Global Prometheus registry for all dayforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Stage entries, labeled by the stage entered.
pub static STAGE_TRANSITIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage failures, labeled by stage and reason (`adapter` or `timeout`).
pub static STAGE_FAILURES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Adapter call duration in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Units acquired so far for the current day.
pub static UNITS_ACQUIRED: OnceLock<Gauge> = OnceLock::new();

/// 1 for the current stage, 0 for the others.
pub static CURRENT_STAGE: OnceLock<GaugeVec> = OnceLock::new();

/// Event loop faults recorded by the supervisor.
pub static CRASHES_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Serializes [`init_metrics`] so the statics come from a single registry.
static INIT: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once and from several threads; only the first
/// call registers anything.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric cannot be created or registered.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _init = INIT.lock().unwrap_or_else(PoisonError::into_inner);
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let stage_transitions = CounterVec::new(
        Opts::new("dayforge_stage_transitions_total", "Stage entries"),
        &["stage"],
    )?;

    let stage_failures = CounterVec::new(
        Opts::new("dayforge_stage_failures_total", "Stage failures"),
        &["stage", "reason"],
    )?;

    let stage_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "dayforge_stage_duration_seconds",
            "Adapter call duration in seconds",
        )
        .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
        &["stage"],
    )?;

    let units_acquired = Gauge::new(
        "dayforge_units_acquired",
        "Units acquired for the current day",
    )?;

    let current_stage = GaugeVec::new(
        Opts::new("dayforge_current_stage", "Current stage of the pipeline day"),
        &["stage"],
    )?;

    let crashes = IntCounter::new("dayforge_crashes_total", "Event loop faults")?;

    registry.register(Box::new(stage_transitions.clone()))?;
    registry.register(Box::new(stage_failures.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(units_acquired.clone()))?;
    registry.register(Box::new(current_stage.clone()))?;
    registry.register(Box::new(crashes.clone()))?;

    // Held under INIT with REGISTRY unset, so every set succeeds. REGISTRY
    // goes last; it marks initialization as complete.
    let _ = STAGE_TRANSITIONS_TOTAL.set(stage_transitions);
    let _ = STAGE_FAILURES_TOTAL.set(stage_failures);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = UNITS_ACQUIRED.set(units_acquired);
    let _ = CURRENT_STAGE.set(current_stage);
    let _ = CRASHES_TOTAL.set(crashes);
    let _ = REGISTRY.set(registry);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
