//! Prometheus metrics for the pipeline.
//!
//! The orchestrator records stage transitions, failures and adapter
//! durations through [`MetricsCollector`]; the health check writes
//! [`export_metrics`] output to `<state_dir>/metrics.prom` for a node
//! exporter textfile collector to pick up.

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    CRASHES_TOTAL, CURRENT_STAGE, REGISTRY, STAGE_DURATION, STAGE_FAILURES_TOTAL,
    STAGE_TRANSITIONS_TOTAL, UNITS_ACQUIRED,
};
