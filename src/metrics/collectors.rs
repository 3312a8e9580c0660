//! High-level recording interface over the raw Prometheus metrics.

use std::time::Duration;

use crate::pipeline::day::{PipelineDay, Stage, StageKind};

use super::prometheus::{
    CRASHES_TOTAL, CURRENT_STAGE, STAGE_DURATION, STAGE_FAILURES_TOTAL, STAGE_TRANSITIONS_TOTAL,
    UNITS_ACQUIRED,
};

/// Stage labels exported by the current-stage gauge.
const STAGE_LABELS: [&str; 9] = [
    "idle",
    "acquiring",
    "awaiting_threshold",
    "transforming",
    "uploading",
    "report_generating",
    "notifying",
    "done",
    "failed",
];

/// Metrics collector for pipeline operations.
///
/// Metrics must be initialized with `init_metrics()` first; until then every
/// method is a no-op.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record entry into `stage`.
    pub fn record_transition(&self, stage: &Stage) {
        let label = stage_label(stage);
        if let Some(transitions) = STAGE_TRANSITIONS_TOTAL.get() {
            transitions.with_label_values(&[label]).inc();
        }
        tracing::trace!(stage = label, "Recorded stage transition metric");
    }

    /// Record a finished adapter call.
    pub fn record_stage_duration(&self, stage: StageKind, duration: Duration) {
        if let Some(histogram) = STAGE_DURATION.get() {
            histogram
                .with_label_values(&[stage.as_str()])
                .observe(duration.as_secs_f64());
        }
    }

    /// Record a stage failure with its reason label.
    pub fn record_failure(&self, stage: StageKind, reason: &str) {
        if let Some(failures) = STAGE_FAILURES_TOTAL.get() {
            failures.with_label_values(&[stage.as_str(), reason]).inc();
        }
        tracing::trace!(stage = %stage, reason, "Recorded stage failure metric");
    }

    /// Refresh gauges from the current day.
    pub fn record_day(&self, day: &PipelineDay) {
        if let Some(units) = UNITS_ACQUIRED.get() {
            units.set(f64::from(day.units_acquired));
        }
        if let Some(current) = CURRENT_STAGE.get() {
            let active = stage_label(&day.stage);
            for label in STAGE_LABELS {
                current
                    .with_label_values(&[label])
                    .set(if label == active { 1.0 } else { 0.0 });
            }
        }
    }

    pub fn record_crash(&self) {
        if let Some(crashes) = CRASHES_TOTAL.get() {
            crashes.inc();
        }
    }
}

fn stage_label(stage: &Stage) -> &'static str {
    match stage {
        Stage::Idle => "idle",
        Stage::AwaitingThreshold => "awaiting_threshold",
        Stage::Done => "done",
        Stage::Failed { .. } => "failed",
        other => other.kind().map(|k| k.as_str()).unwrap_or("idle"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_stage_label() {
        assert_eq!(stage_label(&Stage::Uploading), "uploading");
        assert_eq!(
            stage_label(&Stage::Failed {
                stage: StageKind::Uploading,
                halted: true
            }),
            "failed"
        );
        for label in STAGE_LABELS {
            assert!(!label.is_empty());
        }
    }

    #[test]
    fn test_collector_records() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();
        collector.record_transition(&Stage::Transforming);
        collector.record_failure(StageKind::Uploading, "timeout");
        collector.record_stage_duration(StageKind::Uploading, Duration::from_secs(42));
        collector.record_crash();

        let text = export_metrics();
        assert!(text.contains("dayforge_stage_transitions_total"));
        assert!(text.contains("reason=\"timeout\""));
        assert!(text.contains("dayforge_crashes_total"));
    }
}
