//! The per-date pipeline record and its stage enum.
//!
//! A [`PipelineDay`] is the unit of state the orchestrator owns. It is
//! created by the daily reset controller, mutated only by the stage machine
//! from inside the event loop, and archived when the next day starts.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Stages that invoke an adapter and can therefore fail, time out and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Acquiring,
    Transforming,
    Uploading,
    ReportGenerating,
    Notifying,
}

impl StageKind {
    /// All adapter stages in pipeline order.
    pub const ALL: [StageKind; 5] = [
        StageKind::Acquiring,
        StageKind::Transforming,
        StageKind::Uploading,
        StageKind::ReportGenerating,
        StageKind::Notifying,
    ];

    /// Stable snake_case name used in config keys, logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Acquiring => "acquiring",
            StageKind::Transforming => "transforming",
            StageKind::Uploading => "uploading",
            StageKind::ReportGenerating => "report_generating",
            StageKind::Notifying => "notifying",
        }
    }

    /// The running stage this kind corresponds to.
    pub fn stage(&self) -> Stage {
        match self {
            StageKind::Acquiring => Stage::Acquiring,
            StageKind::Transforming => Stage::Transforming,
            StageKind::Uploading => Stage::Uploading,
            StageKind::ReportGenerating => Stage::ReportGenerating,
            StageKind::Notifying => Stage::Notifying,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "acquiring" | "acquire" => Ok(StageKind::Acquiring),
            "transforming" | "transform" => Ok(StageKind::Transforming),
            "uploading" | "upload" => Ok(StageKind::Uploading),
            "report_generating" | "report" => Ok(StageKind::ReportGenerating),
            "notifying" | "notify" => Ok(StageKind::Notifying),
            other => Err(format!("Unknown stage: {}", other)),
        }
    }
}

/// Position of a [`PipelineDay`] in the daily pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Acquiring,
    AwaitingThreshold,
    Transforming,
    Uploading,
    ReportGenerating,
    Notifying,
    Done,
    /// A stage's adapter call failed. `halted` is set once the retry limit
    /// for that stage is reached; the day then stays here until reset.
    Failed { stage: StageKind, halted: bool },
}

impl Stage {
    /// Ordering rank used to keep transitions monotonic.
    ///
    /// Acquiring and AwaitingThreshold share a rank because the acquisition
    /// phase loops between them.
    fn rank(&self) -> u8 {
        match self {
            Stage::Idle => 0,
            Stage::Acquiring | Stage::AwaitingThreshold => 1,
            Stage::Transforming => 2,
            Stage::Uploading => 3,
            Stage::ReportGenerating => 4,
            Stage::Notifying => 5,
            Stage::Done => 6,
            Stage::Failed { stage, .. } => stage.stage().rank(),
        }
    }

    /// The adapter stage this state is running or failed in, if any.
    pub fn kind(&self) -> Option<StageKind> {
        match self {
            Stage::Acquiring => Some(StageKind::Acquiring),
            Stage::Transforming => Some(StageKind::Transforming),
            Stage::Uploading => Some(StageKind::Uploading),
            Stage::ReportGenerating => Some(StageKind::ReportGenerating),
            Stage::Notifying => Some(StageKind::Notifying),
            Stage::Failed { stage, .. } => Some(*stage),
            Stage::Idle | Stage::AwaitingThreshold | Stage::Done => None,
        }
    }

    /// Returns true if no further transition can happen before the next reset.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed { halted: true, .. })
    }

    /// Check whether moving from `self` to `to` is allowed.
    ///
    /// Forward moves are allowed. From `Failed(s)` the only exits are
    /// re-entering `s` or halting in place. Terminal states have no exits.
    pub fn can_transition(&self, to: Stage) -> bool {
        match (*self, to) {
            (Stage::Done, _) => false,
            (Stage::Failed { stage, .. }, Stage::Failed { stage: next, .. }) => stage == next,
            (Stage::Failed { stage, .. }, next) => next == stage.stage(),
            (from, Stage::Failed { stage, .. }) => from == stage.stage(),
            (from, next) => next.rank() >= from.rank() && from != next,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Idle => write!(f, "idle"),
            Stage::Acquiring => write!(f, "acquiring"),
            Stage::AwaitingThreshold => write!(f, "awaiting_threshold"),
            Stage::Transforming => write!(f, "transforming"),
            Stage::Uploading => write!(f, "uploading"),
            Stage::ReportGenerating => write!(f, "report_generating"),
            Stage::Notifying => write!(f, "notifying"),
            Stage::Done => write!(f, "done"),
            Stage::Failed {
                stage,
                halted: false,
            } => write!(f, "failed({})", stage),
            Stage::Failed {
                stage,
                halted: true,
            } => write!(f, "failed({}, halted)", stage),
        }
    }
}

/// The pipeline state for one business date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDay {
    pub date: NaiveDate,
    pub stage: Stage,
    pub units_acquired: u32,
    pub threshold_met: bool,
    pub transform_artifact_ref: Option<String>,
    pub upload_completed: bool,
    pub report_artifact_ref: Option<String>,
    #[serde(default)]
    pub notifications_sent: BTreeSet<String>,
    #[serde(default)]
    pub retry_counts: BTreeMap<StageKind, u32>,
    pub last_error: Option<String>,
    /// Number of acquisition dispatches made today.
    #[serde(default)]
    pub acquisition_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineDay {
    /// Creates an idle day. Only the daily reset controller calls this.
    pub(crate) fn new(date: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            date,
            stage: Stage::Idle,
            units_acquired: 0,
            threshold_met: false,
            transform_artifact_ref: None,
            upload_completed: false,
            report_artifact_ref: None,
            notifications_sent: BTreeSet::new(),
            retry_counts: BTreeMap::new(),
            last_error: None,
            acquisition_attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true once the day is Done or halted.
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Returns true when the day halted after exhausting a stage's retries.
    pub fn is_halted(&self) -> bool {
        matches!(self.stage, Stage::Failed { halted: true, .. })
    }

    /// Retry count recorded for a stage today.
    pub fn retry_count(&self, stage: StageKind) -> u32 {
        self.retry_counts.get(&stage).copied().unwrap_or(0)
    }

    /// Adds freshly acquired units. The counter never goes down.
    pub fn add_units(&mut self, count: u32) {
        self.units_acquired = self.units_acquired.saturating_add(count);
        self.touch();
    }

    /// Records the transform artifact.
    ///
    /// Returns false and leaves the day untouched if it was already set.
    pub fn set_transform_artifact(&mut self, artifact: impl Into<String>) -> bool {
        if self.transform_artifact_ref.is_some() {
            return false;
        }
        self.transform_artifact_ref = Some(artifact.into());
        self.touch();
        true
    }

    /// Records the report artifact. Same set-once rule as the transform.
    pub fn set_report_artifact(&mut self, artifact: impl Into<String>) -> bool {
        if self.report_artifact_ref.is_some() {
            return false;
        }
        self.report_artifact_ref = Some(artifact.into());
        self.touch();
        true
    }

    /// Increments and returns the retry count for a stage.
    pub(crate) fn bump_retry(&mut self, stage: StageKind) -> u32 {
        let count = self.retry_counts.entry(stage).or_insert(0);
        *count += 1;
        *count
    }

    /// Refreshes `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// One-line human summary used in logs, alerts and the status command.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} stage={} units={} threshold_met={}",
            self.date, self.stage, self.units_acquired, self.threshold_met
        );
        if let Some(ref err) = self.last_error {
            out.push_str(&format!(" last_error=\"{}\"", err));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, 5).unwrap()
    }

    #[test]
    fn test_new_day_is_idle() {
        let day = PipelineDay::new(date());
        assert_eq!(day.stage, Stage::Idle);
        assert_eq!(day.units_acquired, 0);
        assert!(!day.threshold_met);
        assert!(!day.is_terminal());
    }

    #[test]
    fn test_transform_artifact_is_set_once() {
        let mut day = PipelineDay::new(date());
        assert!(day.set_transform_artifact("merged/2024-07-05.xlsx"));
        assert!(!day.set_transform_artifact("other.xlsx"));
        assert_eq!(
            day.transform_artifact_ref.as_deref(),
            Some("merged/2024-07-05.xlsx")
        );
    }

    #[test]
    fn test_forward_transitions() {
        assert!(Stage::Idle.can_transition(Stage::Acquiring));
        assert!(Stage::Acquiring.can_transition(Stage::AwaitingThreshold));
        assert!(Stage::AwaitingThreshold.can_transition(Stage::Acquiring));
        assert!(Stage::AwaitingThreshold.can_transition(Stage::Transforming));
        assert!(Stage::Uploading.can_transition(Stage::ReportGenerating));
        assert!(Stage::Notifying.can_transition(Stage::Done));
    }

    #[test]
    fn test_backward_transitions_rejected() {
        assert!(!Stage::Uploading.can_transition(Stage::Transforming));
        assert!(!Stage::Transforming.can_transition(Stage::Acquiring));
        assert!(!Stage::Done.can_transition(Stage::Idle));
        assert!(!Stage::Uploading.can_transition(Stage::Uploading));
    }

    #[test]
    fn test_failed_reenters_same_stage_only() {
        let failed = Stage::Failed {
            stage: StageKind::Uploading,
            halted: false,
        };
        assert!(failed.can_transition(Stage::Uploading));
        assert!(!failed.can_transition(Stage::ReportGenerating));
        assert!(!failed.can_transition(Stage::Transforming));
        assert!(failed.can_transition(Stage::Failed {
            stage: StageKind::Uploading,
            halted: true,
        }));
        assert!(Stage::Uploading.can_transition(failed));
        assert!(!Stage::Transforming.can_transition(failed));
    }

    #[test]
    fn test_stage_serialization() {
        let json = serde_json::to_string(&Stage::Failed {
            stage: StageKind::ReportGenerating,
            halted: true,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"state":"failed","stage":"report_generating","halted":true}"#
        );

        let parsed: Stage = serde_json::from_str(r#"{"state":"awaiting_threshold"}"#).unwrap();
        assert_eq!(parsed, Stage::AwaitingThreshold);
    }

    #[test]
    fn test_stage_kind_from_str() {
        assert_eq!("upload".parse::<StageKind>().unwrap(), StageKind::Uploading);
        assert_eq!(
            "report-generating".parse::<StageKind>().unwrap(),
            StageKind::ReportGenerating
        );
        assert!("bogus".parse::<StageKind>().is_err());
    }

    #[test]
    fn test_retry_counts() {
        let mut day = PipelineDay::new(date());
        assert_eq!(day.retry_count(StageKind::Uploading), 0);
        assert_eq!(day.bump_retry(StageKind::Uploading), 1);
        assert_eq!(day.bump_retry(StageKind::Uploading), 2);
        assert_eq!(day.retry_count(StageKind::Uploading), 2);
        assert_eq!(day.retry_count(StageKind::Acquiring), 0);
    }
}
