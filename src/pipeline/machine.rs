//! Stage state machine.
//!
//! [`StageMachine`] owns the current [`PipelineDay`] and turns every input
//! (slot, stage result, timeout, retry, health check, manual trigger, resume)
//! into a mutation of the day plus an ordered list of [`Command`]s. It does
//! no I/O: the orchestrator executes the commands in order.
//!
//! ```text
//! Idle -> Acquiring <-> AwaitingThreshold -> Transforming -> Uploading
//!      -> ReportGenerating -> Notifying -> Done
//! ```
//!
//! Any adapter stage may fall into `Failed(stage)`, which either re-enters
//! the same stage after a backoff or halts the day once the retry limit is
//! reached.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::{CatchUpWindow, PipelineConfig};
use super::day::{PipelineDay, Stage, StageKind};
use super::threshold::ThresholdMonitor;
use crate::adapters::UnitsRef;

/// Errors raised by an input the machine cannot apply.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// The requested move breaks stage ordering.
    #[error("Illegal transition from {from} to {to}")]
    Illegal { from: Stage, to: Stage },

    /// A manual trigger was refused.
    #[error("Cannot trigger {stage}: {reason}")]
    Rejected { stage: StageKind, reason: String },

    /// A stage needs an artifact the day does not have.
    #[error("Stage {stage} requires the transform artifact, which is not set")]
    MissingArtifact { stage: StageKind },

    /// A stage result carried output for a different stage.
    #[error("Result for {expected} carried output for {actual}")]
    UnexpectedOutput {
        expected: StageKind,
        actual: StageKind,
    },
}

impl TransitionError {
    /// Returns true for refused operator requests, which never fault the loop.
    pub fn is_rejection(&self) -> bool {
        matches!(self, TransitionError::Rejected { .. })
    }
}

/// Retry and backoff rules shared by every adapter stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures after which the day halts.
    pub limit: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(limit: u32, backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            limit,
            backoff,
            max_backoff,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.per_stage_retry_limit,
            config.retry_backoff(),
            config.retry_backoff_max(),
        )
    }

    /// Returns true once `failures` reaches the limit.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.limit
    }

    /// Delay before retry number `failures`: linear, capped.
    pub fn delay(&self, failures: u32) -> Duration {
        self.backoff
            .saturating_mul(failures.max(1))
            .min(self.max_backoff)
    }
}

/// Input handed to an adapter for one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum JobInput {
    Acquire,
    Transform(UnitsRef),
    Upload(String),
    GenerateReport(String),
    Notify {
        kinds: Vec<String>,
        payload: serde_json::Value,
    },
}

impl JobInput {
    pub fn stage(&self) -> StageKind {
        match self {
            JobInput::Acquire => StageKind::Acquiring,
            JobInput::Transform(_) => StageKind::Transforming,
            JobInput::Upload(_) => StageKind::Uploading,
            JobInput::GenerateReport(_) => StageKind::ReportGenerating,
            JobInput::Notify { .. } => StageKind::Notifying,
        }
    }
}

/// One adapter dispatch, identified by a fresh attempt id.
#[derive(Debug, Clone, PartialEq)]
pub struct StageJob {
    pub attempt: Uuid,
    pub date: NaiveDate,
    pub input: JobInput,
}

impl StageJob {
    pub fn stage(&self) -> StageKind {
        self.input.stage()
    }
}

/// Successful adapter output.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Acquired(u32),
    Transformed(String),
    Uploaded,
    Reported(String),
    /// Kinds confirmed sent, and kinds that failed with their error.
    Notified {
        sent: Vec<String>,
        failed: Vec<(String, String)>,
    },
}

impl StageOutput {
    pub fn stage(&self) -> StageKind {
        match self {
            StageOutput::Acquired(_) => StageKind::Acquiring,
            StageOutput::Transformed(_) => StageKind::Transforming,
            StageOutput::Uploaded => StageKind::Uploading,
            StageOutput::Reported(_) => StageKind::ReportGenerating,
            StageOutput::Notified { .. } => StageKind::Notifying,
        }
    }
}

/// Why a dispatch did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageFailure {
    #[error("{0}")]
    Adapter(String),

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl StageFailure {
    fn alert_kind(&self) -> AlertKind {
        match self {
            StageFailure::Adapter(_) => AlertKind::StageFailure,
            StageFailure::Timeout(_) => AlertKind::StageTimeout,
        }
    }

    /// Label used for the failure metric.
    pub fn reason(&self) -> &'static str {
        match self {
            StageFailure::Adapter(_) => "adapter",
            StageFailure::Timeout(_) => "timeout",
        }
    }
}

/// Result of one dispatch as reported by a stage worker.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub attempt: Uuid,
    pub stage: StageKind,
    pub outcome: Result<StageOutput, StageFailure>,
    pub duration: Duration,
}

/// Operator-facing alert categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    StageFailure,
    StageTimeout,
    RetryExhausted,
    PartialDay,
    ProcessCrash,
    CrashLoop,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::StageFailure => "stage_failure",
            AlertKind::StageTimeout => "stage_timeout",
            AlertKind::RetryExhausted => "retry_exhausted",
            AlertKind::PartialDay => "partial_day",
            AlertKind::ProcessCrash => "process_crash",
            AlertKind::CrashLoop => "crash_loop",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message for operators, delivered through the notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageKind>,
    pub message: String,
}

impl Alert {
    pub fn new(kind: AlertKind, date: NaiveDate, message: impl Into<String>) -> Self {
        Self {
            kind,
            date,
            stage: None,
            message: message.into(),
        }
    }

    pub fn with_stage(mut self, stage: StageKind) -> Self {
        self.stage = Some(stage);
        self
    }

    /// JSON body handed to the notifier.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "message": self.message }))
    }
}

/// Side effect requested by the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Write this snapshot of the day to the checkpoint.
    Persist(Box<PipelineDay>),
    /// Run an adapter on a worker task.
    Dispatch(StageJob),
    /// Post `RetryDue(attempt)` after `delay`.
    ScheduleRetry {
        stage: StageKind,
        attempt: Uuid,
        delay: Duration,
    },
    Alert(Alert),
}

/// The dispatch currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub attempt: Uuid,
    pub stage: StageKind,
}

type Commands = Result<Vec<Command>, TransitionError>;

/// Pure transition logic for one pipeline day.
#[derive(Debug, Clone)]
pub struct StageMachine {
    day: PipelineDay,
    monitor: ThresholdMonitor,
    policy: RetryPolicy,
    slot_tags: BTreeSet<String>,
    slot_times: Vec<NaiveTime>,
    required_notifications: Vec<String>,
    catch_up_window: Option<CatchUpWindow>,
    in_flight: Option<InFlight>,
    pending_retry: Option<Uuid>,
}

impl StageMachine {
    pub fn new(day: PipelineDay, config: &PipelineConfig) -> Self {
        Self {
            day,
            monitor: ThresholdMonitor::new(config.threshold),
            policy: RetryPolicy::from_config(config),
            slot_tags: config
                .schedule_slots
                .iter()
                .map(|slot| slot.tag.clone())
                .collect(),
            slot_times: config.schedule_slots.iter().map(|slot| slot.time).collect(),
            required_notifications: config.required_notifications.clone(),
            catch_up_window: config.catch_up_window,
            in_flight: None,
            pending_retry: None,
        }
    }

    pub fn day(&self) -> &PipelineDay {
        &self.day
    }

    pub fn monitor(&self) -> &ThresholdMonitor {
        &self.monitor
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn in_flight(&self) -> Option<InFlight> {
        self.in_flight
    }

    /// Takes over an adapter call that is still running from an earlier
    /// event loop, instead of dispatching `stage` again. Returns false when
    /// something is already in flight or the day is not in `stage`.
    pub fn adopt(&mut self, attempt: Uuid, stage: StageKind) -> bool {
        if self.in_flight.is_some() || self.day.stage != stage.stage() {
            return false;
        }
        info!(date = %self.day.date, %stage, attempt = %attempt, "Adopting running stage");
        self.in_flight = Some(InFlight { attempt, stage });
        true
    }

    /// Swaps in a new day and forgets any in-flight attempt or pending
    /// retry, so their late events are treated as stale. Returns the old day.
    pub fn replace_day(&mut self, day: PipelineDay) -> PipelineDay {
        self.in_flight = None;
        self.pending_retry = None;
        std::mem::replace(&mut self.day, day)
    }

    /// A configured acquisition slot fired.
    pub fn on_slot(&mut self, tag: &str) -> Commands {
        if !self.slot_tags.contains(tag) {
            debug!(tag, "Ignoring slot with unknown tag");
            return Ok(Vec::new());
        }
        if let Some(flight) = self.in_flight {
            debug!(tag, stage = %flight.stage, "Slot fired while a stage is in flight");
            return Ok(Vec::new());
        }

        match self.day.stage {
            Stage::Idle => {
                info!(date = %self.day.date, tag, "Slot fired, starting acquisition");
                self.enter(StageKind::Acquiring)
            }
            Stage::AwaitingThreshold if !self.monitor.is_met(self.day.units_acquired) => {
                info!(
                    date = %self.day.date,
                    tag,
                    units = self.day.units_acquired,
                    needed = self.monitor.units_needed(self.day.units_acquired),
                    "Slot fired below threshold, acquiring more"
                );
                self.enter(StageKind::Acquiring)
            }
            Stage::AwaitingThreshold => self.check_threshold(),
            stage => {
                debug!(tag, %stage, "Slot has no effect in current stage");
                Ok(Vec::new())
            }
        }
    }

    /// A worker reported the outcome of a dispatch.
    pub fn on_stage_result(&mut self, report: StageReport) -> Commands {
        if !self.take_in_flight(report.attempt) {
            debug!(
                attempt = %report.attempt,
                stage = %report.stage,
                "Discarding stale stage result"
            );
            return Ok(Vec::new());
        }

        let output = match report.outcome {
            Ok(output) => output,
            Err(failure) => return self.fail(report.stage, failure),
        };

        if output.stage() != report.stage {
            return Err(TransitionError::UnexpectedOutput {
                expected: report.stage,
                actual: output.stage(),
            });
        }

        match output {
            StageOutput::Acquired(count) => {
                self.day.add_units(count);
                info!(
                    date = %self.day.date,
                    acquired = count,
                    units = self.day.units_acquired,
                    threshold = self.monitor.threshold(),
                    "Acquisition finished"
                );
                self.transition(Stage::AwaitingThreshold)?;
                let mut commands = vec![self.persist()];
                commands.extend(self.check_threshold()?);
                Ok(commands)
            }
            StageOutput::Transformed(artifact) => {
                if !self.day.set_transform_artifact(artifact) {
                    warn!(date = %self.day.date, "Transform artifact already recorded, ignoring result");
                    return Ok(Vec::new());
                }
                self.enter(StageKind::Uploading)
            }
            StageOutput::Uploaded => {
                self.day.upload_completed = true;
                self.enter(StageKind::ReportGenerating)
            }
            StageOutput::Reported(artifact) => {
                self.day.set_report_artifact(artifact);
                self.enter(StageKind::Notifying)
            }
            StageOutput::Notified { sent, failed } => {
                self.day.notifications_sent.extend(sent);
                if failed.is_empty() {
                    self.transition(Stage::Done)?;
                    info!(date = %self.day.date, "Pipeline day complete");
                    return Ok(vec![self.persist()]);
                }
                let message = failed
                    .iter()
                    .map(|(kind, err)| format!("{}: {}", kind, err))
                    .collect::<Vec<_>>()
                    .join("; ");
                self.fail(StageKind::Notifying, StageFailure::Adapter(message))
            }
        }
    }

    /// A worker's stage timeout elapsed before the adapter returned.
    pub fn on_timeout(&mut self, attempt: Uuid, stage: StageKind, after: Duration) -> Commands {
        if !self.take_in_flight(attempt) {
            debug!(attempt = %attempt, %stage, "Discarding stale timeout");
            return Ok(Vec::new());
        }
        self.fail(stage, StageFailure::Timeout(after))
    }

    /// A scheduled retry is due.
    pub fn on_retry_due(&mut self, attempt: Uuid) -> Commands {
        if self.pending_retry != Some(attempt) {
            debug!(attempt = %attempt, "Discarding stale retry");
            return Ok(Vec::new());
        }
        self.pending_retry = None;

        match self.day.stage {
            Stage::Failed {
                stage,
                halted: false,
            } => {
                info!(
                    date = %self.day.date,
                    %stage,
                    retry = self.day.retry_count(stage),
                    "Retrying stage"
                );
                self.enter(stage)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Periodic health check at local time `now`.
    pub fn on_health_check(&mut self, now: NaiveTime) -> Commands {
        if self.day.is_halted() {
            error!(
                date = %self.day.date,
                stage = %self.day.stage,
                last_error = self.day.last_error.as_deref().unwrap_or(""),
                "Pipeline day is halted and needs operator attention"
            );
            return Ok(Vec::new());
        }
        if self.in_flight.is_some() {
            return Ok(Vec::new());
        }

        match self.day.stage {
            Stage::Notifying => {
                info!(date = %self.day.date, "Retrying pending notifications");
                self.dispatch(StageKind::Notifying)
            }
            Stage::Idle if self.slot_missed(now) => {
                info!(
                    date = %self.day.date,
                    time = %now.format("%H:%M"),
                    "Acquisition slot missed, catching up"
                );
                self.enter(StageKind::Acquiring)
            }
            Stage::AwaitingThreshold
                if !self.monitor.is_met(self.day.units_acquired) && self.in_catch_up_window(now) =>
            {
                info!(
                    date = %self.day.date,
                    units = self.day.units_acquired,
                    needed = self.monitor.units_needed(self.day.units_acquired),
                    "Below threshold inside catch-up window, acquiring"
                );
                self.enter(StageKind::Acquiring)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Operator request to run `stage` now.
    ///
    /// Accepted when nothing is in flight and `stage` is the current stage,
    /// the failed stage (its retry count is cleared), or `Acquiring` while
    /// idle or awaiting the threshold.
    pub fn manual_trigger(&mut self, stage: StageKind) -> Commands {
        if let Some(flight) = self.in_flight {
            return Err(TransitionError::Rejected {
                stage,
                reason: format!("{} is in flight", flight.stage),
            });
        }
        if stage == StageKind::Transforming && self.day.transform_artifact_ref.is_some() {
            return Err(TransitionError::Rejected {
                stage,
                reason: "transform artifact already recorded".to_string(),
            });
        }

        match self.day.stage {
            Stage::Failed { stage: failed, .. } if failed == stage => {
                self.day.retry_counts.remove(&stage);
                self.pending_retry = None;
                info!(date = %self.day.date, %stage, "Manual retry of failed stage");
                self.enter(stage)
            }
            Stage::Idle | Stage::AwaitingThreshold if stage == StageKind::Acquiring => {
                info!(date = %self.day.date, "Manual acquisition");
                self.enter(stage)
            }
            current if current.kind() == Some(stage) && !matches!(current, Stage::Failed { .. }) => {
                info!(date = %self.day.date, %stage, "Manual re-dispatch of current stage");
                self.dispatch(stage)
            }
            current => Err(TransitionError::Rejected {
                stage,
                reason: format!("day is in {}", current),
            }),
        }
    }

    /// Re-issue work for a day loaded from a checkpoint, at local time `now`.
    ///
    /// An idle day whose first slot has already passed starts acquiring
    /// right away when `now` is inside the catch-up window.
    pub fn resume(&mut self, now: NaiveTime) -> Commands {
        match self.day.stage {
            Stage::Idle if self.slot_missed(now) => {
                info!(
                    date = %self.day.date,
                    time = %now.format("%H:%M"),
                    "Started after a missed slot, acquiring now"
                );
                self.enter(StageKind::Acquiring)
            }
            Stage::Acquiring
            | Stage::Transforming
            | Stage::Uploading
            | Stage::ReportGenerating
            | Stage::Notifying => {
                let stage = self.day.stage.kind().ok_or(TransitionError::Illegal {
                    from: self.day.stage,
                    to: self.day.stage,
                })?;
                info!(date = %self.day.date, %stage, "Resuming in-flight stage");
                self.dispatch(stage)
            }
            Stage::AwaitingThreshold => self.check_threshold(),
            Stage::Failed {
                stage,
                halted: false,
            } => {
                info!(date = %self.day.date, %stage, "Resuming pending retry");
                Ok(vec![self.schedule_retry(stage)])
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Advance to Transforming once the threshold is met, at most once a day.
    fn check_threshold(&mut self) -> Commands {
        if self.day.stage != Stage::AwaitingThreshold
            || self.day.threshold_met
            || !self.monitor.is_met(self.day.units_acquired)
        {
            return Ok(Vec::new());
        }

        self.day.threshold_met = true;
        info!(
            date = %self.day.date,
            units = self.day.units_acquired,
            threshold = self.monitor.threshold(),
            "Threshold met"
        );
        self.enter(StageKind::Transforming)
    }

    /// Move into `stage` and dispatch its adapter.
    fn enter(&mut self, stage: StageKind) -> Commands {
        let target = stage.stage();
        if self.day.stage != target {
            self.transition(target)?;
        }
        self.dispatch(stage)
    }

    /// Emit persist + dispatch for the stage the day is currently in.
    fn dispatch(&mut self, stage: StageKind) -> Commands {
        let input = match stage {
            StageKind::Acquiring => {
                self.day.acquisition_attempts += 1;
                JobInput::Acquire
            }
            StageKind::Transforming => {
                if self.day.transform_artifact_ref.is_some() {
                    debug!(date = %self.day.date, "Transform already done, advancing");
                    return self.enter(StageKind::Uploading);
                }
                JobInput::Transform(UnitsRef {
                    date: self.day.date,
                    units: self.day.units_acquired,
                })
            }
            StageKind::Uploading => JobInput::Upload(self.artifact(stage)?),
            StageKind::ReportGenerating => JobInput::GenerateReport(self.artifact(stage)?),
            StageKind::Notifying => {
                let kinds: Vec<String> = self
                    .required_notifications
                    .iter()
                    .filter(|kind| !self.day.notifications_sent.contains(*kind))
                    .cloned()
                    .collect();
                if kinds.is_empty() {
                    self.transition(Stage::Done)?;
                    return Ok(vec![self.persist()]);
                }
                JobInput::Notify {
                    kinds,
                    payload: self.report_payload(),
                }
            }
        };

        let job = StageJob {
            attempt: Uuid::new_v4(),
            date: self.day.date,
            input,
        };
        self.in_flight = Some(InFlight {
            attempt: job.attempt,
            stage,
        });
        self.pending_retry = None;
        self.day.touch();

        debug!(date = %self.day.date, %stage, attempt = %job.attempt, "Dispatching stage");
        Ok(vec![self.persist(), Command::Dispatch(job)])
    }

    /// Record a failure of `stage` and decide between retry and halt.
    fn fail(&mut self, stage: StageKind, failure: StageFailure) -> Commands {
        let count = self.day.bump_retry(stage);
        self.day.last_error = Some(format!("{}: {}", stage, failure));
        let alert = Alert::new(
            failure.alert_kind(),
            self.day.date,
            format!("{} failed (attempt {}): {}", stage, count, failure),
        )
        .with_stage(stage);

        warn!(
            date = %self.day.date,
            %stage,
            retry = count,
            limit = self.policy.limit,
            error = %failure,
            "Stage failed"
        );

        if stage == StageKind::Notifying {
            if self.policy.is_exhausted(count) {
                error!(
                    date = %self.day.date,
                    "Notifications still failing after retry limit, closing the day"
                );
                self.transition(Stage::Done)?;
            }
            return Ok(vec![self.persist(), Command::Alert(alert)]);
        }

        let halted = self.policy.is_exhausted(count);
        self.transition(Stage::Failed { stage, halted })?;
        let mut commands = vec![self.persist(), Command::Alert(alert)];

        if halted {
            error!(date = %self.day.date, %stage, retry = count, "Retry limit reached, halting day");
            commands.push(Command::Alert(
                Alert::new(
                    AlertKind::RetryExhausted,
                    self.day.date,
                    format!("{} failed {} times, day halted: {}", stage, count, failure),
                )
                .with_stage(stage),
            ));
        } else {
            commands.push(self.schedule_retry(stage));
        }
        Ok(commands)
    }

    fn schedule_retry(&mut self, stage: StageKind) -> Command {
        let attempt = Uuid::new_v4();
        let delay = self.policy.delay(self.day.retry_count(stage));
        self.pending_retry = Some(attempt);
        Command::ScheduleRetry {
            stage,
            attempt,
            delay,
        }
    }

    fn transition(&mut self, to: Stage) -> Result<(), TransitionError> {
        let from = self.day.stage;
        if !from.can_transition(to) {
            return Err(TransitionError::Illegal { from, to });
        }
        self.day.stage = to;
        self.day.touch();
        info!(date = %self.day.date, %from, %to, "Stage transition");
        Ok(())
    }

    fn in_catch_up_window(&self, now: NaiveTime) -> bool {
        self.catch_up_window
            .is_some_and(|window| window.contains(now))
    }

    /// A slot time has passed and catch-up is allowed at `now`.
    fn slot_missed(&self, now: NaiveTime) -> bool {
        self.in_catch_up_window(now) && self.slot_times.iter().any(|slot| *slot <= now)
    }

    fn take_in_flight(&mut self, attempt: Uuid) -> bool {
        match self.in_flight {
            Some(flight) if flight.attempt == attempt => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    fn artifact(&self, stage: StageKind) -> Result<String, TransitionError> {
        self.day
            .transform_artifact_ref
            .clone()
            .ok_or(TransitionError::MissingArtifact { stage })
    }

    fn persist(&self) -> Command {
        Command::Persist(Box::new(self.day.clone()))
    }

    fn report_payload(&self) -> serde_json::Value {
        json!({
            "date": self.day.date.to_string(),
            "units_acquired": self.day.units_acquired,
            "transform_artifact": self.day.transform_artifact_ref,
            "report_artifact": self.day.report_artifact_ref,
            "summary": self.day.summary(),
        })
    }
}
