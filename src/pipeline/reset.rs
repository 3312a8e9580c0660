//! Daily reset controller.
//!
//! The only place a [`PipelineDay`] is created: on first-ever startup, when
//! recovery finds a checkpoint from an earlier date, and at every daily
//! reset boundary.

use std::path::PathBuf;

use chrono::NaiveDate;
use tracing::{info, warn};

use super::config::PipelineConfig;
use super::day::{PipelineDay, Stage};
use super::machine::{Alert, AlertKind};
use crate::storage::{ArchiveError, DayArchive};

/// Result of closing one day and opening the next.
#[derive(Debug, Clone)]
pub struct Rollover {
    pub day: PipelineDay,
    pub archived: PathBuf,
    /// `partial_day` alert when the previous day did not finish.
    pub alerts: Vec<Alert>,
}

/// Archives finished days and starts new ones.
#[derive(Debug, Clone)]
pub struct DailyResetController {
    archive: DayArchive,
    retention_days: u32,
}

impl DailyResetController {
    pub fn new(archive: DayArchive, retention_days: u32) -> Self {
        Self {
            archive,
            retention_days,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            DayArchive::new(config.archive_dir()),
            config.archive_retention_days,
        )
    }

    pub fn archive(&self) -> &DayArchive {
        &self.archive
    }

    /// Opens an idle day for `date` with nothing to archive.
    pub fn start_day(&self, date: NaiveDate) -> PipelineDay {
        info!(%date, "Starting new pipeline day");
        PipelineDay::new(date)
    }

    /// Archives `previous` in whatever state it reached and opens `date`.
    ///
    /// Archive pruning failures are logged and do not fail the rollover.
    pub async fn roll_over(
        &self,
        previous: &PipelineDay,
        date: NaiveDate,
    ) -> Result<Rollover, ArchiveError> {
        let archived = self.archive.archive(previous).await?;

        let mut alerts = Vec::new();
        if previous.stage != Stage::Done {
            let outcome = if previous.is_halted() {
                "halted"
            } else {
                "incomplete"
            };
            warn!(
                date = %previous.date,
                stage = %previous.stage,
                units = previous.units_acquired,
                "Pipeline day ended {}", outcome
            );
            alerts.push(Alert::new(
                AlertKind::PartialDay,
                previous.date,
                format!("Day ended {}: {}", outcome, previous.summary()),
            ));
        }

        if self.retention_days > 0 {
            let cutoff = date - chrono::Duration::days(i64::from(self.retention_days));
            if let Err(e) = self.archive.prune_before(cutoff).await {
                warn!(error = %e, "Failed to prune archived days");
            }
        }

        Ok(Rollover {
            day: self.start_day(date),
            archived,
            alerts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::day::StageKind;
    use tempfile::TempDir;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, d).unwrap()
    }

    fn controller(dir: &TempDir, retention_days: u32) -> DailyResetController {
        DailyResetController::new(DayArchive::new(dir.path()), retention_days)
    }

    #[tokio::test]
    async fn test_done_day_rolls_over_quietly() {
        let dir = TempDir::new().unwrap();
        let reset = controller(&dir, 60);
        let mut previous = PipelineDay::new(date(5));
        previous.stage = Stage::Done;

        let rollover = reset.roll_over(&previous, date(6)).await.unwrap();
        assert_eq!(rollover.day.date, date(6));
        assert_eq!(rollover.day.stage, Stage::Idle);
        assert!(rollover.alerts.is_empty());
        assert_eq!(reset.archive().load(date(5)).await.unwrap().stage, Stage::Done);
    }

    #[tokio::test]
    async fn test_every_prior_state_yields_one_idle_day() {
        let dir = TempDir::new().unwrap();
        let reset = controller(&dir, 60);
        let states = [
            Stage::Idle,
            Stage::AwaitingThreshold,
            Stage::Uploading,
            Stage::Notifying,
            Stage::Failed {
                stage: StageKind::Transforming,
                halted: true,
            },
        ];

        for stage in states {
            let mut previous = PipelineDay::new(date(5));
            previous.stage = stage;
            previous.units_acquired = 3;

            let rollover = reset.roll_over(&previous, date(6)).await.unwrap();
            assert_eq!(rollover.day.stage, Stage::Idle);
            assert_eq!(rollover.day.units_acquired, 0);
            assert_eq!(rollover.alerts.len(), 1);
            assert_eq!(rollover.alerts[0].kind, AlertKind::PartialDay);
            assert_eq!(rollover.alerts[0].date, date(5));
        }
    }

    #[tokio::test]
    async fn test_halted_day_reported_as_halted() {
        let dir = TempDir::new().unwrap();
        let reset = controller(&dir, 60);
        let mut previous = PipelineDay::new(date(5));
        previous.stage = Stage::Failed {
            stage: StageKind::Uploading,
            halted: true,
        };

        let rollover = reset.roll_over(&previous, date(6)).await.unwrap();
        assert!(rollover.alerts[0].message.contains("halted"));
    }

    #[tokio::test]
    async fn test_rollover_prunes_old_archives() {
        let dir = TempDir::new().unwrap();
        let reset = controller(&dir, 2);
        for d in 1..=4 {
            let mut day = PipelineDay::new(date(d));
            day.stage = Stage::Done;
            reset.archive().archive(&day).await.unwrap();
        }

        let mut previous = PipelineDay::new(date(5));
        previous.stage = Stage::Done;
        reset.roll_over(&previous, date(6)).await.unwrap();

        assert_eq!(reset.archive().dates().await.unwrap(), vec![date(4), date(5)]);
    }
}
