//! Crash recovery.
//!
//! - [`checkpoint`]: the durable record of the current day
//! - [`crash`]: crash counting and the fail-fast ceiling
//! - [`supervisor`]: the restart loop around the orchestrator
//!
//! [`RecoveryManager::recover`] runs once per start of the event loop and
//! decides whether to resume the checkpointed day or open a new one.

pub mod checkpoint;
pub mod crash;
pub mod supervisor;

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tracing::{info, warn};

use crate::error::OrchestratorError;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::day::PipelineDay;
use crate::pipeline::machine::Alert;
use crate::pipeline::reset::DailyResetController;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, FileCheckpointStore};
pub use crash::{CrashCounters, CrashPolicy, CrashVerdict};
pub use supervisor::{Supervisor, SupervisorExit};

/// How the day in [`Recovered`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No checkpoint existed.
    FirstStart,
    /// The checkpoint belongs to the current business date.
    Resumed,
    /// The checkpoint is dated after the current business date.
    ResumedFromFuture,
    /// The checkpoint was from an earlier date and has been archived.
    StaleArchived { previous: NaiveDate },
}

/// State handed to a fresh event loop.
#[derive(Debug, Clone)]
pub struct Recovered {
    pub day: PipelineDay,
    pub crash: CrashCounters,
    pub outcome: RecoveryOutcome,
    /// Alerts to send once the loop is up.
    pub alerts: Vec<Alert>,
}

/// Loads the checkpoint at startup and decides how to continue.
pub struct RecoveryManager {
    config: PipelineConfig,
    store: Arc<dyn CheckpointStore>,
    reset: DailyResetController,
}

impl RecoveryManager {
    pub fn new(config: PipelineConfig, store: Arc<dyn CheckpointStore>) -> Self {
        let reset = DailyResetController::from_config(&config);
        Self {
            config,
            store,
            reset,
        }
    }

    /// Recovers the day for local time `now`.
    ///
    /// # Errors
    ///
    /// Fails if the checkpoint cannot be read or written, or a stale day
    /// cannot be archived.
    pub async fn recover(&self, now: NaiveDateTime) -> Result<Recovered, OrchestratorError> {
        let today = self.config.business_date(now);

        let Some(checkpoint) = self.store.load().await? else {
            info!(%today, "No checkpoint found, first start");
            let day = self.reset.start_day(today);
            let crash = CrashCounters::default();
            self.store.save(&Checkpoint::new(day.clone(), crash)).await?;
            return Ok(Recovered {
                day,
                crash,
                outcome: RecoveryOutcome::FirstStart,
                alerts: Vec::new(),
            });
        };

        let previous = checkpoint.day.date;
        if previous == today {
            info!(
                date = %previous,
                stage = %checkpoint.day.stage,
                units = checkpoint.day.units_acquired,
                crash_count = checkpoint.crash.crash_count,
                "Resuming from checkpoint"
            );
            return Ok(Recovered {
                day: checkpoint.day,
                crash: checkpoint.crash,
                outcome: RecoveryOutcome::Resumed,
                alerts: Vec::new(),
            });
        }

        if previous > today {
            warn!(
                checkpoint_date = %previous,
                %today,
                "Checkpoint is dated in the future, clock may have moved backwards; resuming it"
            );
            return Ok(Recovered {
                day: checkpoint.day,
                crash: checkpoint.crash,
                outcome: RecoveryOutcome::ResumedFromFuture,
                alerts: Vec::new(),
            });
        }

        warn!(
            checkpoint_date = %previous,
            %today,
            stage = %checkpoint.day.stage,
            "Checkpoint is stale, archiving it and starting a new day"
        );
        let rollover = self.reset.roll_over(&checkpoint.day, today).await?;
        let crash = CrashCounters::default();
        self.store
            .save(&Checkpoint::new(rollover.day.clone(), crash))
            .await?;

        Ok(Recovered {
            day: rollover.day,
            crash,
            outcome: RecoveryOutcome::StaleArchived { previous },
            alerts: rollover.alerts,
        })
    }

    /// Counts an event-loop crash in the persisted counters.
    pub async fn record_crash(
        &self,
        now: DateTime<Utc>,
        policy: &CrashPolicy,
    ) -> Result<CrashVerdict, CheckpointError> {
        match self.store.load().await? {
            Some(mut checkpoint) => {
                let verdict = checkpoint.crash.record_crash(now, policy);
                checkpoint.checkpointed_at = Utc::now();
                self.store.save(&checkpoint).await?;
                Ok(verdict)
            }
            None => Ok(CrashCounters::default().record_crash(now, policy)),
        }
    }
}
