//! Adapter calls that are still outstanding.
//!
//! Adapter tasks are not tied to one event loop. The supervisor keeps a
//! single [`StageTasks`] for the life of the process, so a loop restarted
//! after a fault can take over a call that is still running instead of
//! starting a second one against the same external system.
//!
//! Worker events go to whichever loop is attached when they are sent. A
//! result that finds no loop listening stays here until the next loop
//! claims it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::NaiveDate;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::pipeline::day::StageKind;
use crate::pipeline::machine::StageReport;
use crate::pipeline::orchestrator::LoopEvent;

/// One dispatched adapter call whose result no loop has consumed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct StageTask {
    pub attempt: Uuid,
    pub stage: StageKind,
    pub date: NaiveDate,
    /// The stage timeout fired while the call was running.
    pub timed_out: bool,
    /// Set once the adapter returned.
    pub report: Option<StageReport>,
    seq: u64,
}

/// What a newly started loop can take over for its current stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// Still running; the result arrives on the new loop's channel.
    Running(Uuid),
    /// Finished while no loop was listening.
    Finished(StageReport),
}

#[derive(Default)]
struct Table {
    events: Option<mpsc::Sender<LoopEvent>>,
    tasks: HashMap<Uuid, StageTask>,
    next_seq: u64,
}

/// Shared registry of outstanding adapter calls.
#[derive(Clone, Default)]
pub struct StageTasks {
    inner: Arc<Mutex<Table>>,
}

impl StageTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Routes worker events to `events` from now on.
    pub fn attach(&self, events: mpsc::Sender<LoopEvent>) {
        self.table().events = Some(events);
    }

    /// Channel of the currently attached loop.
    pub(crate) fn events(&self) -> Option<mpsc::Sender<LoopEvent>> {
        self.table().events.clone()
    }

    pub(crate) fn register(&self, attempt: Uuid, stage: StageKind, date: NaiveDate) {
        let mut table = self.table();
        let seq = table.next_seq;
        table.next_seq += 1;
        table.tasks.insert(
            attempt,
            StageTask {
                attempt,
                stage,
                date,
                timed_out: false,
                report: None,
                seq,
            },
        );
    }

    pub(crate) fn mark_timed_out(&self, attempt: Uuid) {
        if let Some(task) = self.table().tasks.get_mut(&attempt) {
            task.timed_out = true;
        }
    }

    pub(crate) fn record_report(&self, report: &StageReport) {
        if let Some(task) = self.table().tasks.get_mut(&report.attempt) {
            task.report = Some(report.clone());
        }
    }

    /// A loop received the result of `attempt`.
    pub fn finish(&self, attempt: Uuid) {
        self.table().tasks.remove(&attempt);
    }

    /// Outstanding calls, oldest first.
    pub fn outstanding(&self) -> Vec<StageTask> {
        let mut tasks: Vec<StageTask> = self.table().tasks.values().cloned().collect();
        tasks.sort_by_key(|task| task.seq);
        tasks
    }

    /// Claims the newest call for `stage` on `date` whose timeout has not
    /// fired. Calls for other dates are forgotten.
    pub fn claim(&self, date: NaiveDate, stage: StageKind) -> Option<Claim> {
        let mut table = self.table();
        table.tasks.retain(|_, task| task.date == date);

        let attempt = table
            .tasks
            .values()
            .filter(|task| task.stage == stage && !task.timed_out)
            .max_by_key(|task| task.seq)
            .map(|task| task.attempt)?;

        let finished = table
            .tasks
            .get(&attempt)
            .is_some_and(|task| task.report.is_some());
        if finished {
            table
                .tasks
                .remove(&attempt)
                .and_then(|task| task.report)
                .map(Claim::Finished)
        } else {
            Some(Claim::Running(attempt))
        }
    }
}
