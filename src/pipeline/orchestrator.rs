//! Pipeline orchestrator.
//!
//! The single event loop that owns the [`PipelineDay`]. Everything that can
//! change the day arrives as a [`LoopEvent`] on one channel:
//! - clock ticks (slots, health checks, daily resets) from the trigger source
//! - stage results and timeouts from [`StageWorker`] tasks
//! - due retries from backoff timers
//! - operator triggers from [`OrchestratorHandle`] or the control inbox
//!
//! Each event is fed to the [`StageMachine`] and the resulting commands are
//! executed in order. A persist that fails stops the loop with a fatal
//! [`OrchestratorError::Persistence`] before anything after it runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::Adapters;
use crate::error::OrchestratorError;
use crate::metrics::{export_metrics, MetricsCollector};
use crate::recovery::{Checkpoint, CheckpointStore, CrashCounters, Recovered};
use crate::scheduler::clock::{ClockEvent, TimeSource, TriggerSource};
use crate::scheduler::tasks::{Claim, StageTasks};
use crate::scheduler::worker::StageWorker;
use crate::storage::{write_atomic, ControlInbox};

use super::config::PipelineConfig;
use super::day::{PipelineDay, Stage, StageKind};
use super::machine::{Alert, AlertKind, Command, StageMachine, StageReport, TransitionError};
use super::reset::DailyResetController;

/// Capacity of the event channel.
const EVENT_BUFFER: usize = 256;

/// Input to the event loop.
#[derive(Debug)]
pub enum LoopEvent {
    Clock(ClockEvent),
    StageResult(StageReport),
    /// The stage timeout elapsed; the adapter may still report later.
    StageTimedOut {
        attempt: Uuid,
        stage: StageKind,
        after: Duration,
    },
    RetryDue {
        attempt: Uuid,
    },
    Control(ControlRequest),
    Shutdown,
}

/// Operator request.
#[derive(Debug)]
pub enum ControlRequest {
    /// Run `stage` now. The answer goes to `reply` when present.
    Trigger {
        stage: StageKind,
        reply: Option<oneshot::Sender<Result<(), TransitionError>>>,
    },
}

/// Snapshot published after every processed event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub day: PipelineDay,
    pub in_flight: Option<StageKind>,
    pub units_needed: u32,
    pub crash: CrashCounters,
}

/// Cloneable handle for talking to a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    events: mpsc::Sender<LoopEvent>,
    status: watch::Receiver<PipelineStatus>,
}

impl OrchestratorHandle {
    /// Latest published status.
    pub fn status(&self) -> PipelineStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status update.
    pub fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.status.clone()
    }

    /// Asks the loop to run `stage` now and waits for its answer.
    pub async fn trigger(&self, stage: StageKind) -> Result<(), TransitionError> {
        let (reply, answer) = oneshot::channel();
        let not_running = || TransitionError::Rejected {
            stage,
            reason: "orchestrator is not running".to_string(),
        };

        self.events
            .send(LoopEvent::Control(ControlRequest::Trigger {
                stage,
                reply: Some(reply),
            }))
            .await
            .map_err(|_| not_running())?;
        answer.await.map_err(|_| not_running())?
    }

    /// Injects an event, as the clock and workers do.
    pub async fn send(&self, event: LoopEvent) -> Result<(), OrchestratorError> {
        self.events
            .send(event)
            .await
            .map_err(|_| OrchestratorError::ChannelClosed)
    }

    /// Asks the loop to stop after the current event.
    pub async fn shutdown(&self) {
        if self.events.send(LoopEvent::Shutdown).await.is_err() {
            debug!("Orchestrator already stopped");
        }
    }
}

/// Aborts background tasks when the loop exits, whatever the reason.
struct TaskGuard(Vec<JoinHandle<()>>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// The single writer of pipeline state.
pub struct Orchestrator {
    config: PipelineConfig,
    machine: StageMachine,
    crash: CrashCounters,
    store: Arc<dyn CheckpointStore>,
    reset: DailyResetController,
    worker: StageWorker,
    time: Arc<dyn TimeSource>,
    metrics: MetricsCollector,
    events_tx: mpsc::Sender<LoopEvent>,
    events_rx: mpsc::Receiver<LoopEvent>,
    status_tx: watch::Sender<PipelineStatus>,
    startup_alerts: Vec<Alert>,
    last_persisted: Stage,
    clock_enabled: bool,
}

impl Orchestrator {
    /// Builds a loop around a recovered day.
    pub fn new(
        config: PipelineConfig,
        adapters: Adapters,
        store: Arc<dyn CheckpointStore>,
        time: Arc<dyn TimeSource>,
        recovered: Recovered,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let machine = StageMachine::new(recovered.day, &config);
        let last_persisted = machine.day().stage;
        let (status_tx, _) = watch::channel(status_of(&machine, recovered.crash));
        let tasks = StageTasks::new();
        tasks.attach(events_tx.clone());

        Self {
            reset: DailyResetController::from_config(&config),
            worker: StageWorker::with_tasks(adapters, tasks),
            config,
            machine,
            crash: recovered.crash,
            store,
            time,
            metrics: MetricsCollector::new(),
            events_tx,
            events_rx,
            status_tx,
            startup_alerts: recovered.alerts,
            last_persisted,
            clock_enabled: true,
        }
    }

    /// Shares `tasks` with earlier loops of this process. A call one of
    /// them left running is taken over on start instead of dispatched again.
    pub fn with_stage_tasks(mut self, tasks: StageTasks) -> Self {
        tasks.attach(self.events_tx.clone());
        self.worker = StageWorker::with_tasks(self.worker.adapters().clone(), tasks);
        self
    }

    /// Disables the built-in trigger source and control inbox poller.
    /// Clock events then have to be injected through the handle.
    pub fn without_clock(mut self) -> Self {
        self.clock_enabled = false;
        self
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            events: self.events_tx.clone(),
            status: self.status_tx.subscribe(),
        }
    }

    pub fn day(&self) -> &PipelineDay {
        self.machine.day()
    }

    /// Runs until shutdown or a fault.
    ///
    /// # Errors
    ///
    /// Returns the fault that stopped the loop. Persistence failures are
    /// fatal, see [`OrchestratorError::is_fatal`].
    pub async fn run(mut self) -> Result<(), OrchestratorError> {
        let _tasks = if self.clock_enabled {
            TaskGuard(vec![self.spawn_clock(), self.spawn_control_poller()])
        } else {
            TaskGuard(Vec::new())
        };

        self.start().await?;

        while let Some(event) = self.events_rx.recv().await {
            if matches!(event, LoopEvent::Shutdown) {
                info!(date = %self.machine.day().date, stage = %self.machine.day().stage, "Orchestrator shutting down");
                return Ok(());
            }
            self.process(event).await?;
        }

        Err(OrchestratorError::ChannelClosed)
    }

    /// Sends recovery alerts and re-issues work for the recovered day.
    async fn start(&mut self) -> Result<(), OrchestratorError> {
        info!(
            date = %self.machine.day().date,
            stage = %self.machine.day().stage,
            units = self.machine.day().units_acquired,
            crash_count = self.crash.crash_count,
            "Orchestrator started"
        );

        for alert in std::mem::take(&mut self.startup_alerts) {
            self.execute(vec![Command::Alert(alert)]).await?;
        }
        if !self.adopt_running_stage().await? {
            let commands = self.machine.resume(self.time.now().time())?;
            self.execute(commands).await?;
        }
        self.metrics.record_day(self.machine.day());
        self.publish();
        Ok(())
    }

    /// Takes over the adapter call for the current stage if an earlier loop
    /// left one running. Returns false when the stage must be dispatched.
    async fn adopt_running_stage(&mut self) -> Result<bool, OrchestratorError> {
        let day = self.machine.day();
        let Some(stage) = day.stage.kind().filter(|kind| kind.stage() == day.stage) else {
            return Ok(false);
        };
        let date = day.date;

        match self.worker.tasks().claim(date, stage) {
            None => Ok(false),
            Some(Claim::Running(attempt)) => {
                let adopted = self.machine.adopt(attempt, stage);
                if adopted {
                    info!(
                        %date,
                        %stage,
                        attempt = %attempt,
                        "Adapter call from before the restart is still running, waiting for it"
                    );
                }
                Ok(adopted)
            }
            Some(Claim::Finished(report)) => {
                if !self.machine.adopt(report.attempt, stage) {
                    return Ok(false);
                }
                info!(
                    %date,
                    %stage,
                    attempt = %report.attempt,
                    "Adapter call finished during the restart, applying its result"
                );
                self.events_tx
                    .send(LoopEvent::StageResult(report))
                    .await
                    .map_err(|_| OrchestratorError::ChannelClosed)?;
                Ok(true)
            }
        }
    }

    /// Applies one event to the machine and executes the resulting commands.
    pub async fn process(&mut self, event: LoopEvent) -> Result<(), OrchestratorError> {
        let result = match event {
            LoopEvent::Clock(ClockEvent::Slot { tag }) => self.machine.on_slot(&tag),
            LoopEvent::Clock(ClockEvent::HealthCheck) => {
                self.health_check().await?;
                Ok(Vec::new())
            }
            LoopEvent::Clock(ClockEvent::DailyReset { date }) => {
                self.daily_reset(date).await?;
                Ok(Vec::new())
            }
            LoopEvent::StageResult(report) => {
                self.worker.tasks().finish(report.attempt);
                if self
                    .machine
                    .in_flight()
                    .is_some_and(|flight| flight.attempt == report.attempt)
                {
                    self.metrics
                        .record_stage_duration(report.stage, report.duration);
                }
                self.machine.on_stage_result(report)
            }
            LoopEvent::StageTimedOut {
                attempt,
                stage,
                after,
            } => self.machine.on_timeout(attempt, stage, after),
            LoopEvent::RetryDue { attempt } => self.machine.on_retry_due(attempt),
            LoopEvent::Control(ControlRequest::Trigger { stage, reply }) => {
                let result = self.machine.manual_trigger(stage);
                let answer = result.as_ref().map(|_| ()).map_err(Clone::clone);
                if let Err(ref e) = answer {
                    if e.is_rejection() {
                        warn!(%stage, error = %e, "Manual trigger rejected");
                    }
                }
                if let Some(reply) = reply {
                    let _ = reply.send(answer);
                }
                match result {
                    Err(e) if e.is_rejection() => Ok(Vec::new()),
                    other => other,
                }
            }
            LoopEvent::Shutdown => Ok(Vec::new()),
        };

        let commands = result.map_err(|e| {
            error!(error = %e, day = %self.machine.day().summary(), "State machine fault");
            e
        })?;
        self.execute(commands).await?;
        self.publish();
        Ok(())
    }

    /// Executes commands in order, stopping at the first failed persist.
    async fn execute(&mut self, commands: Vec<Command>) -> Result<(), OrchestratorError> {
        for command in commands {
            match command {
                Command::Persist(day) => self.persist(*day).await?,
                Command::Dispatch(job) => {
                    let timeout = self.config.stage_timeout(job.stage());
                    self.worker.spawn(job, timeout);
                }
                Command::ScheduleRetry {
                    stage,
                    attempt,
                    delay,
                } => {
                    info!(%stage, delay_secs = delay.as_secs(), "Retry scheduled");
                    let events = self.events_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = events.send(LoopEvent::RetryDue { attempt }).await;
                    });
                }
                Command::Alert(alert) => {
                    if let Some(stage) = alert.stage {
                        match alert.kind {
                            AlertKind::StageFailure => self.metrics.record_failure(stage, "adapter"),
                            AlertKind::StageTimeout => self.metrics.record_failure(stage, "timeout"),
                            _ => {}
                        }
                    }
                    self.worker.alert(alert);
                }
            }
        }
        Ok(())
    }

    async fn persist(&mut self, day: PipelineDay) -> Result<(), OrchestratorError> {
        let stage = day.stage;
        let checkpoint = Checkpoint::new(day, self.crash);
        if let Err(e) = self.store.save(&checkpoint).await {
            error!(
                date = %checkpoint.day.date,
                %stage,
                error = %e,
                "Checkpoint write failed"
            );
            return Err(e.into());
        }
        if stage != self.last_persisted {
            self.metrics.record_transition(&stage);
            self.last_persisted = stage;
        }
        Ok(())
    }

    async fn health_check(&mut self) -> Result<(), OrchestratorError> {
        let now = self.time.now();
        let day = self.machine.day();
        info!(
            date = %day.date,
            stage = %day.stage,
            units = day.units_acquired,
            needed = self.machine.monitor().units_needed(day.units_acquired),
            in_flight = self.machine.in_flight().map(|f| f.stage.as_str()).unwrap_or("none"),
            "Health check"
        );

        let commands = self.machine.on_health_check(now.time())?;
        self.execute(commands).await?;

        self.metrics.record_day(self.machine.day());
        if let Err(e) = write_atomic(&self.config.metrics_path(), export_metrics().as_bytes()).await {
            warn!(error = %e, "Failed to write metrics file");
        }
        Ok(())
    }

    async fn daily_reset(&mut self, date: NaiveDate) -> Result<(), OrchestratorError> {
        let current = self.machine.day().date;
        if date <= current {
            warn!(%date, %current, "Daily reset for a date that is not newer, ignoring");
            return Ok(());
        }

        info!(previous = %current, %date, stage = %self.machine.day().stage, "Daily reset");
        let rollover = self.reset.roll_over(self.machine.day(), date).await?;
        debug!(path = %rollover.archived.display(), "Previous day archived");

        self.crash.reset();
        // Anything still in flight for the previous day reports as stale.
        self.machine.replace_day(rollover.day);

        let mut commands = vec![Command::Persist(Box::new(self.machine.day().clone()))];
        commands.extend(rollover.alerts.into_iter().map(Command::Alert));
        self.execute(commands).await
    }

    fn publish(&self) {
        self.status_tx
            .send_replace(status_of(&self.machine, self.crash));
    }

    fn spawn_clock(&self) -> JoinHandle<()> {
        let mut source = TriggerSource::new(&self.config, self.time.clone());
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                let event = source.next_event().await;
                if events.send(LoopEvent::Clock(event)).await.is_err() {
                    break;
                }
            }
        })
    }

    fn spawn_control_poller(&self) -> JoinHandle<()> {
        let inbox = ControlInbox::new(self.config.control_dir());
        let interval = self.config.control_poll_interval().max(Duration::from_millis(100));
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let requests = match inbox.drain().await {
                    Ok(requests) => requests,
                    Err(e) => {
                        warn!(dir = %inbox.dir().display(), error = %e, "Failed to read control inbox");
                        continue;
                    }
                };
                for request in requests {
                    info!(stage = %request.stage, id = %request.id, "Control request received");
                    let event = LoopEvent::Control(ControlRequest::Trigger {
                        stage: request.stage,
                        reply: None,
                    });
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        })
    }
}

fn status_of(machine: &StageMachine, crash: CrashCounters) -> PipelineStatus {
    let day = machine.day().clone();
    PipelineStatus {
        units_needed: machine.monitor().units_needed(day.units_acquired),
        in_flight: machine.in_flight().map(|flight| flight.stage),
        day,
        crash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{NaiveDateTime, NaiveTime};
    use tempfile::TempDir;

    use crate::adapters::{
        AdapterError, Acquirer, Notifier, ReportGenerator, Transformer, UnitsRef, Uploader,
    };
    use crate::recovery::{FileCheckpointStore, RecoveryManager};
    use crate::scheduler::clock::SimulatedTimeSource;

    #[derive(Default)]
    struct Script {
        acquisitions: Mutex<Vec<u32>>,
        transforms: AtomicUsize,
        uploads: AtomicUsize,
        notifications: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Acquirer for Script {
        async fn acquire(&self) -> Result<u32, AdapterError> {
            let mut queue = self.acquisitions.lock().unwrap();
            if queue.is_empty() {
                Ok(0)
            } else {
                Ok(queue.remove(0))
            }
        }
    }

    #[async_trait]
    impl Transformer for Script {
        async fn transform(&self, units: &UnitsRef) -> Result<String, AdapterError> {
            self.transforms.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}-{}.xlsx", units.date, units.units))
        }
    }

    #[async_trait]
    impl Uploader for Script {
        async fn upload(&self, _artifact: &str) -> Result<(), AdapterError> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl ReportGenerator for Script {
        async fn generate_report(&self, artifact: &str) -> Result<String, AdapterError> {
            Ok(format!("{}.pdf", artifact))
        }
    }

    #[async_trait]
    impl Notifier for Script {
        async fn notify(&self, kind: &str, _payload: &serde_json::Value) -> Result<(), AdapterError> {
            self.notifications.lock().unwrap().push(kind.to_string());
            Ok(())
        }
    }

    fn start_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 7, 5)
            .unwrap()
            .and_time(NaiveTime::from_hms_opt(8, 0, 0).unwrap())
    }

    async fn orchestrator(
        dir: &TempDir,
        script: Arc<Script>,
    ) -> (Orchestrator, Arc<FileCheckpointStore>) {
        let config = PipelineConfig::default()
            .with_state_dir(dir.path())
            .with_catch_up_window(None);
        let store = Arc::new(FileCheckpointStore::new(config.checkpoint_path()));
        let recovered = RecoveryManager::new(config.clone(), store.clone())
            .recover(start_time())
            .await
            .unwrap();
        let adapters = Adapters::new(
            script.clone(),
            script.clone(),
            script.clone(),
            script.clone(),
            script,
        );
        let time = Arc::new(SimulatedTimeSource::starting_at(start_time()));
        let orchestrator =
            Orchestrator::new(config, adapters, store.clone(), time, recovered).without_clock();
        (orchestrator, store)
    }

    async fn wait_for(
        status: &mut watch::Receiver<PipelineStatus>,
        done: impl Fn(&PipelineStatus) -> bool,
    ) -> PipelineStatus {
        loop {
            {
                let current = status.borrow_and_update();
                if done(&current) {
                    return current.clone();
                }
            }
            status.changed().await.unwrap();
        }
    }

    fn slot(tag: &str) -> LoopEvent {
        LoopEvent::Clock(ClockEvent::Slot {
            tag: tag.to_string(),
        })
    }

    #[tokio::test]
    async fn test_slots_drive_day_to_done() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default());
        script.acquisitions.lock().unwrap().extend([4, 4]);
        let (orchestrator, store) = orchestrator(&dir, script.clone()).await;
        let handle = orchestrator.handle();
        let mut status = handle.subscribe();
        let task = tokio::spawn(orchestrator.run());

        handle.send(slot("primary")).await.unwrap();
        wait_for(&mut status, |s| {
            s.day.stage == Stage::AwaitingThreshold && s.in_flight.is_none()
        })
        .await;

        handle.send(slot("backup")).await.unwrap();
        let done = wait_for(&mut status, |s| s.day.stage == Stage::Done).await;
        assert_eq!(done.day.units_acquired, 8);
        assert!(done.day.threshold_met);
        assert_eq!(done.day.transform_artifact_ref.as_deref(), Some("2024-07-05-8.xlsx"));
        assert_eq!(script.transforms.load(Ordering::SeqCst), 1);
        assert_eq!(script.uploads.load(Ordering::SeqCst), 1);
        assert!(script
            .notifications
            .lock()
            .unwrap()
            .contains(&"daily_report".to_string()));

        handle.shutdown().await;
        task.await.unwrap().unwrap();

        let checkpoint = store.load().await.unwrap().unwrap();
        assert_eq!(checkpoint.day.stage, Stage::Done);
    }

    #[tokio::test]
    async fn test_trigger_answers_rejection() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, _) = orchestrator(&dir, Arc::new(Script::default())).await;
        let handle = orchestrator.handle();
        let task = tokio::spawn(orchestrator.run());

        let err = handle.trigger(StageKind::Uploading).await.unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(handle.status().day.stage, Stage::Idle);

        handle.trigger(StageKind::Acquiring).await.unwrap();

        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_daily_reset_archives_and_starts_new_day() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default());
        script.acquisitions.lock().unwrap().push(3);
        let (orchestrator, store) = orchestrator(&dir, script).await;
        let handle = orchestrator.handle();
        let mut status = handle.subscribe();
        let task = tokio::spawn(orchestrator.run());

        handle.send(slot("primary")).await.unwrap();
        wait_for(&mut status, |s| {
            s.day.stage == Stage::AwaitingThreshold && s.in_flight.is_none()
        })
        .await;

        let next = NaiveDate::from_ymd_opt(2024, 7, 6).unwrap();
        handle
            .send(LoopEvent::Clock(ClockEvent::DailyReset { date: next }))
            .await
            .unwrap();
        let fresh = wait_for(&mut status, |s| s.day.date == next).await;
        assert_eq!(fresh.day.stage, Stage::Idle);
        assert_eq!(fresh.day.units_acquired, 0);

        // A repeated reset for the same date is ignored.
        handle
            .send(LoopEvent::Clock(ClockEvent::DailyReset { date: next }))
            .await
            .unwrap();

        handle.shutdown().await;
        task.await.unwrap().unwrap();

        let archived = crate::storage::DayArchive::new(dir.path().join("archive"))
            .load(NaiveDate::from_ymd_opt(2024, 7, 5).unwrap())
            .await
            .unwrap();
        assert_eq!(archived.units_acquired, 3);
        assert_eq!(store.load().await.unwrap().unwrap().day.date, next);
    }

    #[tokio::test]
    async fn test_health_check_writes_metrics_file() {
        crate::metrics::init_metrics().unwrap();
        let dir = TempDir::new().unwrap();
        let (orchestrator, _) = orchestrator(&dir, Arc::new(Script::default())).await;
        let handle = orchestrator.handle();
        let task = tokio::spawn(orchestrator.run());

        handle
            .send(LoopEvent::Clock(ClockEvent::HealthCheck))
            .await
            .unwrap();
        handle.shutdown().await;
        task.await.unwrap().unwrap();

        let text = std::fs::read_to_string(dir.path().join("metrics.prom")).unwrap();
        assert!(text.contains("dayforge_units_acquired"));
    }
}
