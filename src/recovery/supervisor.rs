//! In-process restart loop around the orchestrator.
//!
//! Each pass recovers the day from the checkpoint and runs a fresh
//! [`Orchestrator`] on its own task, so a panic in the loop surfaces as a
//! `JoinError` instead of taking the process down. Non-fatal faults are
//! counted; once the crash ceiling is exceeded the supervisor gives up and
//! leaves restarting to whatever runs the process.
//!
//! Adapter calls outlive the loop that dispatched them. All passes share one
//! [`StageTasks`], so a restarted loop waits for a call that is still running
//! rather than dispatching the same stage again.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::{CheckpointStore, CrashPolicy, CrashVerdict, RecoveryManager};
use crate::adapters::Adapters;
use crate::error::OrchestratorError;
use crate::metrics::MetricsCollector;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::machine::{Alert, AlertKind};
use crate::pipeline::orchestrator::Orchestrator;
use crate::scheduler::clock::TimeSource;
use crate::scheduler::tasks::StageTasks;

/// Why the supervisor stopped.
#[derive(Debug)]
pub enum SupervisorExit {
    /// Shutdown was requested.
    Clean,
    /// Persistence, configuration or startup failure.
    Fatal(OrchestratorError),
    /// Too many crashes inside the crash window.
    CrashLoop { crash_count: u32 },
}

impl SupervisorExit {
    /// Process exit code: 0 clean, 1 fatal, 2 crash loop.
    pub fn exit_code(&self) -> u8 {
        match self {
            SupervisorExit::Clean => 0,
            SupervisorExit::Fatal(_) => 1,
            SupervisorExit::CrashLoop { .. } => 2,
        }
    }
}

/// Runs the orchestrator and restarts it after crashes.
pub struct Supervisor {
    config: PipelineConfig,
    adapters: Adapters,
    store: Arc<dyn CheckpointStore>,
    time: Arc<dyn TimeSource>,
    metrics: MetricsCollector,
}

impl Supervisor {
    pub fn new(
        config: PipelineConfig,
        adapters: Adapters,
        store: Arc<dyn CheckpointStore>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            config,
            adapters,
            store,
            time,
            metrics: MetricsCollector::new(),
        }
    }

    /// Runs until shutdown is signalled on `shutdown`, a fatal error, or a
    /// crash loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> SupervisorExit {
        let recovery = RecoveryManager::new(self.config.clone(), self.store.clone());
        let policy = CrashPolicy::from_config(&self.config);
        let tasks = StageTasks::new();

        loop {
            if *shutdown.borrow() {
                return SupervisorExit::Clean;
            }

            let recovered = match recovery.recover(self.time.now()).await {
                Ok(recovered) => recovered,
                Err(e) => {
                    error!(error = %e, "Recovery failed");
                    return SupervisorExit::Fatal(e);
                }
            };
            let date = recovered.day.date;
            info!(%date, outcome = ?recovered.outcome, "Recovered pipeline day");

            let orchestrator = Orchestrator::new(
                self.config.clone(),
                self.adapters.clone(),
                self.store.clone(),
                self.time.clone(),
                recovered,
            )
            .with_stage_tasks(tasks.clone());
            let handle = orchestrator.handle();
            let mut task = tokio::spawn(orchestrator.run());

            let joined = tokio::select! {
                joined = &mut task => joined,
                _ = shutdown_requested(&mut shutdown) => {
                    handle.shutdown().await;
                    task.await
                }
            };

            let fault = match joined {
                Ok(Ok(())) => return SupervisorExit::Clean,
                Ok(Err(e)) if e.is_fatal() => {
                    error!(error = %e, "Fatal error, exiting");
                    return SupervisorExit::Fatal(e);
                }
                Ok(Err(e)) => e,
                Err(e) => OrchestratorError::Panicked(e.to_string()),
            };

            error!(error = %fault, "Event loop crashed");
            self.metrics.record_crash();

            let verdict = match recovery.record_crash(Utc::now(), &policy).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    error!(error = %e, "Failed to record crash");
                    return SupervisorExit::Fatal(e.into());
                }
            };

            match verdict {
                CrashVerdict::FailFast { crash_count } => {
                    self.alert(crash_alert(date, crash_count, &fault)).await;
                    self.alert(Alert::new(
                        AlertKind::CrashLoop,
                        date,
                        format!(
                            "{} crashes within {}s, giving up: {}",
                            crash_count,
                            policy.window.as_secs(),
                            fault
                        ),
                    ))
                    .await;
                    error!(
                        crash_count,
                        max = policy.max_crashes,
                        "Crash loop detected, exiting for external restart"
                    );
                    return SupervisorExit::CrashLoop { crash_count };
                }
                CrashVerdict::Restart { crash_count } => {
                    self.alert(crash_alert(date, crash_count, &fault)).await;
                    let delay = self.config.restart_delay();
                    warn!(
                        crash_count,
                        delay_secs = delay.as_secs(),
                        "Restarting event loop"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_requested(&mut shutdown) => return SupervisorExit::Clean,
                    }
                }
            }
        }
    }

    async fn alert(&self, alert: Alert) {
        let kind = alert.kind.as_str();
        if let Err(e) = self.adapters.notifier.notify(kind, &alert.payload()).await {
            error!(kind, error = %e, "Failed to deliver alert");
        }
    }
}

fn crash_alert(date: NaiveDate, crash_count: u32, fault: &OrchestratorError) -> Alert {
    Alert::new(
        AlertKind::ProcessCrash,
        date,
        format!("Event loop crashed ({}): {}", crash_count, fault),
    )
}

/// Resolves once `true` is published. Never resolves if the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{NaiveDateTime, NaiveTime};
    use tempfile::TempDir;

    use crate::adapters::{
        AdapterError, Acquirer, Notifier, ReportGenerator, Transformer, UnitsRef, Uploader,
    };
    use crate::pipeline::day::{PipelineDay, Stage};
    use crate::recovery::{Checkpoint, CheckpointError, CrashCounters, FileCheckpointStore};
    use crate::scheduler::clock::SimulatedTimeSource;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl Acquirer for Recorder {
        async fn acquire(&self) -> Result<u32, AdapterError> {
            Ok(0)
        }
    }

    #[async_trait]
    impl Transformer for Recorder {
        async fn transform(&self, _units: &UnitsRef) -> Result<String, AdapterError> {
            Ok("merged.xlsx".to_string())
        }
    }

    #[async_trait]
    impl Uploader for Recorder {
        async fn upload(&self, _artifact: &str) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    #[async_trait]
    impl ReportGenerator for Recorder {
        async fn generate_report(&self, _artifact: &str) -> Result<String, AdapterError> {
            Ok("report.pdf".to_string())
        }
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, kind: &str, _payload: &serde_json::Value) -> Result<(), AdapterError> {
            self.0.lock().unwrap().push(kind.to_string());
            Ok(())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl CheckpointStore for BrokenStore {
        async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
            Ok(None)
        }

        async fn save(&self, _checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
            Err(CheckpointError::Store("read-only filesystem".to_string()))
        }
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 7, 5)
            .unwrap()
            .and_time(NaiveTime::from_hms_opt(10, 0, 0).unwrap())
    }

    fn supervisor(
        config: PipelineConfig,
        store: Arc<dyn CheckpointStore>,
        recorder: Arc<Recorder>,
    ) -> Supervisor {
        let adapters = Adapters::new(
            recorder.clone(),
            recorder.clone(),
            recorder.clone(),
            recorder.clone(),
            recorder,
        );
        Supervisor::new(
            config,
            adapters,
            store,
            Arc::new(SimulatedTimeSource::starting_at(now())),
        )
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(SupervisorExit::Clean.exit_code(), 0);
        assert_eq!(
            SupervisorExit::Fatal(OrchestratorError::ChannelClosed).exit_code(),
            1
        );
        assert_eq!(SupervisorExit::CrashLoop { crash_count: 6 }.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_fatal() {
        let (_tx, rx) = watch::channel(false);
        let exit = supervisor(
            PipelineConfig::default(),
            Arc::new(BrokenStore),
            Arc::new(Recorder::default()),
        )
        .run(rx)
        .await;

        assert_eq!(exit.exit_code(), 1);
        assert!(matches!(
            exit,
            SupervisorExit::Fatal(OrchestratorError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_clean() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::default().with_state_dir(dir.path());
        let store = Arc::new(FileCheckpointStore::new(config.checkpoint_path()));
        let (tx, rx) = watch::channel(false);

        let run = tokio::spawn(supervisor(config, store, Arc::new(Recorder::default())).run(rx));
        tx.send(true).unwrap();

        assert_eq!(run.await.unwrap().exit_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_faults_end_in_crash_loop() {
        let dir = TempDir::new().unwrap();
        let mut config = PipelineConfig::default()
            .with_state_dir(dir.path())
            .with_max_crashes(2);
        config.restart_delay_secs = 5;
        let store = Arc::new(FileCheckpointStore::new(config.checkpoint_path()));

        // Uploading without a transform artifact cannot be resumed.
        let mut day = PipelineDay::new(now().date());
        day.stage = Stage::Uploading;
        store
            .save(&Checkpoint::new(day, CrashCounters::default()))
            .await
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let (_tx, rx) = watch::channel(false);
        let exit = supervisor(config, store.clone(), recorder.clone())
            .run(rx)
            .await;

        assert!(matches!(exit, SupervisorExit::CrashLoop { crash_count: 3 }));
        assert_eq!(exit.exit_code(), 2);

        let alerts = recorder.0.lock().unwrap().clone();
        assert_eq!(
            alerts,
            vec![
                "process_crash".to_string(),
                "process_crash".to_string(),
                "process_crash".to_string(),
                "crash_loop".to_string(),
            ]
        );
        assert_eq!(store.load().await.unwrap().unwrap().crash.crash_count, 3);
    }
}
