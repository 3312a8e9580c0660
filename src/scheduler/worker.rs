//! Stage workers.
//!
//! Every adapter call runs on its own spawned task so the event loop keeps
//! processing clock ticks and operator requests while a slow stage (the
//! upload in particular) is running. The worker enforces the stage timeout
//! without cancelling the adapter: on timeout it reports `StageTimedOut`,
//! keeps waiting, and forwards the late result, which the loop discards as
//! stale.
//!
//! Every call is recorded in [`StageTasks`] until a loop receives its result,
//! and events are sent to whichever loop the registry is attached to.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::adapters::{AdapterError, Adapters};
use crate::pipeline::machine::{
    Alert, JobInput, StageFailure, StageJob, StageOutput, StageReport,
};
use crate::pipeline::orchestrator::LoopEvent;

use super::tasks::StageTasks;

/// Dispatches stage jobs and alerts onto spawned tasks.
#[derive(Clone)]
pub struct StageWorker {
    adapters: Adapters,
    tasks: StageTasks,
}

impl StageWorker {
    /// Worker with its own registry, reporting to `events`.
    pub fn new(adapters: Adapters, events: mpsc::Sender<LoopEvent>) -> Self {
        let tasks = StageTasks::new();
        tasks.attach(events);
        Self::with_tasks(adapters, tasks)
    }

    /// Worker reporting through a shared registry.
    pub fn with_tasks(adapters: Adapters, tasks: StageTasks) -> Self {
        Self { adapters, tasks }
    }

    pub fn adapters(&self) -> &Adapters {
        &self.adapters
    }

    pub fn tasks(&self) -> &StageTasks {
        &self.tasks
    }

    /// Runs `job` with a hard `timeout`, reporting back on the event channel.
    pub fn spawn(&self, job: StageJob, timeout: Duration) -> JoinHandle<()> {
        self.tasks.register(job.attempt, job.stage(), job.date);
        let worker = self.clone();
        tokio::spawn(async move {
            worker.run(job, timeout).await;
        })
    }

    async fn run(self, job: StageJob, timeout: Duration) {
        let stage = job.stage();
        let attempt = job.attempt;
        let start = Instant::now();

        info!(date = %job.date, %stage, attempt = %attempt, "Stage worker started");

        let adapters = self.adapters.clone();
        let mut task = tokio::spawn(execute(adapters, job.input));

        let joined = match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(
                    %stage,
                    attempt = %attempt,
                    timeout_secs = timeout.as_secs(),
                    "Stage timed out, adapter left running"
                );
                self.tasks.mark_timed_out(attempt);
                self.send(LoopEvent::StageTimedOut {
                    attempt,
                    stage,
                    after: timeout,
                })
                .await;
                task.await
            }
        };

        let outcome = outcome_of(joined);
        match outcome {
            Ok(_) => debug!(%stage, attempt = %attempt, "Stage worker finished"),
            Err(ref e) => debug!(%stage, attempt = %attempt, error = %e, "Stage worker failed"),
        }

        let report = StageReport {
            attempt,
            stage,
            outcome,
            duration: start.elapsed(),
        };
        self.tasks.record_report(&report);
        self.send(LoopEvent::StageResult(report)).await;
    }

    /// Delivers an alert in the background. Delivery failures are logged only.
    pub fn alert(&self, alert: Alert) -> JoinHandle<()> {
        let notifier = self.adapters.notifier.clone();
        tokio::spawn(async move {
            let kind = alert.kind.as_str();
            if let Err(e) = notifier.notify(kind, &alert.payload()).await {
                error!(kind, error = %e, "Failed to deliver alert");
            }
        })
    }

    async fn send(&self, event: LoopEvent) {
        let Some(events) = self.tasks.events() else {
            debug!("No event loop attached, keeping worker event");
            return;
        };
        if events.send(event).await.is_err() {
            debug!("Event loop is gone, result kept for the next one");
        }
    }
}

/// Calls the adapter for one job input.
async fn execute(adapters: Adapters, input: JobInput) -> Result<StageOutput, AdapterError> {
    match input {
        JobInput::Acquire => adapters.acquirer.acquire().await.map(StageOutput::Acquired),
        JobInput::Transform(units) => adapters
            .transformer
            .transform(&units)
            .await
            .map(StageOutput::Transformed),
        JobInput::Upload(artifact) => adapters
            .uploader
            .upload(&artifact)
            .await
            .map(|()| StageOutput::Uploaded),
        JobInput::GenerateReport(artifact) => adapters
            .reporter
            .generate_report(&artifact)
            .await
            .map(StageOutput::Reported),
        JobInput::Notify { kinds, payload } => {
            let mut sent = Vec::new();
            let mut failed = Vec::new();
            for kind in kinds {
                match adapters.notifier.notify(&kind, &payload).await {
                    Ok(()) => sent.push(kind),
                    Err(e) => failed.push((kind, e.to_string())),
                }
            }
            Ok(StageOutput::Notified { sent, failed })
        }
    }
}

fn outcome_of(
    joined: Result<Result<StageOutput, AdapterError>, JoinError>,
) -> Result<StageOutput, StageFailure> {
    match joined {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(StageFailure::Adapter(e.to_string())),
        Err(e) if e.is_panic() => Err(StageFailure::Adapter(format!("adapter panicked: {}", e))),
        Err(e) => Err(StageFailure::Adapter(format!("adapter task cancelled: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use uuid::Uuid;

    use crate::adapters::{
        Acquirer, LogNotifier, Notifier, ReportGenerator, Transformer, UnitsRef, Uploader,
    };
    use crate::pipeline::day::StageKind;

    struct SlowUploader(Duration);

    #[async_trait]
    impl Uploader for SlowUploader {
        async fn upload(&self, _artifact: &str) -> Result<(), AdapterError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    struct Fixed;

    #[async_trait]
    impl Acquirer for Fixed {
        async fn acquire(&self) -> Result<u32, AdapterError> {
            Ok(4)
        }
    }

    #[async_trait]
    impl Transformer for Fixed {
        async fn transform(&self, _units: &UnitsRef) -> Result<String, AdapterError> {
            Err(AdapterError::Other("sheet is locked".to_string()))
        }
    }

    #[async_trait]
    impl ReportGenerator for Fixed {
        async fn generate_report(&self, _artifact: &str) -> Result<String, AdapterError> {
            panic!("renderer crashed")
        }
    }

    struct FlakyNotifier(AtomicUsize);

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn notify(&self, kind: &str, _payload: &serde_json::Value) -> Result<(), AdapterError> {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(())
            } else {
                Err(AdapterError::NotifyFailed {
                    kind: kind.to_string(),
                    reason: "relay refused".to_string(),
                })
            }
        }
    }

    fn adapters(upload_takes: Duration, notifier: Arc<dyn Notifier>) -> Adapters {
        Adapters::new(
            Arc::new(Fixed),
            Arc::new(Fixed),
            Arc::new(SlowUploader(upload_takes)),
            Arc::new(Fixed),
            notifier,
        )
    }

    fn job(input: JobInput) -> StageJob {
        StageJob {
            attempt: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2024, 7, 5).unwrap(),
            input,
        }
    }

    async fn report(rx: &mut mpsc::Receiver<LoopEvent>) -> StageReport {
        match rx.recv().await {
            Some(LoopEvent::StageResult(report)) => report,
            other => panic!("expected stage result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_successful_job_reports_output() {
        let (tx, mut rx) = mpsc::channel(8);
        let worker = StageWorker::new(adapters(Duration::ZERO, Arc::new(LogNotifier)), tx);
        let job = job(JobInput::Acquire);
        worker.spawn(job.clone(), Duration::from_secs(5));

        let report = report(&mut rx).await;
        assert_eq!(report.attempt, job.attempt);
        assert_eq!(report.stage, StageKind::Acquiring);
        assert_eq!(report.outcome, Ok(StageOutput::Acquired(4)));
    }

    #[tokio::test]
    async fn test_result_without_loop_is_kept() {
        let (tx, rx) = mpsc::channel(8);
        let worker = StageWorker::new(adapters(Duration::ZERO, Arc::new(LogNotifier)), tx);
        drop(rx);
        let job = job(JobInput::Acquire);
        worker.spawn(job.clone(), Duration::from_secs(5)).await.unwrap();

        let outstanding = worker.tasks().outstanding();
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].attempt, job.attempt);
        assert_eq!(
            outstanding[0].report.as_ref().map(|r| r.outcome.clone()),
            Some(Ok(StageOutput::Acquired(4)))
        );
    }

    #[tokio::test]
    async fn test_adapter_error_becomes_failure() {
        let (tx, mut rx) = mpsc::channel(8);
        let worker = StageWorker::new(adapters(Duration::ZERO, Arc::new(LogNotifier)), tx);
        worker.spawn(
            job(JobInput::Transform(UnitsRef {
                date: NaiveDate::from_ymd_opt(2024, 7, 5).unwrap(),
                units: 8,
            })),
            Duration::from_secs(5),
        );

        let report = report(&mut rx).await;
        assert_eq!(
            report.outcome,
            Err(StageFailure::Adapter("sheet is locked".to_string()))
        );
    }

    #[tokio::test]
    async fn test_adapter_panic_becomes_failure() {
        let (tx, mut rx) = mpsc::channel(8);
        let worker = StageWorker::new(adapters(Duration::ZERO, Arc::new(LogNotifier)), tx);
        worker.spawn(
            job(JobInput::GenerateReport("merged.xlsx".to_string())),
            Duration::from_secs(5),
        );

        let report = report(&mut rx).await;
        match report.outcome {
            Err(StageFailure::Adapter(message)) => assert!(message.contains("panicked")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_result() {
        let (tx, mut rx) = mpsc::channel(8);
        let worker = StageWorker::new(
            adapters(Duration::from_secs(5000), Arc::new(LogNotifier)),
            tx,
        );
        let job = job(JobInput::Upload("merged.xlsx".to_string()));
        worker.spawn(job.clone(), Duration::from_secs(3600));

        match rx.recv().await {
            Some(LoopEvent::StageTimedOut {
                attempt,
                stage,
                after,
            }) => {
                assert_eq!(attempt, job.attempt);
                assert_eq!(stage, StageKind::Uploading);
                assert_eq!(after, Duration::from_secs(3600));
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        let late = report(&mut rx).await;
        assert_eq!(late.attempt, job.attempt);
        assert!(worker.tasks().outstanding()[0].timed_out);
        assert_eq!(late.outcome, Ok(StageOutput::Uploaded));
    }

    #[tokio::test]
    async fn test_notify_records_partial_delivery() {
        let (tx, mut rx) = mpsc::channel(8);
        let notifier = Arc::new(FlakyNotifier(AtomicUsize::new(0)));
        let worker = StageWorker::new(adapters(Duration::ZERO, notifier), tx);
        worker.spawn(
            job(JobInput::Notify {
                kinds: vec!["daily_report".to_string(), "summary".to_string()],
                payload: serde_json::json!({}),
            }),
            Duration::from_secs(5),
        );

        let report = report(&mut rx).await;
        match report.outcome {
            Ok(StageOutput::Notified { sent, failed }) => {
                assert_eq!(sent, vec!["daily_report".to_string()]);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].0, "summary");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
