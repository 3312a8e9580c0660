//! External-program adapter.
//!
//! Runs a configured command for a stage. Inputs are passed through
//! `DAYFORGE_*` environment variables and the result is read from the last
//! non-empty line the program prints on stdout.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{AdapterError, Acquirer, ReportGenerator, Transformer, UnitsRef, Uploader};
use crate::pipeline::config::CommandSpec;

/// Adapter that shells out to an external collaborator program.
pub struct CommandAdapter {
    spec: CommandSpec,
}

impl CommandAdapter {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn program(&self) -> &str {
        &self.spec.program
    }

    /// Runs the program with extra environment and returns its stdout.
    async fn run(&self, stage: &str, env: &[(&str, String)]) -> Result<String, AdapterError> {
        let start = Instant::now();

        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&self.spec.args);

        if let Some(ref dir) = self.spec.working_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in &self.spec.env {
            cmd.env(key, value);
        }

        cmd.env("DAYFORGE_STAGE", stage);
        for (key, value) in env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        info!(program = %self.spec.program, stage, "Starting stage command");

        let output = cmd
            .output()
            .await
            .map_err(|e| AdapterError::LaunchFailed {
                program: self.spec.program.clone(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        debug!(
            program = %self.spec.program,
            stage,
            duration_ms = start.elapsed().as_millis() as u64,
            exit_code = output.status.code().unwrap_or(-1),
            "Stage command finished"
        );

        if !output.status.success() {
            return Err(AdapterError::NonZeroExit {
                program: self.spec.program.clone(),
                code: output.status.code().unwrap_or(-1),
                stderr: truncate(stderr.trim(), 500),
            });
        }

        Ok(stdout)
    }

    /// Extracts the result line from program output.
    fn result_line(&self, stdout: &str) -> Result<String, AdapterError> {
        last_line(stdout)
            .map(str::to_string)
            .ok_or_else(|| AdapterError::InvalidOutput {
                program: self.spec.program.clone(),
                reason: "no output on stdout".to_string(),
            })
    }
}

#[async_trait]
impl Acquirer for CommandAdapter {
    async fn acquire(&self) -> Result<u32, AdapterError> {
        let stdout = self.run("acquiring", &[]).await?;
        let line = self.result_line(&stdout)?;
        line.parse().map_err(|_| AdapterError::InvalidOutput {
            program: self.spec.program.clone(),
            reason: format!("expected a unit count, got '{}'", line),
        })
    }
}

#[async_trait]
impl Transformer for CommandAdapter {
    async fn transform(&self, units: &UnitsRef) -> Result<String, AdapterError> {
        let env = [
            ("DAYFORGE_DATE", units.date.to_string()),
            ("DAYFORGE_UNITS", units.units.to_string()),
        ];
        let stdout = self.run("transforming", &env).await?;
        self.result_line(&stdout)
    }
}

#[async_trait]
impl Uploader for CommandAdapter {
    async fn upload(&self, artifact_ref: &str) -> Result<(), AdapterError> {
        let env = [("DAYFORGE_ARTIFACT", artifact_ref.to_string())];
        self.run("uploading", &env).await?;
        Ok(())
    }
}

#[async_trait]
impl ReportGenerator for CommandAdapter {
    async fn generate_report(&self, artifact_ref: &str) -> Result<String, AdapterError> {
        let env = [("DAYFORGE_ARTIFACT", artifact_ref.to_string())];
        let stdout = self.run("report_generating", &env).await?;
        self.result_line(&stdout)
    }
}

fn last_line(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sh(script: &str) -> CommandAdapter {
        CommandAdapter::new(
            CommandSpec::new("sh").with_args(vec!["-c".to_string(), script.to_string()]),
        )
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("log line\n4\n\n"), Some("4"));
        assert_eq!(last_line("  \n"), None);
        assert_eq!(last_line(""), None);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 4), "abcd...");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_acquire_parses_count() {
        let adapter = sh("echo fetching; echo 4");
        assert_eq!(adapter.acquire().await.unwrap(), 4);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_acquire_rejects_garbage() {
        let adapter = sh("echo many");
        let err = adapter.acquire().await.unwrap_err();
        assert!(matches!(err, AdapterError::InvalidOutput { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_transform_receives_inputs() {
        let adapter = sh("echo merged-$DAYFORGE_DATE-$DAYFORGE_UNITS.xlsx");
        let units = UnitsRef {
            date: NaiveDate::from_ymd_opt(2024, 7, 5).unwrap(),
            units: 8,
        };
        let artifact = adapter.transform(&units).await.unwrap();
        assert_eq!(artifact, "merged-2024-07-05-8.xlsx");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit() {
        let adapter = sh("echo 'upload window closed' >&2; exit 3");
        let err = adapter.upload("merged.xlsx").await.unwrap_err();
        match err {
            AdapterError::NonZeroExit { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert!(stderr.contains("upload window closed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let adapter = CommandAdapter::new(CommandSpec::new("/nonexistent/dayforge-fetch"));
        let err = adapter.acquire().await.unwrap_err();
        assert!(matches!(err, AdapterError::LaunchFailed { .. }));
    }
}
