//! Interfaces to the external collaborators that do each stage's work.
//!
//! The orchestrator never knows how data is fetched, transformed, uploaded,
//! reported or announced. It only calls these traits from worker tasks:
//!
//! - [`Acquirer`]: fetch new raw-data units, returning how many arrived
//! - [`Transformer`]: turn the day's units into one artifact
//! - [`Uploader`]: hand the artifact to the slow external stage
//! - [`ReportGenerator`]: produce the final report from the artifact
//! - [`Notifier`]: deliver a tagged notification to humans
//!
//! [`CommandAdapter`] runs an external program for the first four;
//! [`WebhookNotifier`] and [`LogNotifier`] cover notifications.

pub mod command;
pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::config::{AdapterConfig, ConfigError};

pub use command::CommandAdapter;
pub use webhook::{LogNotifier, WebhookNotifier};

/// Errors returned by an external collaborator.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The collaborator could not be started.
    #[error("Failed to launch {program}: {reason}")]
    LaunchFailed { program: String, reason: String },

    /// The collaborator ran and reported failure.
    #[error("{program} exited with code {code}: {stderr}")]
    NonZeroExit {
        program: String,
        code: i32,
        stderr: String,
    },

    /// The collaborator's output could not be interpreted.
    #[error("Unexpected output from {program}: {reason}")]
    InvalidOutput { program: String, reason: String },

    /// Notification delivery failed.
    #[error("Notification '{kind}' failed: {reason}")]
    NotifyFailed { kind: String, reason: String },

    /// Any other collaborator failure.
    #[error("{0}")]
    Other(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reference to the units accumulated for a day, handed to the transformer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitsRef {
    pub date: NaiveDate,
    pub units: u32,
}

/// Fetches new raw-data units.
#[async_trait]
pub trait Acquirer: Send + Sync {
    /// Returns the number of units fetched by this call.
    async fn acquire(&self) -> Result<u32, AdapterError>;
}

/// Transforms the day's units into a single artifact.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Returns an opaque reference (usually a path) to the artifact.
    async fn transform(&self, units: &UnitsRef) -> Result<String, AdapterError>;
}

/// Hands the transform artifact to the slow external processing stage.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, artifact_ref: &str) -> Result<(), AdapterError>;
}

/// Produces the final report for the day.
#[async_trait]
pub trait ReportGenerator: Send + Sync {
    /// Returns an opaque reference to the report.
    async fn generate_report(&self, artifact_ref: &str) -> Result<String, AdapterError>;
}

/// Delivers a notification of a given kind.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, kind: &str, payload: &serde_json::Value) -> Result<(), AdapterError>;
}

/// The full set of collaborators the orchestrator dispatches to.
#[derive(Clone)]
pub struct Adapters {
    pub acquirer: Arc<dyn Acquirer>,
    pub transformer: Arc<dyn Transformer>,
    pub uploader: Arc<dyn Uploader>,
    pub reporter: Arc<dyn ReportGenerator>,
    pub notifier: Arc<dyn Notifier>,
}

impl Adapters {
    pub fn new(
        acquirer: Arc<dyn Acquirer>,
        transformer: Arc<dyn Transformer>,
        uploader: Arc<dyn Uploader>,
        reporter: Arc<dyn ReportGenerator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            acquirer,
            transformer,
            uploader,
            reporter,
            notifier,
        }
    }

    /// Builds command and notification adapters from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingAdapter` for any stage without a command.
    pub fn from_config(config: &AdapterConfig) -> Result<Self, ConfigError> {
        let require = |spec: &Option<crate::pipeline::config::CommandSpec>, stage: &str| {
            spec.clone()
                .map(CommandAdapter::new)
                .ok_or_else(|| ConfigError::MissingAdapter(stage.to_string()))
        };

        let notifier: Arc<dyn Notifier> = match config.notify_webhook {
            Some(ref url) => Arc::new(WebhookNotifier::new(url.clone())),
            None => Arc::new(LogNotifier),
        };

        Ok(Self {
            acquirer: Arc::new(require(&config.acquire, "acquiring")?),
            transformer: Arc::new(require(&config.transform, "transforming")?),
            uploader: Arc::new(require(&config.upload, "uploading")?),
            reporter: Arc::new(require(&config.report, "report_generating")?),
            notifier,
        })
    }
}
