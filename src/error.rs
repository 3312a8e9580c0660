//! Error types for the orchestrator.
//!
//! Each subsystem owns its error enum:
//! - [`ConfigError`]: configuration loading and validation
//! - [`AdapterError`]: external collaborators
//! - [`CheckpointError`]: checkpoint persistence
//! - [`ArchiveError`]: the archive of past days
//! - [`TransitionError`]: illegal transitions and refused triggers
//!
//! [`OrchestratorError`] wraps them at the event-loop boundary and decides
//! which are fatal for the process.

use thiserror::Error;

pub use crate::adapters::AdapterError;
pub use crate::pipeline::config::ConfigError;
pub use crate::pipeline::machine::TransitionError;
pub use crate::recovery::checkpoint::CheckpointError;
pub use crate::storage::archive::ArchiveError;

/// Errors that end a run of the event loop.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Checkpoint write or read failed.
    #[error("Persistence failure: {0}")]
    Persistence(#[from] CheckpointError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An internal transition broke stage ordering.
    #[error("State machine fault: {0}")]
    Transition(#[from] TransitionError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// The event channel closed while the loop was running.
    #[error("Event channel closed unexpectedly")]
    ChannelClosed,

    /// The event loop task panicked.
    #[error("Event loop panicked: {0}")]
    Panicked(String),
}

impl OrchestratorError {
    /// Returns true for errors that must stop the process instead of
    /// restarting the loop in-process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Persistence(_) | OrchestratorError::Config(_)
        )
    }
}
