//! dayforge: crash-safe orchestrator for a once-a-day data pipeline.
//!
//! A fixed schedule of acquisition slots feeds units into a threshold gate;
//! once enough have arrived the day moves through transform, upload, report
//! and notification stages. Every state change is checkpointed so a crash
//! resumes where it left off, and a daily reset archives the day and starts
//! the next one.

pub mod adapters;
pub mod cli;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod recovery;
pub mod scheduler;
pub mod storage;

pub use error::{
    AdapterError, ArchiveError, CheckpointError, ConfigError, OrchestratorError, TransitionError,
};
