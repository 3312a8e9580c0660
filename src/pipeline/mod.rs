//! The daily pipeline.
//!
//! # Architecture
//!
//! - **Day** ([`day`]): the per-date record and its stage enum
//! - **Config** ([`config`]): schedule, threshold, retry, timeout and storage settings
//! - **Threshold** ([`threshold`]): the gate between acquisition and transform
//! - **Machine** ([`machine`]): pure transition logic emitting commands
//! - **Orchestrator** ([`orchestrator`]): the single-writer event loop
//! - **Reset** ([`reset`]): archives one day and opens the next
//!
//! # Pipeline Flow
//!
//! 1. **Acquisition**: each schedule slot (and catch-up health checks) runs the acquirer
//! 2. **Threshold**: units accumulate until the configured threshold is met
//! 3. **Transform**: the day's units become one artifact, exactly once
//! 4. **Upload**: the artifact is handed to the slow external stage
//! 5. **Report**: a report is generated from the artifact
//! 6. **Notify**: every required notification kind is delivered
//!
//! Any adapter stage can fail or time out; it is retried with backoff until
//! the per-stage limit, after which the day halts until an operator trigger
//! or the next daily reset.

pub mod config;
pub mod day;
pub mod machine;
pub mod orchestrator;
pub mod reset;
pub mod threshold;

pub use config::{AdapterConfig, CatchUpWindow, CommandSpec, ConfigError, PipelineConfig, ScheduleSlot};
pub use day::{PipelineDay, Stage, StageKind};
pub use machine::{
    Alert, AlertKind, Command, JobInput, RetryPolicy, StageFailure, StageJob, StageMachine,
    StageOutput, StageReport, TransitionError,
};
pub use orchestrator::{
    ControlRequest, LoopEvent, Orchestrator, OrchestratorHandle, PipelineStatus,
};
pub use reset::{DailyResetController, Rollover};
pub use threshold::ThresholdMonitor;
