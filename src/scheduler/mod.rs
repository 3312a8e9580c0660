//! Time and work scheduling.
//!
//! - [`clock`]: turns the configured schedule into slot, health-check and
//!   daily-reset events
//! - [`worker`]: runs adapter calls on spawned tasks with hard timeouts
//! - [`tasks`]: outstanding adapter calls, shared across loop restarts
//!
//! ```text
//!   TriggerSource ──ClockEvent──┐
//!                               ▼
//!   ControlInbox ──────────▶ event loop ──StageJob──▶ StageWorker ──▶ adapter
//!                               ▲                          │
//!                               └──────StageReport─────────┘
//! ```

pub mod clock;
pub mod tasks;
pub mod worker;

pub use clock::{ClockEvent, SimulatedTimeSource, SystemTimeSource, TimeSource, TriggerSource};
pub use tasks::{Claim, StageTask, StageTasks};
pub use worker::StageWorker;
