//! Command-line interface for dayforge.
//!
//! Provides the `run` command plus operator commands that read and write the
//! state directory: `status`, `trigger`, `history` and `check-config`.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
