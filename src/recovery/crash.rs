//! Crash counting and the fail-fast ceiling.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::config::PipelineConfig;

/// Crash counters persisted alongside the day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashCounters {
    #[serde(default)]
    pub crash_count: u32,
    #[serde(default)]
    pub last_crash_at: Option<DateTime<Utc>>,
}

/// How many crashes are tolerated, and over what window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashPolicy {
    pub max_crashes: u32,
    pub window: Duration,
}

impl CrashPolicy {
    pub fn new(max_crashes: u32, window: Duration) -> Self {
        Self {
            max_crashes,
            window,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.max_crashes_before_fail_fast, config.crash_window())
    }
}

/// What the supervisor should do after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashVerdict {
    /// Restart the event loop in-process.
    Restart { crash_count: u32 },
    /// Too many crashes: exit and leave restarting to the external supervisor.
    FailFast { crash_count: u32 },
}

impl CrashCounters {
    /// Counts a crash at `now`.
    ///
    /// The count restarts if the previous crash is older than the window.
    pub fn record_crash(&mut self, now: DateTime<Utc>, policy: &CrashPolicy) -> CrashVerdict {
        let window = chrono::Duration::from_std(policy.window)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        if let Some(last) = self.last_crash_at {
            if now.signed_duration_since(last) > window {
                self.crash_count = 0;
            }
        }

        self.crash_count = self.crash_count.saturating_add(1);
        self.last_crash_at = Some(now);

        if self.crash_count > policy.max_crashes {
            CrashVerdict::FailFast {
                crash_count: self.crash_count,
            }
        } else {
            CrashVerdict::Restart {
                crash_count: self.crash_count,
            }
        }
    }

    /// Clears the counters. Called at every daily reset.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CrashPolicy {
        CrashPolicy::new(2, Duration::from_secs(3600))
    }

    #[test]
    fn test_fail_fast_after_exceeding_max() {
        let mut counters = CrashCounters::default();
        let now = Utc::now();

        assert_eq!(
            counters.record_crash(now, &policy()),
            CrashVerdict::Restart { crash_count: 1 }
        );
        assert_eq!(
            counters.record_crash(now, &policy()),
            CrashVerdict::Restart { crash_count: 2 }
        );
        assert_eq!(
            counters.record_crash(now, &policy()),
            CrashVerdict::FailFast { crash_count: 3 }
        );
    }

    #[test]
    fn test_window_restarts_count() {
        let mut counters = CrashCounters::default();
        let start = Utc::now();
        counters.record_crash(start, &policy());
        counters.record_crash(start, &policy());

        let later = start + chrono::Duration::hours(2);
        assert_eq!(
            counters.record_crash(later, &policy()),
            CrashVerdict::Restart { crash_count: 1 }
        );
        assert_eq!(counters.last_crash_at, Some(later));
    }

    #[test]
    fn test_reset() {
        let mut counters = CrashCounters::default();
        counters.record_crash(Utc::now(), &policy());
        counters.reset();
        assert_eq!(counters, CrashCounters::default());
    }
}
