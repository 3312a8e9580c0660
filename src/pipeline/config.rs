//! Pipeline configuration for the orchestrator.
//!
//! Configuration is read from a YAML file, overlaid with `DAYFORGE_*`
//! environment variables, then validated. Invalid configuration is fatal at
//! startup and is never retried.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::day::StageKind;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// A stage has no adapter configured.
    #[error("No adapter configured for stage '{0}'")]
    MissingAdapter(String),

    /// The configuration file could not be parsed.
    #[error("Failed to parse config file '{path}': {message}")]
    ParseError { path: String, message: String },

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A time of day at which an acquisition attempt is triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSlot {
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    pub tag: String,
}

impl ScheduleSlot {
    pub fn new(time: NaiveTime, tag: impl Into<String>) -> Self {
        Self {
            time,
            tag: tag.into(),
        }
    }

    /// Parses a slot from `HH:MM` and a tag.
    pub fn parse(time: &str, tag: impl Into<String>) -> Result<Self, ConfigError> {
        let time = hhmm::parse(time).map_err(|message| ConfigError::InvalidValue {
            key: "schedule_slots.time".to_string(),
            message,
        })?;
        Ok(Self::new(time, tag))
    }
}

/// Local time range during which health checks may top up acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUpWindow {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl CatchUpWindow {
    /// Returns true if `time` lies inside `[start, end]`.
    pub fn contains(&self, time: NaiveTime) -> bool {
        time >= self.start && time <= self.end
    }
}

/// How to invoke one external collaborator program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// External collaborator wiring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub acquire: Option<CommandSpec>,
    pub transform: Option<CommandSpec>,
    pub upload: Option<CommandSpec>,
    pub report: Option<CommandSpec>,
    /// Webhook that receives notifications. Notifications are only logged
    /// when unset.
    pub notify_webhook: Option<String>,
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // Scheduling
    pub schedule_slots: Vec<ScheduleSlot>,
    #[serde(with = "hhmm")]
    pub daily_reset_time: NaiveTime,
    pub health_check_interval_secs: u64,
    pub catch_up_window: Option<CatchUpWindow>,

    // Threshold
    /// Units that must be acquired before the day may leave AwaitingThreshold.
    pub threshold: u32,

    // Retry and timeouts
    /// Failures a stage may accumulate in one day before the day halts.
    pub per_stage_retry_limit: u32,
    pub per_stage_timeout_secs: BTreeMap<StageKind, u64>,
    pub retry_backoff_secs: u64,
    pub retry_backoff_max_secs: u64,

    // Crash recovery
    pub max_crashes_before_fail_fast: u32,
    pub crash_window_secs: u64,
    pub restart_delay_secs: u64,

    // Storage and control
    pub state_dir: PathBuf,
    pub archive_retention_days: u32,
    pub control_poll_interval_secs: u64,

    // Notifications
    /// Kinds the Notifying stage must deliver before the day is Done.
    pub required_notifications: Vec<String>,

    pub adapters: AdapterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            schedule_slots: vec![
                ScheduleSlot::new(time(9, 30), "primary"),
                ScheduleSlot::new(time(13, 0), "primary"),
                ScheduleSlot::new(time(13, 30), "backup"),
            ],
            daily_reset_time: time(0, 0),
            health_check_interval_secs: 300,
            catch_up_window: Some(CatchUpWindow {
                start: time(9, 0),
                end: time(17, 0),
            }),

            threshold: 8,

            per_stage_retry_limit: 3,
            per_stage_timeout_secs: default_stage_timeouts(),
            retry_backoff_secs: 60,
            retry_backoff_max_secs: 1800,

            max_crashes_before_fail_fast: 5,
            crash_window_secs: 3600,
            restart_delay_secs: 30,

            state_dir: PathBuf::from("./state"),
            archive_retention_days: 60,
            control_poll_interval_secs: 2,

            required_notifications: vec!["daily_report".to_string()],

            adapters: AdapterConfig::default(),
        }
    }
}

fn default_stage_timeouts() -> BTreeMap<StageKind, u64> {
    BTreeMap::from([
        (StageKind::Acquiring, 900),
        (StageKind::Transforming, 600),
        (StageKind::Uploading, 3600),
        (StageKind::ReportGenerating, 600),
        (StageKind::Notifying, 120),
    ])
}

fn time(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file, applies environment overrides
    /// and validates the result.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, an
    /// override is malformed, or validation fails.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&raw).map_err(|e| match e {
            ConfigError::ParseError { message, .. } => ConfigError::ParseError {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from YAML text without validating it.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|e| ConfigError::ParseError {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })
    }

    /// Overlays `DAYFORGE_*` environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DAYFORGE_THRESHOLD`: units required per day
    /// - `DAYFORGE_STATE_DIR`: checkpoint and archive directory
    /// - `DAYFORGE_RETRY_LIMIT`: per-stage failure limit
    /// - `DAYFORGE_MAX_CRASHES`: crashes tolerated inside the crash window
    /// - `DAYFORGE_HEALTH_CHECK_INTERVAL_SECS`: health check period
    /// - `DAYFORGE_NOTIFY_WEBHOOK`: notification webhook URL
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("DAYFORGE_THRESHOLD") {
            self.threshold = parse_env_value(&val, "DAYFORGE_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("DAYFORGE_STATE_DIR") {
            self.state_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("DAYFORGE_RETRY_LIMIT") {
            self.per_stage_retry_limit = parse_env_value(&val, "DAYFORGE_RETRY_LIMIT")?;
        }

        if let Ok(val) = std::env::var("DAYFORGE_MAX_CRASHES") {
            self.max_crashes_before_fail_fast = parse_env_value(&val, "DAYFORGE_MAX_CRASHES")?;
        }

        if let Ok(val) = std::env::var("DAYFORGE_HEALTH_CHECK_INTERVAL_SECS") {
            self.health_check_interval_secs =
                parse_env_value(&val, "DAYFORGE_HEALTH_CHECK_INTERVAL_SECS")?;
        }

        if let Ok(val) = std::env::var("DAYFORGE_NOTIFY_WEBHOOK") {
            self.adapters.notify_webhook = if val.trim().is_empty() {
                None
            } else {
                Some(val)
            };
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule_slots.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "schedule_slots must contain at least one slot".to_string(),
            ));
        }

        for (i, slot) in self.schedule_slots.iter().enumerate() {
            if slot.tag.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "schedule_slots[{}].tag cannot be empty",
                    i
                )));
            }
            if self.schedule_slots[..i]
                .iter()
                .any(|other| other.time == slot.time && other.tag == slot.tag)
            {
                return Err(ConfigError::ValidationFailed(format!(
                    "schedule_slots[{}] duplicates {} {}",
                    i,
                    slot.time.format("%H:%M"),
                    slot.tag
                )));
            }
        }

        if self.threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "threshold must be greater than 0".to_string(),
            ));
        }

        if self.health_check_interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "health_check_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.per_stage_retry_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "per_stage_retry_limit must be greater than 0".to_string(),
            ));
        }

        if let Some((stage, _)) = self
            .per_stage_timeout_secs
            .iter()
            .find(|(_, secs)| **secs == 0)
        {
            return Err(ConfigError::ValidationFailed(format!(
                "per_stage_timeout_secs.{} must be greater than 0",
                stage
            )));
        }

        if self.retry_backoff_max_secs < self.retry_backoff_secs {
            return Err(ConfigError::ValidationFailed(
                "retry_backoff_max_secs cannot be less than retry_backoff_secs".to_string(),
            ));
        }

        if self.max_crashes_before_fail_fast == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_crashes_before_fail_fast must be greater than 0".to_string(),
            ));
        }

        if self.crash_window_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "crash_window_secs must be greater than 0".to_string(),
            ));
        }

        if self.control_poll_interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "control_poll_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "state_dir cannot be empty".to_string(),
            ));
        }

        if let Some(window) = self.catch_up_window {
            if window.start >= window.end {
                return Err(ConfigError::ValidationFailed(
                    "catch_up_window.start must be before catch_up_window.end".to_string(),
                ));
            }
        }

        if self
            .required_notifications
            .iter()
            .any(|kind| kind.trim().is_empty())
        {
            return Err(ConfigError::ValidationFailed(
                "required_notifications cannot contain empty kinds".to_string(),
            ));
        }

        Ok(())
    }

    /// Hard timeout for one adapter call of `stage`.
    pub fn stage_timeout(&self, stage: StageKind) -> Duration {
        let secs = self
            .per_stage_timeout_secs
            .get(&stage)
            .copied()
            .or_else(|| default_stage_timeouts().get(&stage).copied())
            .unwrap_or(600);
        Duration::from_secs(secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_max_secs)
    }

    pub fn crash_window(&self) -> Duration {
        Duration::from_secs(self.crash_window_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn control_poll_interval(&self) -> Duration {
        Duration::from_secs(self.control_poll_interval_secs)
    }

    /// Returns true if `tag` belongs to a configured slot.
    pub fn has_slot_tag(&self, tag: &str) -> bool {
        self.schedule_slots.iter().any(|slot| slot.tag == tag)
    }

    /// Date of the pipeline day that `now` belongs to.
    ///
    /// A day runs from one daily reset to the next, so before the reset
    /// time the previous calendar date is still current.
    pub fn business_date(&self, now: NaiveDateTime) -> chrono::NaiveDate {
        if now.time() >= self.daily_reset_time {
            now.date()
        } else {
            now.date().pred_opt().unwrap_or(now.date())
        }
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join("checkpoint.json")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.state_dir.join("archive")
    }

    pub fn control_dir(&self) -> PathBuf {
        self.state_dir.join("control")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.state_dir.join("metrics.prom")
    }

    /// Builder method to set the schedule slots.
    pub fn with_schedule_slots(mut self, slots: Vec<ScheduleSlot>) -> Self {
        self.schedule_slots = slots;
        self
    }

    /// Builder method to set the threshold.
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Builder method to set the daily reset time.
    pub fn with_daily_reset_time(mut self, time: NaiveTime) -> Self {
        self.daily_reset_time = time;
        self
    }

    /// Builder method to set the health check interval.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_secs = interval.as_secs();
        self
    }

    /// Builder method to set the catch-up window.
    pub fn with_catch_up_window(mut self, window: Option<CatchUpWindow>) -> Self {
        self.catch_up_window = window;
        self
    }

    /// Builder method to set the per-stage retry limit.
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.per_stage_retry_limit = limit;
        self
    }

    /// Builder method to set one stage's timeout.
    pub fn with_stage_timeout(mut self, stage: StageKind, timeout: Duration) -> Self {
        self.per_stage_timeout_secs.insert(stage, timeout.as_secs());
        self
    }

    /// Builder method to set the retry backoff and its cap.
    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff_secs = base.as_secs();
        self.retry_backoff_max_secs = max.as_secs();
        self
    }

    /// Builder method to set the crash ceiling.
    pub fn with_max_crashes(mut self, max: u32) -> Self {
        self.max_crashes_before_fail_fast = max;
        self
    }

    /// Builder method to set the state directory.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Builder method to set the required notification kinds.
    pub fn with_required_notifications(mut self, kinds: Vec<String>) -> Self {
        self.required_notifications = kinds;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// `HH:MM` (de)serialization for times of day.
pub(crate) mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Result<NaiveTime, String> {
        let raw = raw.trim();
        NaiveTime::parse_from_str(raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
            .map_err(|_| format!("expected HH:MM, got '{}'", raw))
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.threshold, 8);
        assert_eq!(config.schedule_slots.len(), 3);
        assert_eq!(config.daily_reset_time, time(0, 0));
        assert_eq!(config.health_check_interval(), Duration::from_secs(300));
        assert_eq!(config.per_stage_retry_limit, 3);
        assert_eq!(
            config.stage_timeout(StageKind::Uploading),
            Duration::from_secs(3600)
        );
        assert_eq!(config.max_crashes_before_fail_fast, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let raw = r#"
schedule_slots:
  - { time: "09:30", tag: primary }
  - { time: "13:30", tag: backup }
threshold: 6
daily_reset_time: "01:00"
health_check_interval_secs: 60
per_stage_retry_limit: 2
per_stage_timeout_secs:
  uploading: 1800
max_crashes_before_fail_fast: 4
state_dir: /var/lib/dayforge
catch_up_window: null
adapters:
  acquire: { program: "/usr/local/bin/fetch", args: ["--all"] }
  notify_webhook: "https://hooks.example.com/pipeline"
"#;
        let config = PipelineConfig::from_yaml(raw).unwrap();
        assert_eq!(config.threshold, 6);
        assert_eq!(config.schedule_slots[1].tag, "backup");
        assert_eq!(config.schedule_slots[0].time, time(9, 30));
        assert_eq!(config.daily_reset_time, time(1, 0));
        assert_eq!(
            config.stage_timeout(StageKind::Uploading),
            Duration::from_secs(1800)
        );
        // Stages missing from the map fall back to defaults.
        assert_eq!(
            config.stage_timeout(StageKind::Notifying),
            Duration::from_secs(120)
        );
        assert_eq!(config.catch_up_window, None);
        assert_eq!(
            config.adapters.acquire.as_ref().unwrap().args,
            vec!["--all".to_string()]
        );
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/dayforge"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_bad_time() {
        let raw = "daily_reset_time: \"25:99\"\n";
        let err = PipelineConfig::from_yaml(raw).unwrap_err();
        assert!(err.to_string().contains("HH:MM"));
    }

    #[test]
    fn test_validation_no_slots() {
        let config = PipelineConfig::default().with_schedule_slots(vec![]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("schedule_slots"));
    }

    #[test]
    fn test_validation_duplicate_slot() {
        let config = PipelineConfig::default().with_schedule_slots(vec![
            ScheduleSlot::new(time(9, 30), "primary"),
            ScheduleSlot::new(time(9, 30), "primary"),
        ]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicates"));
    }

    #[test]
    fn test_validation_zero_threshold() {
        let config = PipelineConfig::default().with_threshold(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("threshold"));
    }

    #[test]
    fn test_validation_zero_retry_limit() {
        let config = PipelineConfig::default().with_retry_limit(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("per_stage_retry_limit"));
    }

    #[test]
    fn test_validation_zero_stage_timeout() {
        let config =
            PipelineConfig::default().with_stage_timeout(StageKind::Uploading, Duration::ZERO);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("per_stage_timeout_secs.uploading"));
    }

    #[test]
    fn test_validation_backoff_cap() {
        let config = PipelineConfig::default()
            .with_retry_backoff(Duration::from_secs(120), Duration::from_secs(60));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry_backoff_max_secs"));
    }

    #[test]
    fn test_validation_inverted_catch_up_window() {
        let config = PipelineConfig::default().with_catch_up_window(Some(CatchUpWindow {
            start: time(17, 0),
            end: time(9, 0),
        }));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("catch_up_window"));
    }

    #[test]
    fn test_business_date() {
        let config = PipelineConfig::default().with_daily_reset_time(time(1, 0));
        let date = NaiveDate::from_ymd_opt(2024, 7, 5).unwrap();

        let before = date.and_hms_opt(0, 30, 0).unwrap();
        assert_eq!(config.business_date(before), date.pred_opt().unwrap());

        let after = date.and_hms_opt(1, 0, 0).unwrap();
        assert_eq!(config.business_date(after), date);
    }

    #[test]
    fn test_slot_parse() {
        let slot = ScheduleSlot::parse("13:30", "backup").unwrap();
        assert_eq!(slot.time, time(13, 30));
        assert!(ScheduleSlot::parse("1330", "backup").is_err());
    }

    #[test]
    fn test_parse_env_value() {
        let value: u32 = parse_env_value(" 12 ", "TEST").unwrap();
        assert_eq!(value, 12);
        let err = parse_env_value::<u32>("twelve", "TEST").unwrap_err();
        assert!(err.to_string().contains("TEST"));
    }
}
