//! Rig configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/rig.toml` (base configuration)
//! 2. Environment variables prefixed with `LICKRIG_`, nested with `__`
//!
//! Every section has defaults, so an empty file yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use lickport_rig::config::RigConfig;
//!
//! let config = RigConfig::load()?;
//! println!("Motor board on {}", config.motor.port);
//! # Ok::<(), lickport_rig::error::RigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigurationError, RigResult};
use crate::logging::OutputFormat;
use crate::schedule::{IntervalSpec, ScheduleRequest};

/// Number of stimulus slots (valves) on the rig.
pub const STIMULUS_SLOTS: usize = 8;

/// Top-level rig configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Door/valve peripheral
    pub motor: LinkConfig,
    /// Lick-sensing peripheral
    pub laser: LinkConfig,
    /// Fixed durations and thresholds of the state machine
    pub timing: TimingConfig,
    /// Defaults for schedule generation
    pub schedule: ScheduleDefaults,
    /// Export settings
    pub export: ExportConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Lickport Rig".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// Serial settings for one peripheral
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial port path (e.g., "/dev/ttyACM0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115_200,
        }
    }
}

/// State machine constants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Time the door needs to close, independent of trial data
    pub door_travel_ms: u64,
    /// Wait after the stop reset so a last acknowledgement can arrive
    pub stop_grace_ms: u64,
    /// Period of the event queue drain
    pub drain_period_ms: u64,
    /// Upper bound on waiting for the schedule echo
    pub verify_timeout_ms: u64,
    /// Licks on one port during TTC that move the trial to Sample
    pub engagement_threshold: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            door_travel_ms: 1500,
            stop_grace_ms: 500,
            drain_period_ms: 10,
            verify_timeout_ms: 2000,
            engagement_threshold: 3,
        }
    }
}

impl TimingConfig {
    /// Door travel as a `Duration`.
    pub fn door_travel(&self) -> Duration {
        Duration::from_millis(self.door_travel_ms)
    }

    /// Stop grace delay as a `Duration`.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Drain period as a `Duration`, never shorter than 1 ms.
    pub fn drain_period(&self) -> Duration {
        Duration::from_millis(self.drain_period_ms.max(1))
    }

    /// Verification timeout as a `Duration`.
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}

/// Operator-side defaults used to build a [`ScheduleRequest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleDefaults {
    /// Label each slot carries when the operator has not customised it
    pub default_labels: Vec<String>,
    /// Labels the operator entered, one per slot; empty means "use defaults"
    pub labels: Vec<String>,
    /// Number of blocks
    pub block_count: u32,
    /// Inter-trial interval
    pub iti: IntervalSpec,
    /// Time-to-contact window
    pub ttc: IntervalSpec,
    /// Sample phase
    pub sample: IntervalSpec,
}

impl Default for ScheduleDefaults {
    fn default() -> Self {
        Self {
            default_labels: default_labels(),
            labels: Vec::new(),
            block_count: 1,
            iti: IntervalSpec::new(30_000, 5_000),
            ttc: IntervalSpec::new(20_000, 0),
            sample: IntervalSpec::new(10_000, 0),
        }
    }
}

impl ScheduleDefaults {
    /// Build a schedule request from these defaults.
    pub fn to_request(&self) -> ScheduleRequest {
        let labels = if self.labels.is_empty() {
            self.default_labels.clone()
        } else {
            self.labels.clone()
        };
        ScheduleRequest {
            labels,
            default_labels: self.default_labels.clone(),
            block_count: self.block_count,
            iti: self.iti,
            ttc: self.ttc,
            sample: self.sample,
        }
    }
}

fn default_labels() -> Vec<String> {
    (1..=STIMULUS_SLOTS).map(|i| format!("Valve {i}")).collect()
}

/// Export settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Output directory for exported tables
    pub output_dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

impl RigConfig {
    /// Load configuration from `config/rig.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `LICKRIG_`.
    /// Example: `LICKRIG_TIMING__DOOR_TRAVEL_MS=900`
    pub fn load() -> RigResult<Self> {
        Self::load_from("config/rig.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> RigResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(RigConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LICKRIG_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigurationError::InvalidSetting(format!(
                "log_level '{}' must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.timing.drain_period_ms == 0 {
            return Err(ConfigurationError::InvalidSetting(
                "drain_period_ms must be greater than 0".to_string(),
            ));
        }

        if self.timing.engagement_threshold == 0 {
            return Err(ConfigurationError::InvalidSetting(
                "engagement_threshold must be greater than 0".to_string(),
            ));
        }

        if self.schedule.default_labels.len() != STIMULUS_SLOTS {
            return Err(ConfigurationError::InvalidSetting(format!(
                "default_labels must name all {STIMULUS_SLOTS} slots"
            )));
        }

        let mut seen = HashSet::new();
        for label in &self.schedule.default_labels {
            if !seen.insert(label) {
                return Err(ConfigurationError::InvalidSetting(format!(
                    "duplicate default label '{label}'"
                )));
            }
        }

        if !self.motor.port.is_empty() && self.motor.port == self.laser.port {
            return Err(ConfigurationError::InvalidSetting(format!(
                "motor and laser cannot share port {}",
                self.motor.port
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RigConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timing.engagement_threshold, 3);
        assert_eq!(config.schedule.default_labels[0], "Valve 1");
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let mut config = RigConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn shared_port_is_rejected() {
        let mut config = RigConfig::default();
        config.motor.port = "/dev/ttyACM0".to_string();
        config.laser.port = "/dev/ttyACM0".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unvalidated_zero_drain_period_is_clamped() {
        let timing = TimingConfig {
            drain_period_ms: 0,
            ..TimingConfig::default()
        };
        assert_eq!(timing.drain_period(), Duration::from_millis(1));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let mut config = RigConfig::default();
        config.timing.engagement_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_and_env_are_merged() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "rig.toml",
                r#"
                [motor]
                port = "/dev/ttyACM0"

                [laser]
                port = "/dev/ttyACM1"

                [timing]
                door_travel_ms = 900
                "#,
            )?;
            jail.set_env("LICKRIG_TIMING__ENGAGEMENT_THRESHOLD", "5");

            let config = RigConfig::load_from("rig.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.motor.port, "/dev/ttyACM0");
            assert_eq!(config.timing.door_travel_ms, 900);
            assert_eq!(config.timing.engagement_threshold, 5);
            assert_eq!(config.timing.stop_grace_ms, 500);
            Ok(())
        });
    }
}
