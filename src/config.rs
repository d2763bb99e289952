//! Configuration System using Figment
//!
//! Strongly-typed configuration for an alignment session. Values are layered:
//! 1. built-in defaults (every section is optional)
//! 2. a TOML file (`config/default.toml` by convention)
//! 3. environment variables prefixed with `RUST_GATOR_`, nested with `__`
//!    (e.g. `RUST_GATOR_POLLING__INTERVAL=20ms`)
//!
//! Durations are written in humantime form (`50ms`, `2s`).
//!
//! # Example
//! ```no_run
//! use rust_gator::config::GatorConfig;
//!
//! let config = GatorConfig::load_from("config/default.toml")?;
//! config.validate()?;
//! println!("polling every {:?}", config.polling.interval);
//! # Ok::<(), rust_gator::error::GatorError>(())
//! ```

use crate::calibration::{AffineTransform, DEFAULT_MAX_CONDITION};
use crate::error::{GatorError, GatorResult};
use crate::geometry::Axis;
use crate::hardware::capabilities::Capability;
use crate::hardware::link::LinkOptions;
use crate::logging::OutputFormat;
use crate::stage::MotionDefaults;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "RUST_GATOR_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatorConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Status polling and liveness
    #[serde(default)]
    pub polling: PollingConfig,
    /// Motion defaults
    #[serde(default)]
    pub motion: MotionConfig,
    /// Calibration persistence and conditioning
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Motorized axes
    #[serde(default)]
    pub axes: Vec<AxisConfig>,
    /// Non-motion instruments
    #[serde(default)]
    pub auxiliaries: Vec<AuxiliaryConfig>,
    /// Named stage positions
    #[serde(default)]
    pub stage: StagePositionsConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level for this crate (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log line format
    #[serde(default)]
    pub log_format: OutputFormat,
    /// Per-target levels (`"rust_gator::supervisor" = "debug"`)
    #[serde(default)]
    pub log_targets: BTreeMap<String, String>,
    /// Source file and line on every event
    #[serde(default)]
    pub log_file_and_line: bool,
}

/// Polling and liveness configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Status request interval
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Deadline for a single connect, command or status request
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Liveness threshold; unset disables monitoring
    #[serde(default, with = "humantime_serde")]
    pub liveness_timeout: Option<Duration>,
    /// Per-device message queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Motion defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Settle tolerance in stage units
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Deadline per motion request
    #[serde(default = "default_motion_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Calibration configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Saved matrix loaded at startup when present
    #[serde(default)]
    pub matrix_path: Option<PathBuf>,
    /// Inline matrix `[a, b, c, d, e, f]`; takes precedence over `matrix_path`
    #[serde(default)]
    pub matrix: Option<AffineTransform>,
    /// Ceiling for the condition number of a solve
    #[serde(default = "default_max_condition")]
    pub max_condition: f64,
}

/// One motorized axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Which stage axis the device drives
    pub axis: Axis,
    /// Device identity (serial number)
    pub device: String,
    /// Lower travel limit
    pub min: f64,
    /// Upper travel limit
    pub max: f64,
    /// Backlash allowance; zero disables the two-phase approach
    #[serde(default)]
    pub backlash: f64,
    /// Simulated speed for mock runs (units per second)
    #[serde(default)]
    pub mock_speed: Option<f64>,
}

/// One auxiliary instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryConfig {
    /// Name the stage exposes it under
    pub name: String,
    /// Device identity
    pub device: String,
    /// Exposed capabilities (`readable`, `triggerable`)
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Simulated reading for mock runs
    #[serde(default)]
    pub mock_reading: Option<f64>,
}

/// Named stage positions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagePositionsConfig {
    /// Position for loading a chip
    #[serde(default)]
    pub loaded_position: Option<BTreeMap<Axis, f64>>,
    /// Parking position
    #[serde(default)]
    pub unloaded_position: Option<BTreeMap<Axis, f64>>,
}

// Default value functions
fn default_name() -> String {
    "rust-gator".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_request_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_queue_capacity() -> usize {
    256
}

fn default_tolerance() -> f64 {
    1e-3
}

fn default_motion_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_condition() -> f64 {
    DEFAULT_MAX_CONDITION
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
            log_targets: BTreeMap::new(),
            log_file_and_line: false,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            request_timeout: default_request_timeout(),
            liveness_timeout: None,
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            timeout: default_motion_timeout(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            matrix_path: None,
            matrix: None,
            max_condition: default_max_condition(),
        }
    }
}

impl PollingConfig {
    /// Link options derived from this section.
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            request_timeout: self.request_timeout,
            queue_capacity: self.queue_capacity,
        }
    }
}

impl MotionConfig {
    /// Stage defaults derived from this section.
    pub fn defaults(&self) -> MotionDefaults {
        MotionDefaults {
            tolerance: self.tolerance,
            timeout: self.timeout,
        }
    }
}

impl GatorConfig {
    /// Load configuration from a TOML file and `RUST_GATOR_` environment variables.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> GatorResult<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Parse configuration from a TOML string (no environment layer).
    pub fn from_toml_str(text: &str) -> GatorResult<Self> {
        Ok(Figment::new().merge(Toml::string(text)).extract()?)
    }

    /// Validate configuration after loading.
    ///
    /// # Errors
    /// `Configuration` naming the first offending value.
    pub fn validate(&self) -> GatorResult<()> {
        let fail = |msg: String| -> GatorResult<()> { Err(GatorError::Configuration(msg)) };

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return fail(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }
        for (target, level) in &self.application.log_targets {
            if !valid_levels.contains(&level.as_str()) {
                return fail(format!("Invalid level '{}' for log target {}", level, target));
            }
        }

        if self.polling.interval.is_zero() {
            return fail("polling.interval must be positive".into());
        }
        if self.polling.request_timeout.is_zero() {
            return fail("polling.request_timeout must be positive".into());
        }
        if self.polling.liveness_timeout == Some(Duration::ZERO) {
            return fail("polling.liveness_timeout must be positive when set".into());
        }
        if self.polling.queue_capacity == 0 {
            return fail("polling.queue_capacity must be at least 1".into());
        }

        if !(self.motion.tolerance > 0.0 && self.motion.tolerance.is_finite()) {
            return fail(format!(
                "motion.tolerance must be positive, got {}",
                self.motion.tolerance
            ));
        }
        if !(self.calibration.max_condition.is_finite() && self.calibration.max_condition >= 1.0) {
            return fail(format!(
                "calibration.max_condition must be >= 1, got {}",
                self.calibration.max_condition
            ));
        }

        let mut axes = HashSet::new();
        let mut devices = HashSet::new();
        for axis in &self.axes {
            if !axes.insert(axis.axis) {
                return fail(format!("Duplicate axis: {}", axis.axis));
            }
            if !devices.insert(axis.device.as_str()) {
                return fail(format!("Duplicate device: {}", axis.device));
            }
            if !(axis.min.is_finite() && axis.max.is_finite() && axis.min < axis.max) {
                return fail(format!(
                    "axis {}: travel [{}, {}] is empty",
                    axis.axis, axis.min, axis.max
                ));
            }
            if !(axis.backlash.is_finite() && axis.backlash >= 0.0) {
                return fail(format!("axis {}: backlash must be >= 0", axis.axis));
            }
            if axis.mock_speed.is_some_and(|speed| !(speed > 0.0)) {
                return fail(format!("axis {}: mock_speed must be positive", axis.axis));
            }
        }
        if !self.axes.is_empty() {
            for required in [Axis::X, Axis::Y] {
                if !axes.contains(&required) {
                    return fail(format!("stage needs a {} axis", required));
                }
            }
        }

        let mut names = HashSet::new();
        for auxiliary in &self.auxiliaries {
            if !names.insert(auxiliary.name.as_str()) {
                return fail(format!("Duplicate auxiliary: {}", auxiliary.name));
            }
            if !devices.insert(auxiliary.device.as_str()) {
                return fail(format!("Duplicate device: {}", auxiliary.device));
            }
            if auxiliary.capabilities.contains(&Capability::Movable) {
                return fail(format!(
                    "auxiliary {}: movable devices belong in [[axes]]",
                    auxiliary.name
                ));
            }
        }

        for (label, position) in [
            ("loaded_position", &self.stage.loaded_position),
            ("unloaded_position", &self.stage.unloaded_position),
        ] {
            let Some(position) = position else { continue };
            for (axis, target) in position {
                let Some(config) = self.axes.iter().find(|a| a.axis == *axis) else {
                    return fail(format!("stage.{}: axis {} is not configured", label, axis));
                };
                if !(*target >= config.min && *target <= config.max) {
                    return fail(format!(
                        "stage.{}: {} = {} is outside [{}, {}]",
                        label, axis, target, config.min, config.max
                    ));
                }
            }
        }

        Ok(())
    }
}
