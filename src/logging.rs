//! Tracing setup for the library and the CLI.
//!
//! Events carry structured fields (`device`, `axis`, `cmd`/`act` positions). The configured
//! level applies to this crate only; dependencies stay at `warn` unless a per-target
//! override in `application.log_targets` says otherwise. `RUST_LOG` replaces the whole
//! filter when set.
//!
//! # Example
//! ```no_run
//! use rust_gator::{config::GatorConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatorConfig::load_from("config/default.toml")?;
//! logging::init_from_config(&config)?;
//! tracing::info!("Alignment session starting");
//! # Ok(())
//! # }
//! ```

use crate::config::{ApplicationConfig, GatorConfig};
use crate::error::{GatorError, GatorResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const CRATE_TARGET: &str = "rust_gator";

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, coloured (interactive sessions)
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for OutputFormat {
    type Err = GatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(GatorError::Configuration(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                other
            ))),
        }
    }
}

/// What to log and how.
#[derive(Debug, Clone, PartialEq)]
pub struct TracingConfig {
    /// Level for events from this crate
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Per-target levels, e.g. `("rust_gator::supervisor", DEBUG)` or `("tokio", INFO)`
    pub targets: Vec<(String, Level)>,
    /// Source file and line on every event
    pub with_file_and_line: bool,
}

impl TracingConfig {
    /// Crate-level `level`, compact output, no overrides.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::default(),
            targets: Vec::new(),
            with_file_and_line: false,
        }
    }

    /// Everything in the `[application]` section.
    ///
    /// # Errors
    /// `Configuration` for an unknown level name.
    pub fn from_application(application: &ApplicationConfig) -> GatorResult<Self> {
        let targets = application
            .log_targets
            .iter()
            .map(|(target, level)| Ok((target.clone(), parse_log_level(level)?)))
            .collect::<GatorResult<_>>()?;
        Ok(Self {
            level: parse_log_level(&application.log_level)?,
            format: application.log_format,
            targets,
            with_file_and_line: application.log_file_and_line,
        })
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Add a per-target level.
    pub fn with_target(mut self, target: impl Into<String>, level: Level) -> Self {
        self.targets.push((target.into(), level));
        self
    }

    /// `EnvFilter` directives equivalent to this configuration.
    pub fn filter_directives(&self) -> String {
        let mut directives = vec![
            "warn".to_string(),
            format!("{}={}", CRATE_TARGET, level_name(self.level)),
        ];
        directives.extend(
            self.targets
                .iter()
                .map(|(target, level)| format!("{}={}", target, level_name(*level))),
        );
        directives.join(",")
    }
}

/// Initialize tracing from a loaded configuration.
pub fn init_from_config(config: &GatorConfig) -> GatorResult<()> {
    init(TracingConfig::from_application(&config.application)?)
}

/// Install the global subscriber.
///
/// Returns `Ok(())` without changes when one is already installed (tests, embedding
/// applications).
pub fn init(config: TracingConfig) -> GatorResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.filter_directives()).map_err(|e| {
            GatorError::Configuration(format!("Invalid log filter: {}", e))
        })?,
    };

    let base = fmt::layer()
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line);
    let fmt_layer = match config.format {
        OutputFormat::Pretty => base.pretty().boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().boxed(),
    };

    // try_init only fails when another thread installed a subscriber first
    if tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .try_init()
        .is_err()
    {
        tracing::debug!("Subscriber already installed; keeping it");
    }
    Ok(())
}

/// Parse a level name (case-insensitive).
pub fn parse_log_level(level: &str) -> GatorResult<Level> {
    Level::from_str(level).map_err(|_| {
        GatorError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))
    })
}

fn level_name(level: Level) -> String {
    level.as_str().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("Debug").unwrap(), Level::DEBUG);
        assert!(matches!(
            parse_log_level("verbose"),
            Err(GatorError::Configuration(_))
        ));
    }

    #[test]
    fn test_application_section_maps_to_tracing() {
        let mut config = GatorConfig::default();
        config.application.log_level = "debug".into();
        config.application.log_format = OutputFormat::Json;
        config
            .application
            .log_targets
            .insert("rust_gator::supervisor".into(), "trace".into());

        let tracing_config = TracingConfig::from_application(&config.application).unwrap();
        assert_eq!(tracing_config.level, Level::DEBUG);
        assert_eq!(tracing_config.format, OutputFormat::Json);
        assert_eq!(
            tracing_config.filter_directives(),
            "warn,rust_gator=debug,rust_gator::supervisor=trace"
        );

        config
            .application
            .log_targets
            .insert("tokio".into(), "loud".into());
        assert!(TracingConfig::from_application(&config.application).is_err());
    }

    #[test]
    fn test_default_filter_scopes_level_to_crate() {
        let config = TracingConfig::new(Level::INFO).with_target("tokio", Level::DEBUG);
        assert_eq!(config.filter_directives(), "warn,rust_gator=info,tokio=debug");
        assert!(EnvFilter::try_new(config.filter_directives()).is_ok());
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        init(TracingConfig::new(Level::WARN)).unwrap();
        init(TracingConfig::new(Level::WARN).with_format(OutputFormat::Json)).unwrap();
    }
}
