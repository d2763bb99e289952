//! Custom error types for the alignment core.
//!
//! This module defines the primary error type, `GatorError`, shared by every layer of the
//! crate. Using the `thiserror` crate, it provides a single taxonomy for device, motion and
//! calibration failures so that the orchestration layers can propagate a child failure to
//! their caller without re-wrapping it.
//!
//! ## Error Categories
//!
//! - **Device lifecycle**: `NotFound`, `AlreadyOpen`, `NotConnected`.
//! - **Transient I/O**: `Io` and `Timeout`. These are retried locally by the polling
//!   supervisor and only reach a caller when they happen on a direct request.
//! - **Motion**: `OutOfRange`, `Timeout`, `Cancelled`, `Faulted`, `DeviceError`,
//!   `StalePosition`.
//! - **Calibration**: `Uncalibrated`, `Underdetermined`, `Singular`.
//! - **Input**: `InvalidParameter`, `Configuration`.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type GatorResult<T> = std::result::Result<T, GatorError>;

/// Primary error type for device, motion and calibration operations.
///
/// The type is `Clone` so that per-axis outcomes can be collected into reports and
/// broadcast to several waiters. Wrapped I/O errors are therefore stored as messages.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatorError {
    /// No transport is known for the requested device identity.
    #[error("Device '{0}' not found")]
    NotFound(String),

    /// The device identity already has a live (or opening) handle.
    #[error("Device '{0}' is already open")]
    AlreadyOpen(String),

    /// The handle is stale or the device was closed.
    #[error("Device '{0}' is not connected")]
    NotConnected(String),

    /// Transport or file I/O failed. Retryable.
    #[error("I/O error on '{target}': {message}")]
    Io {
        /// Device identity or file path the operation addressed
        target: String,
        /// Underlying error description
        message: String,
    },

    /// An argument was rejected before any side effect happened.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A move target lies outside the configured travel of an axis.
    #[error("Target {target} on axis {axis} is outside travel [{min}, {max}]")]
    OutOfRange {
        /// Axis name
        axis: String,
        /// Requested position
        target: f64,
        /// Lower travel limit
        min: f64,
        /// Upper travel limit
        max: f64,
    },

    /// A deadline elapsed without an answer or without the axes settling.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// An in-flight move was aborted by an explicit stop.
    #[error("Motion cancelled by stop request")]
    Cancelled,

    /// A device stopped talking for longer than its liveness threshold.
    #[error("Device '{0}' is faulted (liveness timeout)")]
    Faulted(String),

    /// The device pushed an `Error` message while a move was waiting on it.
    #[error("Device '{device}' reported error code {code:#x}")]
    DeviceError {
        /// Device identity
        device: String,
        /// Device-specific error code
        code: u32,
    },

    /// No transform has been solved or loaded.
    #[error("Stage is not calibrated")]
    Uncalibrated,

    /// Not enough distinct correspondences to solve the transform.
    #[error("Need at least {required} distinct correspondences, got {got}")]
    Underdetermined {
        /// Minimum number of distinct points
        required: usize,
        /// Distinct points supplied
        got: usize,
    },

    /// The point set (or the resulting matrix) is degenerate or badly conditioned.
    #[error("Degenerate geometry (condition number {condition:e})")]
    Singular {
        /// Estimated condition number, `inf` for exactly singular systems
        condition: f64,
    },

    /// A relative move or position read needs a status that never arrived.
    #[error("Position of axis {0} is unknown (no status received yet)")]
    StalePosition(String),

    /// Configuration values parsed but failed semantic validation.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl GatorError {
    /// Build an `Io` error from anything displayable.
    pub fn io(target: impl Into<String>, message: impl ToString) -> Self {
        GatorError::Io {
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Whether the failure is worth retrying on the next poll tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatorError::Io { .. } | GatorError::Timeout(_))
    }
}

impl From<figment::Error> for GatorError {
    fn from(value: figment::Error) -> Self {
        GatorError::Configuration(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(GatorError::io("x_motor", "broken pipe").is_transient());
        assert!(GatorError::Timeout(Duration::from_millis(5)).is_transient());
        assert!(!GatorError::Cancelled.is_transient());
        assert!(!GatorError::Uncalibrated.is_transient());
        assert!(!GatorError::NotConnected("x_motor".into()).is_transient());
    }

    #[test]
    fn messages_name_the_device() {
        let err = GatorError::AlreadyOpen("27500001".into());
        assert_eq!(err.to_string(), "Device '27500001' is already open");

        let err = GatorError::OutOfRange {
            axis: "x".into(),
            target: 30.0,
            min: 0.0,
            max: 25.0,
        };
        assert!(err.to_string().contains("[0, 25]"));
    }
}
