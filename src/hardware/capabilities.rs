//! Atomic Hardware Capabilities
//!
//! Devices are described by the small capability traits they support rather than by one
//! monolithic device trait:
//!
//! - a linear axis implements `Movable`
//! - a power meter implements `Readable`
//! - a laser or pulse generator used as a trigger implements `Triggerable`
//!
//! Each trait is async (`#[async_trait]`), thread-safe (`Send + Sync`) and reports failures
//! through [`GatorResult`]. Implementations use interior mutability; every method takes
//! `&self`.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn peak_power<S, M>(stage: &S, meter: &M, positions: &[f64]) -> GatorResult<f64>
//! where
//!     S: Movable,
//!     M: Readable,
//! {
//!     let mut best = f64::MIN;
//!     for &position in positions {
//!         stage.move_abs(position).await?;
//!         best = best.max(meter.read().await?);
//!     }
//!     Ok(best)
//! }
//! ```

use crate::error::{GatorError, GatorResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Capabilities a configured device can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Positioning
    Movable,
    /// Scalar readout
    Readable,
    /// Arm and software trigger
    Triggerable,
}

/// Capability: Motion Control
///
/// Devices that can move to positions (linear stages, rotation mounts).
///
/// # Contract
/// - Positions are in device-native units (typically mm or degrees)
/// - `move_abs` and `move_rel` initiate motion and return before completion
/// - `position` returns the last reported position, which lags during motion
#[async_trait]
pub trait Movable: Send + Sync {
    /// Start a move to an absolute position.
    ///
    /// # Errors
    /// `OutOfRange` when the target is outside the device's travel, or a transport error.
    async fn move_abs(&self, position: f64) -> GatorResult<()>;

    /// Start a move by `distance` from the current position.
    async fn move_rel(&self, distance: f64) -> GatorResult<()>;

    /// Last reported position.
    async fn position(&self) -> GatorResult<f64>;

    /// Halt motion immediately.
    async fn stop(&self) -> GatorResult<()>;

    /// Find the mechanical zero.
    ///
    /// # Default Implementation
    /// Returns `InvalidParameter`: homing is not supported.
    async fn home(&self) -> GatorResult<()> {
        Err(GatorError::InvalidParameter(
            "Homing not supported by this device".into(),
        ))
    }
}

/// Capability: Scalar Readout
///
/// Devices that produce single scalar values (power meters, photodiodes).
/// Units are device-specific.
#[async_trait]
pub trait Readable: Send + Sync {
    /// Perform a measurement and return its value.
    async fn read(&self) -> GatorResult<f64>;
}

/// Capability: External Triggering
///
/// Devices that can be armed and triggered. Calling `trigger()` on an unarmed device is an
/// error.
#[async_trait]
pub trait Triggerable: Send + Sync {
    /// Prepare the device for a trigger.
    async fn arm(&self) -> GatorResult<()>;

    /// Send a software trigger. The device must be armed first.
    async fn trigger(&self) -> GatorResult<()>;

    /// Whether the device is currently armed.
    async fn is_armed(&self) -> GatorResult<bool> {
        Err(GatorError::InvalidParameter(
            "Armed state query not supported by this device".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Pulser {
        armed: AtomicBool,
    }

    #[async_trait]
    impl Triggerable for Pulser {
        async fn arm(&self) -> GatorResult<()> {
            self.armed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn trigger(&self) -> GatorResult<()> {
            if !self.armed.swap(false, Ordering::SeqCst) {
                return Err(GatorError::InvalidParameter("Pulser not armed".into()));
            }
            Ok(())
        }
    }

    struct Fixed;

    #[async_trait]
    impl Movable for Fixed {
        async fn move_abs(&self, _position: f64) -> GatorResult<()> {
            Ok(())
        }
        async fn move_rel(&self, _distance: f64) -> GatorResult<()> {
            Ok(())
        }
        async fn position(&self) -> GatorResult<f64> {
            Ok(0.0)
        }
        async fn stop(&self) -> GatorResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn trigger_requires_arm() {
        let pulser = Pulser {
            armed: AtomicBool::new(false),
        };
        assert!(pulser.trigger().await.is_err());
        pulser.arm().await.unwrap();
        pulser.trigger().await.unwrap();
        assert!(pulser.is_armed().await.is_err());
    }

    #[tokio::test]
    async fn homing_defaults_to_unsupported() {
        assert!(matches!(
            Fixed.home().await,
            Err(GatorError::InvalidParameter(_))
        ));
    }

    #[test]
    fn capability_names_are_lowercase() {
        let parsed: Vec<Capability> = serde_json::from_str(r#"["readable", "triggerable"]"#).unwrap();
        assert_eq!(parsed, vec![Capability::Readable, Capability::Triggerable]);
    }
}
