//! Capability adapters over device links.
//!
//! These bind a [`DeviceLink`] to one of the capability traits: [`LinearAxis`] is a
//! `Movable` stage axis with travel limits and a backlash allowance, [`PowerMeter`] is a
//! `Readable`, [`TriggerSource`] is a `Triggerable`.

use crate::error::{GatorError, GatorResult};
use crate::geometry::Axis;
use crate::hardware::capabilities::{Movable, Readable, Triggerable};
use crate::hardware::link::{DeviceCommand, DeviceId, DeviceLink, PollState, StatusSnapshot};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Inclusive travel range of an axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TravelLimits {
    /// Lowest reachable position
    pub min: f64,
    /// Highest reachable position
    pub max: f64,
}

impl TravelLimits {
    /// Limits spanning `[min, max]`.
    ///
    /// # Errors
    /// `InvalidParameter` unless `min < max` and both are finite.
    pub fn new(min: f64, max: f64) -> GatorResult<Self> {
        if !(min.is_finite() && max.is_finite() && min < max) {
            return Err(GatorError::InvalidParameter(format!(
                "invalid travel limits [{}, {}]",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// True when `position` lies within the travel.
    pub fn contains(&self, position: f64) -> bool {
        position >= self.min && position <= self.max
    }

    /// Fail with `OutOfRange` when `target` lies outside the travel.
    pub fn check(&self, axis: Axis, target: f64) -> GatorResult<()> {
        if self.contains(target) {
            Ok(())
        } else {
            Err(GatorError::OutOfRange {
                axis: axis.to_string(),
                target,
                min: self.min,
                max: self.max,
            })
        }
    }
}

// =============================================================================
// LinearAxis
// =============================================================================

/// One motorized stage axis.
#[derive(Debug, Clone)]
pub struct LinearAxis {
    axis: Axis,
    link: Arc<DeviceLink>,
    limits: TravelLimits,
    backlash: f64,
}

impl LinearAxis {
    /// Bind `link` as `axis`.
    ///
    /// # Errors
    /// `InvalidParameter` for a negative or non-finite backlash.
    pub fn new(
        axis: Axis,
        link: Arc<DeviceLink>,
        limits: TravelLimits,
        backlash: f64,
    ) -> GatorResult<Self> {
        if !(backlash.is_finite() && backlash >= 0.0) {
            return Err(GatorError::InvalidParameter(format!(
                "backlash of axis {} must be a non-negative number, got {}",
                axis, backlash
            )));
        }
        Ok(Self {
            axis,
            link,
            limits,
            backlash,
        })
    }

    /// Which stage axis this is.
    pub fn axis(&self) -> Axis {
        self.axis
    }

    /// Identity of the driving device.
    pub fn device(&self) -> &DeviceId {
        self.link.id()
    }

    /// Travel limits.
    pub fn limits(&self) -> TravelLimits {
        self.limits
    }

    /// Backlash allowance (zero disables the overshoot approach).
    pub fn backlash(&self) -> f64 {
        self.backlash
    }

    /// Underlying link.
    pub fn link(&self) -> &Arc<DeviceLink> {
        &self.link
    }

    /// Last published position, `None` before the first status.
    pub fn cached_position(&self) -> Option<f64> {
        self.link.latest_status().and_then(|s| s.position)
    }

    /// Subscribe to this axis's status snapshots.
    pub fn subscribe_status(&self) -> watch::Receiver<Option<Arc<StatusSnapshot>>> {
        self.link.subscribe_status()
    }

    /// Subscribe to this axis's polling state.
    pub fn subscribe_poll_state(&self) -> watch::Receiver<PollState> {
        self.link.subscribe_poll_state()
    }

    fn stale(&self) -> GatorError {
        GatorError::StalePosition(self.axis.to_string())
    }
}

#[async_trait]
impl Movable for LinearAxis {
    async fn move_abs(&self, position: f64) -> GatorResult<()> {
        self.limits.check(self.axis, position)?;
        self.link.send(DeviceCommand::MoveAbsolute(position)).await
    }

    async fn move_rel(&self, distance: f64) -> GatorResult<()> {
        let current = self.cached_position().ok_or_else(|| self.stale())?;
        self.limits.check(self.axis, current + distance)?;
        self.link.send(DeviceCommand::MoveRelative(distance)).await
    }

    async fn position(&self) -> GatorResult<f64> {
        self.cached_position().ok_or_else(|| self.stale())
    }

    async fn stop(&self) -> GatorResult<()> {
        self.link.send(DeviceCommand::Stop).await
    }

    async fn home(&self) -> GatorResult<()> {
        self.link.send(DeviceCommand::Home).await
    }
}

// =============================================================================
// PowerMeter
// =============================================================================

/// Scalar instrument read through a fresh status request.
#[derive(Debug, Clone)]
pub struct PowerMeter {
    link: Arc<DeviceLink>,
}

impl PowerMeter {
    /// Bind `link` as a readable instrument.
    pub fn new(link: Arc<DeviceLink>) -> Self {
        Self { link }
    }
}

#[async_trait]
impl Readable for PowerMeter {
    async fn read(&self) -> GatorResult<f64> {
        let snapshot = self.link.poll_once().await?;
        snapshot
            .reading
            .ok_or_else(|| GatorError::io(self.link.id().as_str(), "status carried no reading"))
    }
}

// =============================================================================
// TriggerSource
// =============================================================================

/// Armable, software-triggered device.
#[derive(Debug)]
pub struct TriggerSource {
    link: Arc<DeviceLink>,
    armed: AtomicBool,
}

impl TriggerSource {
    /// Bind `link` as a trigger source.
    pub fn new(link: Arc<DeviceLink>) -> Self {
        Self {
            link,
            armed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Triggerable for TriggerSource {
    async fn arm(&self) -> GatorResult<()> {
        self.link.send(DeviceCommand::Arm).await?;
        self.armed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn trigger(&self) -> GatorResult<()> {
        if !self.armed.load(Ordering::SeqCst) {
            return Err(GatorError::InvalidParameter(format!(
                "{} is not armed",
                self.link.id()
            )));
        }
        self.link.send(DeviceCommand::Trigger).await
    }

    async fn is_armed(&self) -> GatorResult<bool> {
        Ok(self.armed.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::link::LinkOptions;
    use crate::hardware::mock::{MockAxis, MockInstrument};

    #[test]
    fn limits_are_inclusive() {
        let limits = TravelLimits::new(0.0, 25.0).unwrap();
        assert!(limits.check(Axis::X, 0.0).is_ok());
        assert!(limits.check(Axis::X, 25.0).is_ok());
        assert!(matches!(
            limits.check(Axis::X, 25.0001),
            Err(GatorError::OutOfRange { .. })
        ));
        assert!(TravelLimits::new(5.0, 5.0).is_err());
    }

    #[tokio::test]
    async fn axis_rejects_out_of_range_before_sending() {
        let mock = Arc::new(MockAxis::new());
        let link = DeviceLink::connect(DeviceId::new("x"), mock.clone(), LinkOptions::default())
            .await
            .unwrap();
        let axis = LinearAxis::new(Axis::X, link, TravelLimits::new(0.0, 10.0).unwrap(), 0.0)
            .unwrap();

        assert!(axis.move_abs(11.0).await.is_err());
        assert!(mock.commands().is_empty());

        assert_eq!(
            axis.move_rel(1.0).await,
            Err(GatorError::StalePosition("x".into()))
        );

        axis.move_abs(4.0).await.unwrap();
        assert_eq!(mock.commands(), vec![DeviceCommand::MoveAbsolute(4.0)]);
    }

    #[tokio::test]
    async fn meter_and_trigger() {
        let instrument = Arc::new(MockInstrument::new(0.25));
        let link = DeviceLink::connect(
            DeviceId::new("meter"),
            instrument.clone(),
            LinkOptions::default(),
        )
        .await
        .unwrap();

        let meter = PowerMeter::new(link.clone());
        assert_eq!(meter.read().await.unwrap(), 0.25);

        let trigger = TriggerSource::new(link);
        assert!(trigger.trigger().await.is_err());
        trigger.arm().await.unwrap();
        trigger.trigger().await.unwrap();
        assert!(trigger.is_armed().await.unwrap());
        assert_eq!(instrument.trigger_count(), 1);
    }
}
