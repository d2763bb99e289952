//! Design-space motion.
//!
//! The planner sits between the calibration and the stage: it turns a design coordinate
//! into a stage target, moves there and reports how close the stage actually got.
//! Calibration failures (`Uncalibrated`) and stage failures (`Timeout`, `Cancelled`,
//! `Faulted`, `OutOfRange`) reach the caller unchanged.

use crate::calibration::CalibrationEngine;
use crate::error::GatorResult;
use crate::geometry::{Correspondence, DesignPoint, StagePoint};
use crate::stage::StageController;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Calibration state shared between the planner and its owner.
pub type SharedCalibration = Arc<RwLock<CalibrationEngine>>;

/// Moves the stage in design coordinates.
#[derive(Debug, Clone)]
pub struct MotionPlanner {
    calibration: SharedCalibration,
    stage: Arc<StageController>,
}

impl MotionPlanner {
    /// Planner over `stage` using `calibration`.
    pub fn new(calibration: SharedCalibration, stage: Arc<StageController>) -> Self {
        Self { calibration, stage }
    }

    /// The calibration in use.
    pub fn calibration(&self) -> &SharedCalibration {
        &self.calibration
    }

    /// The stage being driven.
    pub fn stage(&self) -> &Arc<StageController> {
        &self.stage
    }

    /// Move to the stage position of a design point and wait until it settles.
    ///
    /// Returns the commanded stage target.
    pub async fn move_to_design_point(
        &self,
        point: DesignPoint,
        tolerance: Option<f64>,
        timeout: Option<Duration>,
    ) -> GatorResult<StagePoint> {
        point.ensure_finite("design point")?;
        let target = self.calibration.read().transform(point)?;
        tracing::debug!(design = %point, stage = %target, "Moving to design point");

        self.stage.move_absolute(target, tolerance, timeout).await?;

        if let Ok(actual) = self.stage.current_position() {
            tracing::info!(
                cmd = %target,
                act = %actual,
                err_x = actual.x - target.x,
                err_y = actual.y - target.y,
                "Reached design point {}",
                point
            );
        }
        Ok(target)
    }

    /// Current stage position expressed in design coordinates.
    pub fn current_design_position(&self) -> GatorResult<DesignPoint> {
        let position = self.stage.current_position()?;
        self.calibration.read().inverse_transform(position)
    }

    /// Pair `design` with the current stage position and add it to the calibration.
    pub fn record_correspondence(&self, design: DesignPoint) -> GatorResult<Correspondence> {
        let stage = self.stage.current_position()?;
        self.calibration.write().add_correspondence(design, stage)?;
        Ok(Correspondence::new(design, stage))
    }
}
