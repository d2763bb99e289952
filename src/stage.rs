//! Multi-axis stage controller.
//!
//! [`StageController`] coordinates a set of [`LinearAxis`] adapters as one positioning
//! device. A motion request is validated up front (unknown axis, bad tolerance, target out
//! of travel, link closed), so a rejected request has no side effect. Accepted requests
//! dispatch every axis concurrently and then wait on the axes' status and state channels
//! until each axis is within tolerance of its target, the deadline passes, a device faults
//! or a stop is requested.
//!
//! Axes with a backlash allowance approach targets below their current position in two
//! phases: first to `target - 1.5 * backlash`, then up to the target, so the final
//! approach always comes from the same side.
//!
//! Stop is a broadcast: it bumps a generation on a `watch` channel that every in-flight
//! request subscribed to before dispatching, then sends `Stop` to every axis regardless of
//! individual failures.

use crate::error::{GatorError, GatorResult};
use crate::geometry::{Axis, StagePoint};
use crate::hardware::adapters::LinearAxis;
use crate::hardware::capabilities::{Movable, Readable, Triggerable};
use crate::hardware::link::PollState;
use futures::future::{self, BoxFuture, FutureExt};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Overshoot factor applied to the backlash allowance.
pub const BACKLASH_OVERSHOOT: f64 = 1.5;

// =============================================================================
// Requests and reports
// =============================================================================

/// Targets for one or more axes plus settle criteria.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MotionRequest {
    targets: BTreeMap<Axis, f64>,
    tolerance: Option<f64>,
    axis_tolerance: BTreeMap<Axis, f64>,
    timeout: Option<Duration>,
}

impl MotionRequest {
    /// Empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move X and Y to `point`.
    pub fn to(point: StagePoint) -> Self {
        Self::new().axis(Axis::X, point.x).axis(Axis::Y, point.y)
    }

    /// Add (or replace) the target of one axis.
    pub fn axis(mut self, axis: Axis, target: f64) -> Self {
        self.targets.insert(axis, target);
        self
    }

    /// Settle tolerance for every axis without a per-axis override.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    /// Settle tolerance for a single axis.
    pub fn with_axis_tolerance(mut self, axis: Axis, tolerance: f64) -> Self {
        self.axis_tolerance.insert(axis, tolerance);
        self
    }

    /// Deadline for the whole request, measured from dispatch.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Requested targets.
    pub fn targets(&self) -> &BTreeMap<Axis, f64> {
        &self.targets
    }

    fn tolerance_for(&self, axis: Axis) -> Option<f64> {
        self.axis_tolerance.get(&axis).copied().or(self.tolerance)
    }
}

/// Per-axis outcome of a broadcast operation (stop, home).
#[derive(Debug, Clone, PartialEq)]
pub struct AxisReport {
    /// Outcome of every axis, in axis order
    pub outcomes: Vec<(Axis, GatorResult<()>)>,
}

impl AxisReport {
    /// True when every axis succeeded.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|(_, outcome)| outcome.is_ok())
    }

    /// Axes that failed and why.
    pub fn failures(&self) -> Vec<(Axis, &GatorError)> {
        self.outcomes
            .iter()
            .filter_map(|(axis, outcome)| outcome.as_ref().err().map(|e| (*axis, e)))
            .collect()
    }
}

/// Outcome of [`StageController::stop`].
pub type StopReport = AxisReport;

/// Defaults applied when a request leaves tolerance or timeout unset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionDefaults {
    /// Settle tolerance in stage units
    pub tolerance: f64,
    /// Deadline per request
    pub timeout: Duration,
}

impl Default for MotionDefaults {
    fn default() -> Self {
        Self {
            tolerance: 1e-3,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Non-motion instrument attached to the stage.
#[derive(Clone, Default)]
pub struct Auxiliary {
    /// Scalar readout, if the device supports it
    pub readable: Option<Arc<dyn Readable>>,
    /// Arm/trigger, if the device supports it
    pub triggerable: Option<Arc<dyn Triggerable>>,
}

impl fmt::Debug for Auxiliary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auxiliary")
            .field("readable", &self.readable.is_some())
            .field("triggerable", &self.triggerable.is_some())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`StageController`].
#[derive(Debug, Default)]
pub struct StageBuilder {
    axes: Vec<LinearAxis>,
    auxiliaries: HashMap<String, Auxiliary>,
    defaults: MotionDefaults,
    loaded_position: Option<BTreeMap<Axis, f64>>,
    unloaded_position: Option<BTreeMap<Axis, f64>>,
}

impl StageBuilder {
    /// Add a motorized axis.
    pub fn axis(mut self, axis: LinearAxis) -> Self {
        self.axes.push(axis);
        self
    }

    /// Attach a named auxiliary instrument.
    pub fn auxiliary(mut self, name: impl Into<String>, auxiliary: Auxiliary) -> Self {
        self.auxiliaries.insert(name.into(), auxiliary);
        self
    }

    /// Tolerance and timeout defaults.
    pub fn defaults(mut self, defaults: MotionDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Position used by [`StageController::load`].
    pub fn loaded_position(mut self, position: BTreeMap<Axis, f64>) -> Self {
        self.loaded_position = Some(position);
        self
    }

    /// Position used by [`StageController::unload`].
    pub fn unloaded_position(mut self, position: BTreeMap<Axis, f64>) -> Self {
        self.unloaded_position = Some(position);
        self
    }

    /// Build the controller.
    ///
    /// # Errors
    /// `InvalidParameter` when an axis is given twice, when X or Y is missing, or when
    /// the defaults are not positive.
    pub fn build(self) -> GatorResult<StageController> {
        let mut axes = BTreeMap::new();
        for axis in self.axes {
            let name = axis.axis();
            if axes.insert(name, axis).is_some() {
                return Err(GatorError::InvalidParameter(format!(
                    "axis {} configured twice",
                    name
                )));
            }
        }
        for required in [Axis::X, Axis::Y] {
            if !axes.contains_key(&required) {
                return Err(GatorError::InvalidParameter(format!(
                    "stage needs a {} axis",
                    required
                )));
            }
        }
        if !(self.defaults.tolerance > 0.0) {
            return Err(GatorError::InvalidParameter(
                "default tolerance must be positive".into(),
            ));
        }
        let (cancel, _) = watch::channel(0);
        Ok(StageController {
            axes,
            auxiliaries: self.auxiliaries,
            defaults: self.defaults,
            cancel,
            loaded_position: self.loaded_position,
            unloaded_position: self.unloaded_position,
        })
    }
}

// =============================================================================
// StageController
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct AxisMove<'a> {
    axis: &'a LinearAxis,
    target: f64,
    tolerance: f64,
}

impl AxisMove<'_> {
    fn settled(&self) -> bool {
        self.axis
            .cached_position()
            .is_some_and(|p| (p - self.target).abs() <= self.tolerance)
    }

    /// Overshoot leg for a move that approaches from above.
    fn backlash_leg(&self) -> Option<Self> {
        let backlash = self.axis.backlash();
        let current = self.axis.cached_position()?;
        if backlash <= 0.0 || self.target >= current {
            return None;
        }
        let overshoot = (self.target - BACKLASH_OVERSHOOT * backlash).max(self.axis.limits().min);
        Some(Self {
            target: overshoot,
            ..*self
        })
    }
}

/// Coordinates the stage axes as one device.
pub struct StageController {
    axes: BTreeMap<Axis, LinearAxis>,
    auxiliaries: HashMap<String, Auxiliary>,
    defaults: MotionDefaults,
    cancel: watch::Sender<u64>,
    loaded_position: Option<BTreeMap<Axis, f64>>,
    unloaded_position: Option<BTreeMap<Axis, f64>>,
}

impl fmt::Debug for StageController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageController")
            .field("axes", &self.axes.keys().collect::<Vec<_>>())
            .field("auxiliaries", &self.auxiliaries.keys().collect::<Vec<_>>())
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl StageController {
    /// Start assembling a controller.
    pub fn builder() -> StageBuilder {
        StageBuilder::default()
    }

    /// The adapter of one axis.
    ///
    /// # Errors
    /// `InvalidParameter` when the stage has no such axis.
    pub fn axis(&self, axis: Axis) -> GatorResult<&LinearAxis> {
        self.axes
            .get(&axis)
            .ok_or_else(|| GatorError::InvalidParameter(format!("stage has no {} axis", axis)))
    }

    /// Configured axes in reporting order.
    pub fn axes(&self) -> impl Iterator<Item = Axis> + '_ {
        self.axes.keys().copied()
    }

    /// Motion defaults.
    pub fn defaults(&self) -> MotionDefaults {
        self.defaults
    }

    /// A named auxiliary instrument.
    pub fn auxiliary(&self, name: &str) -> Option<&Auxiliary> {
        self.auxiliaries.get(name)
    }

    /// Names of the auxiliary instruments, sorted.
    pub fn auxiliary_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.auxiliaries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Last reported X/Y position.
    ///
    /// # Errors
    /// `StalePosition` when an axis has not reported yet.
    pub fn current_position(&self) -> GatorResult<StagePoint> {
        Ok(StagePoint::new(
            self.cached(Axis::X)?,
            self.cached(Axis::Y)?,
        ))
    }

    /// Last reported position of every axis (`None` before its first status).
    pub fn positions(&self) -> BTreeMap<Axis, Option<f64>> {
        self.axes
            .iter()
            .map(|(name, axis)| (*name, axis.cached_position()))
            .collect()
    }

    /// Move X/Y to `target` and wait until both settle.
    pub async fn move_absolute(
        &self,
        target: StagePoint,
        tolerance: Option<f64>,
        timeout: Option<Duration>,
    ) -> GatorResult<()> {
        target.ensure_finite("stage target")?;
        self.execute(with_settings(MotionRequest::to(target), tolerance, timeout))
            .await
    }

    /// Move X/Y by `delta` from the last reported position.
    ///
    /// # Errors
    /// `StalePosition` when the current position is unknown, plus everything
    /// [`execute`](Self::execute) reports.
    pub async fn move_relative(
        &self,
        delta: StagePoint,
        tolerance: Option<f64>,
        timeout: Option<Duration>,
    ) -> GatorResult<()> {
        delta.ensure_finite("stage offset")?;
        let current = self.current_position()?;
        let target = StagePoint::new(current.x + delta.x, current.y + delta.y);
        self.move_absolute(target, tolerance, timeout).await
    }

    /// Step a single axis by `distance`.
    pub async fn jog(
        &self,
        axis: Axis,
        distance: f64,
        tolerance: Option<f64>,
        timeout: Option<Duration>,
    ) -> GatorResult<()> {
        if !distance.is_finite() {
            return Err(GatorError::InvalidParameter(format!(
                "jog distance {} is not finite",
                distance
            )));
        }
        let current = self.cached(axis)?;
        let request = MotionRequest::new().axis(axis, current + distance);
        self.execute(with_settings(request, tolerance, timeout)).await
    }

    /// Move to the configured loading position.
    pub async fn load(&self) -> GatorResult<()> {
        let position = self.loaded_position.clone().ok_or_else(|| {
            GatorError::InvalidParameter("no loaded position configured".into())
        })?;
        tracing::info!(?position, "Moving to loading position");
        self.execute(request_from(position)).await
    }

    /// Move to the configured unloaded (parking) position.
    pub async fn unload(&self) -> GatorResult<()> {
        let position = self.unloaded_position.clone().ok_or_else(|| {
            GatorError::InvalidParameter("no unloaded position configured".into())
        })?;
        tracing::info!(?position, "Moving to unloaded position");
        self.execute(request_from(position)).await
    }

    /// Run a motion request to completion.
    ///
    /// # Errors
    /// - `InvalidParameter`, `OutOfRange`, `NotConnected` from validation (nothing moved)
    /// - `Timeout` when an axis did not settle before the deadline
    /// - `Cancelled` when [`stop`](Self::stop) was called while waiting
    /// - `Faulted` when a participating device lost liveness
    /// - `DeviceError` when a participating device reported an error after dispatch
    /// - transport errors while dispatching
    pub async fn execute(&self, request: MotionRequest) -> GatorResult<()> {
        if request.targets.is_empty() {
            return Err(GatorError::InvalidParameter(
                "motion request has no targets".into(),
            ));
        }
        let timeout = request.timeout.unwrap_or(self.defaults.timeout);

        let mut plan = Vec::with_capacity(request.targets.len());
        for (&name, &target) in &request.targets {
            let axis = self.axis(name)?;
            if !target.is_finite() {
                return Err(GatorError::InvalidParameter(format!(
                    "target {} on axis {} is not finite",
                    target, name
                )));
            }
            let tolerance = request
                .tolerance_for(name)
                .unwrap_or(self.defaults.tolerance);
            if !(tolerance > 0.0 && tolerance.is_finite()) {
                return Err(GatorError::InvalidParameter(format!(
                    "tolerance for axis {} must be positive, got {}",
                    name, tolerance
                )));
            }
            axis.limits().check(name, target)?;
            axis.link().ensure_connected()?;
            plan.push(AxisMove {
                axis,
                target,
                tolerance,
            });
        }

        let mut cancel = self.cancel.subscribe();
        let deadline = Instant::now().checked_add(timeout).ok_or_else(|| {
            GatorError::InvalidParameter(format!("timeout {:?} is too large", timeout))
        })?;
        tracing::debug!(targets = ?request.targets, ?timeout, "Executing motion request");

        let approach: Vec<AxisMove<'_>> = plan.iter().filter_map(AxisMove::backlash_leg).collect();
        if !approach.is_empty() {
            tracing::debug!(axes = approach.len(), "Backlash approach from below");
            let dispatched_at = Instant::now();
            dispatch(&approach).await?;
            wait_settled(&approach, dispatched_at, deadline, timeout, &mut cancel).await?;
        }

        let dispatched_at = Instant::now();
        dispatch(&plan).await?;
        wait_settled(&plan, dispatched_at, deadline, timeout, &mut cancel).await
    }

    /// Cancel every in-flight request and send `Stop` to every axis.
    ///
    /// Never short-circuits: each axis is stopped even when another fails.
    pub async fn stop(&self) -> StopReport {
        self.cancel.send_modify(|generation| *generation = generation.wrapping_add(1));
        let outcomes = future::join_all(
            self.axes
                .iter()
                .map(|(name, axis)| async move { (*name, axis.stop().await) }),
        )
        .await;
        let report = AxisReport { outcomes };
        for (axis, error) in report.failures() {
            tracing::warn!(%axis, %error, "Stop failed");
        }
        report
    }

    /// Home every axis. Does not wait for homing to finish.
    pub async fn home_all(&self) -> AxisReport {
        let outcomes = future::join_all(
            self.axes
                .iter()
                .map(|(name, axis)| async move { (*name, axis.home().await) }),
        )
        .await;
        let report = AxisReport { outcomes };
        for (axis, error) in report.failures() {
            tracing::warn!(%axis, %error, "Homing failed");
        }
        report
    }

    fn cached(&self, axis: Axis) -> GatorResult<f64> {
        self.axis(axis)?
            .cached_position()
            .ok_or_else(|| GatorError::StalePosition(axis.to_string()))
    }
}

fn with_settings(
    mut request: MotionRequest,
    tolerance: Option<f64>,
    timeout: Option<Duration>,
) -> MotionRequest {
    if let Some(tolerance) = tolerance {
        request = request.with_tolerance(tolerance);
    }
    if let Some(timeout) = timeout {
        request = request.with_timeout(timeout);
    }
    request
}

fn request_from(position: BTreeMap<Axis, f64>) -> MotionRequest {
    position
        .into_iter()
        .fold(MotionRequest::new(), |request, (axis, target)| {
            request.axis(axis, target)
        })
}

async fn dispatch(moves: &[AxisMove<'_>]) -> GatorResult<()> {
    future::try_join_all(moves.iter().map(|m| m.axis.move_abs(m.target))).await?;
    Ok(())
}

async fn wait_settled(
    moves: &[AxisMove<'_>],
    dispatched_at: Instant,
    deadline: Instant,
    timeout: Duration,
    cancel: &mut watch::Receiver<u64>,
) -> GatorResult<()> {
    let mut status: Vec<_> = moves.iter().map(|m| m.axis.subscribe_status()).collect();
    let mut states: Vec<_> = moves.iter().map(|m| m.axis.subscribe_poll_state()).collect();

    loop {
        if cancel.has_changed().unwrap_or(false) {
            return Err(GatorError::Cancelled);
        }
        if moves.iter().all(AxisMove::settled) {
            return Ok(());
        }
        if let Some(faulted) = moves
            .iter()
            .find(|m| m.axis.link().poll_state() == PollState::Faulted)
        {
            return Err(GatorError::Faulted(faulted.axis.device().to_string()));
        }
        for m in moves {
            let reported = m.axis.link().latest_status().and_then(|snapshot| {
                snapshot.error_since(dispatched_at.into_std()).map(|message| message.data)
            });
            if let Some(code) = reported {
                return Err(GatorError::DeviceError {
                    device: m.axis.device().to_string(),
                    code,
                });
            }
        }
        if Instant::now() >= deadline {
            return Err(GatorError::Timeout(timeout));
        }

        let changes: Vec<BoxFuture<'_, Result<(), watch::error::RecvError>>> = status
            .iter_mut()
            .map(|rx| rx.changed().boxed())
            .chain(states.iter_mut().map(|rx| rx.changed().boxed()))
            .collect();

        tokio::select! {
            biased;
            _ = cancel.changed() => return Err(GatorError::Cancelled),
            (changed, index, _) = future::select_all(changes) => {
                if changed.is_err() {
                    let axis = moves[index % moves.len()].axis;
                    return Err(GatorError::NotConnected(axis.device().to_string()));
                }
            }
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::adapters::TravelLimits;
    use crate::hardware::link::{DeviceId, DeviceLink, LinkOptions};
    use crate::hardware::mock::MockAxis;

    async fn axis(name: Axis) -> LinearAxis {
        let link = DeviceLink::connect(
            DeviceId::new(format!("{}_motor", name)),
            Arc::new(MockAxis::new()),
            LinkOptions::default(),
        )
        .await
        .unwrap();
        LinearAxis::new(name, link, TravelLimits::new(-10.0, 10.0).unwrap(), 0.0).unwrap()
    }

    #[tokio::test]
    async fn builder_requires_planar_axes() {
        let only_x = StageController::builder().axis(axis(Axis::X).await).build();
        assert!(matches!(only_x, Err(GatorError::InvalidParameter(_))));

        let stage = StageController::builder()
            .axis(axis(Axis::X).await)
            .axis(axis(Axis::Y).await)
            .build()
            .unwrap();
        assert_eq!(stage.axes().collect::<Vec<_>>(), vec![Axis::X, Axis::Y]);
    }

    #[tokio::test]
    async fn rejected_requests_send_nothing() {
        let stage = StageController::builder()
            .axis(axis(Axis::X).await)
            .axis(axis(Axis::Y).await)
            .build()
            .unwrap();

        assert!(matches!(
            stage.execute(MotionRequest::new()).await,
            Err(GatorError::InvalidParameter(_))
        ));
        assert!(matches!(
            stage.execute(MotionRequest::new().axis(Axis::Z, 1.0)).await,
            Err(GatorError::InvalidParameter(_))
        ));
        assert!(matches!(
            stage
                .move_absolute(StagePoint::new(1.0, 1.0), Some(0.0), None)
                .await,
            Err(GatorError::InvalidParameter(_))
        ));
        assert!(matches!(
            stage.move_absolute(StagePoint::new(1.0, 11.0), None, None).await,
            Err(GatorError::OutOfRange { .. })
        ));
        assert_eq!(
            stage.current_position(),
            Err(GatorError::StalePosition("x".into()))
        );
    }

    #[test]
    fn per_axis_tolerance_overrides_default() {
        let request = MotionRequest::to(StagePoint::new(1.0, 2.0))
            .with_tolerance(0.1)
            .with_axis_tolerance(Axis::Y, 0.01);
        assert_eq!(request.tolerance_for(Axis::X), Some(0.1));
        assert_eq!(request.tolerance_for(Axis::Y), Some(0.01));
        assert_eq!(request.targets().len(), 2);
    }
}
