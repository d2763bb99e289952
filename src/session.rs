//! Alignment session wiring.
//!
//! [`Session::open`] turns a validated [`GatorConfig`] into a running system: it opens
//! every configured device, starts its polling schedule (and liveness monitoring when
//! configured), assembles the stage and its auxiliaries, installs the startup calibration,
//! and builds the design-space planner. If any step fails, every device opened so far is
//! closed again before the error is returned.

use crate::calibration::CalibrationEngine;
use crate::config::{AuxiliaryConfig, GatorConfig};
use crate::error::GatorResult;
use crate::hardware::adapters::{LinearAxis, PowerMeter, TravelLimits, TriggerSource};
use crate::hardware::capabilities::Capability;
use crate::hardware::link::{DeviceId, DeviceLink, PollState, TransportFactory};
use crate::hardware::registry::{DeviceHandle, DeviceRegistry};
use crate::planner::{MotionPlanner, SharedCalibration};
use crate::stage::{Auxiliary, StageController};
use crate::supervisor::PollingSupervisor;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Liveness and queue diagnostics for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceHealth {
    /// Device identity
    pub device: DeviceId,
    /// Polling state
    pub state: PollState,
    /// Whether the liveness threshold is currently exceeded
    pub overrun: bool,
    /// Time since the last message, `None` if none arrived yet
    pub quiet_for: Option<Duration>,
    /// Messages evicted from the full queue
    pub dropped_messages: u64,
}

/// A running alignment system.
pub struct Session {
    config: GatorConfig,
    registry: Arc<DeviceRegistry>,
    supervisor: Arc<PollingSupervisor>,
    handles: Vec<DeviceHandle>,
    stage: Arc<StageController>,
    planner: MotionPlanner,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.config.application.name)
            .field("devices", &self.handles.len())
            .field("stage", &self.stage)
            .finish()
    }
}

impl Session {
    /// Validate `config` and bring the system up using transports from `factory`.
    pub async fn open(config: GatorConfig, factory: Arc<dyn TransportFactory>) -> GatorResult<Self> {
        config.validate()?;
        let registry = Arc::new(DeviceRegistry::new(factory, config.polling.link_options()));
        let supervisor = Arc::new(PollingSupervisor::new(registry.clone()));

        let mut handles = Vec::new();
        match assemble(&config, &registry, &supervisor, &mut handles).await {
            Ok((stage, planner)) => {
                tracing::info!(
                    name = %config.application.name,
                    devices = handles.len(),
                    calibrated = planner.calibration().read().is_calibrated(),
                    "Session ready"
                );
                Ok(Self {
                    config,
                    registry,
                    supervisor,
                    handles,
                    stage,
                    planner,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "Session startup failed; closing opened devices");
                supervisor.stop_all();
                for handle in handles {
                    registry.close(handle).await;
                }
                Err(e)
            }
        }
    }

    /// The configuration the session was opened with.
    pub fn config(&self) -> &GatorConfig {
        &self.config
    }

    /// The device registry.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// The polling supervisor.
    pub fn supervisor(&self) -> &Arc<PollingSupervisor> {
        &self.supervisor
    }

    /// The stage controller.
    pub fn stage(&self) -> &Arc<StageController> {
        &self.stage
    }

    /// The design-space planner.
    pub fn planner(&self) -> &MotionPlanner {
        &self.planner
    }

    /// The shared calibration.
    pub fn calibration(&self) -> &SharedCalibration {
        self.planner.calibration()
    }

    /// Wait until every axis has published a position, or `timeout` elapses.
    ///
    /// Returns `true` when all positions are known.
    pub async fn wait_for_positions(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.stage.positions().values().all(Option::is_some) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.polling.interval).await;
        }
    }

    /// Liveness and queue state of every open device.
    pub fn health(&self) -> Vec<DeviceHealth> {
        self.registry
            .list()
            .into_iter()
            .map(|info| DeviceHealth {
                overrun: self.supervisor.has_overrun(info.handle),
                quiet_for: self
                    .registry
                    .time_since_last_message(info.handle)
                    .ok()
                    .flatten(),
                device: info.id,
                state: info.poll_state,
                dropped_messages: info.dropped_messages,
            })
            .collect()
    }

    /// Stop polling and close every device.
    pub async fn shutdown(self) {
        self.supervisor.stop_all();
        for handle in &self.handles {
            self.registry.close(*handle).await;
        }
        tracing::info!(name = %self.config.application.name, "Session closed");
    }
}

async fn open_polled(
    device: &str,
    config: &GatorConfig,
    registry: &DeviceRegistry,
    supervisor: &PollingSupervisor,
    handles: &mut Vec<DeviceHandle>,
) -> GatorResult<Arc<DeviceLink>> {
    let handle = registry.open(device).await?;
    handles.push(handle);
    supervisor.start(handle, config.polling.interval)?;
    if let Some(threshold) = config.polling.liveness_timeout {
        supervisor.enable_liveness(handle, threshold)?;
    }
    registry.link(handle)
}

fn auxiliary_from(config: &AuxiliaryConfig, link: Arc<DeviceLink>) -> Auxiliary {
    let mut auxiliary = Auxiliary::default();
    for capability in &config.capabilities {
        match capability {
            Capability::Readable => {
                auxiliary.readable = Some(Arc::new(PowerMeter::new(link.clone())));
            }
            Capability::Triggerable => {
                auxiliary.triggerable = Some(Arc::new(TriggerSource::new(link.clone())));
            }
            Capability::Movable => {}
        }
    }
    auxiliary
}

fn startup_calibration(config: &GatorConfig) -> GatorResult<CalibrationEngine> {
    let mut engine = CalibrationEngine::with_max_condition(config.calibration.max_condition)?;
    if let Some(matrix) = config.calibration.matrix {
        engine.set_transform(matrix);
        tracing::info!("Using inline calibration matrix");
    } else if let Some(path) = &config.calibration.matrix_path {
        if path.exists() {
            engine.load(path)?;
        } else {
            tracing::info!(path = %path.display(), "No saved calibration yet; starting uncalibrated");
        }
    }
    Ok(engine)
}

async fn assemble(
    config: &GatorConfig,
    registry: &DeviceRegistry,
    supervisor: &PollingSupervisor,
    handles: &mut Vec<DeviceHandle>,
) -> GatorResult<(Arc<StageController>, MotionPlanner)> {
    let mut builder = StageController::builder().defaults(config.motion.defaults());

    for axis in &config.axes {
        let link = open_polled(&axis.device, config, registry, supervisor, handles).await?;
        let limits = TravelLimits::new(axis.min, axis.max)?;
        builder = builder.axis(LinearAxis::new(axis.axis, link, limits, axis.backlash)?);
    }
    for auxiliary in &config.auxiliaries {
        let link = open_polled(&auxiliary.device, config, registry, supervisor, handles).await?;
        builder = builder.auxiliary(auxiliary.name.clone(), auxiliary_from(auxiliary, link));
    }
    if let Some(position) = &config.stage.loaded_position {
        builder = builder.loaded_position(position.clone());
    }
    if let Some(position) = &config.stage.unloaded_position {
        builder = builder.unloaded_position(position.clone());
    }

    let stage = Arc::new(builder.build()?);
    let calibration: SharedCalibration = Arc::new(RwLock::new(startup_calibration(config)?));
    let planner = MotionPlanner::new(calibration, stage.clone());
    Ok((stage, planner))
}
