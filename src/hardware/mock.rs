//! Mock Hardware Implementations
//!
//! Simulated transports for testing and dry runs without physical hardware.
//!
//! # Available Mocks
//!
//! - `MockAxis` - linear axis moving at a fixed speed, with fault injection
//! - `MockInstrument` - scalar instrument (power meter) with arm/trigger support
//! - `MockFactory` - a [`TransportFactory`] over a fixed set of mock transports
//!
//! Motion is evaluated lazily: the simulated position is a function of the time elapsed
//! since the last command, so nothing needs to run in the background. Completion is
//! reported as a `MotionComplete` message the first time a status request observes the
//! axis at its target.

use crate::config::GatorConfig;
use crate::error::{GatorError, GatorResult};
use crate::hardware::link::{
    DeviceCommand, DeviceId, DeviceTransport, MessageSink, StatusBits, StatusReport,
    TransportFactory,
};
use crate::hardware::queue::MessageKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Status bit: axis in motion.
pub const STATUS_MOVING: u32 = 0x0000_0030;
/// Status bit: axis homed.
pub const STATUS_HOMED: u32 = 0x0000_0400;
/// Status bit: channel enabled.
pub const STATUS_ENABLED: u32 = 0x8000_0000;

/// Default simulated speed in units per second.
pub const DEFAULT_MOCK_SPEED: f64 = 10.0;

#[derive(Debug)]
struct Motion {
    origin: f64,
    target: f64,
    started: Instant,
    homing: bool,
    homed: bool,
    completion_reported: bool,
}

impl Motion {
    fn at(position: f64) -> Self {
        Self {
            origin: position,
            target: position,
            started: Instant::now(),
            homing: false,
            homed: false,
            completion_reported: true,
        }
    }

    fn position(&self, speed: f64, now: Instant) -> f64 {
        let span = self.target - self.origin;
        let travelled = speed * now.saturating_duration_since(self.started).as_secs_f64();
        if travelled >= span.abs() {
            self.target
        } else {
            self.origin + travelled.copysign(span)
        }
    }

    fn retarget(&mut self, target: f64, speed: f64, now: Instant) {
        self.origin = self.position(speed, now);
        self.target = target;
        self.started = now;
        self.completion_reported = false;
    }
}

// =============================================================================
// MockAxis
// =============================================================================

/// Simulated linear axis.
///
/// # Example
///
/// ```rust,ignore
/// let axis = Arc::new(MockAxis::with_position(5.0));
/// let factory = MockFactory::new().with_device("x_motor", axis.clone());
/// ```
pub struct MockAxis {
    speed: f64,
    motion: Mutex<Motion>,
    sink: Mutex<Option<MessageSink>>,
    commands: Mutex<Vec<DeviceCommand>>,
    silent: AtomicBool,
    unreachable: AtomicBool,
    failing_polls: AtomicU32,
    status_requests: AtomicU64,
}

impl MockAxis {
    /// Axis at 0.0 moving at the default speed.
    pub fn new() -> Self {
        Self::build(0.0, DEFAULT_MOCK_SPEED)
    }

    /// Axis at `initial_position`.
    pub fn with_position(initial_position: f64) -> Self {
        Self::build(initial_position, DEFAULT_MOCK_SPEED)
    }

    /// Axis at 0.0 moving at `speed` units per second.
    pub fn with_speed(speed: f64) -> Self {
        Self::build(0.0, speed)
    }

    /// Axis at `initial_position` moving at `speed` units per second.
    pub fn with_position_and_speed(initial_position: f64, speed: f64) -> Self {
        Self::build(initial_position, speed)
    }

    fn build(position: f64, speed: f64) -> Self {
        Self {
            speed,
            motion: Mutex::new(Motion::at(position)),
            sink: Mutex::new(None),
            commands: Mutex::new(Vec::new()),
            silent: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            failing_polls: AtomicU32::new(0),
            status_requests: AtomicU64::new(0),
        }
    }

    /// Simulated true position right now.
    pub fn simulated_position(&self) -> f64 {
        self.motion.lock().position(self.speed, Instant::now())
    }

    /// Every command received, in order.
    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.commands.lock().clone()
    }

    /// Number of status requests received (answered or not).
    pub fn status_requests(&self) -> u64 {
        self.status_requests.load(Ordering::Relaxed)
    }

    /// While silent, status requests never answer.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// While unreachable, every command fails with an I/O error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail the next `count` status requests with an I/O error.
    pub fn fail_next_polls(&self, count: u32) {
        self.failing_polls.store(count, Ordering::SeqCst);
    }

    /// Push a device error message carrying `code`, as a controller does on a limit
    /// switch or drive fault.
    pub fn report_error(&self, code: u32) {
        self.push(MessageKind::Error, code);
    }

    fn notify(&self, kind: MessageKind) {
        self.push(kind, 0);
    }

    fn push(&self, kind: MessageKind, data: u32) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.push(kind, 0, data);
        }
    }
}

impl Default for MockAxis {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceTransport for MockAxis {
    async fn connect(&self, sink: MessageSink) -> GatorResult<()> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    async fn disconnect(&self) -> GatorResult<()> {
        self.sink.lock().take();
        Ok(())
    }

    async fn send(&self, command: DeviceCommand) -> GatorResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatorError::io("mock axis", "device unreachable"));
        }
        self.commands.lock().push(command.clone());

        let now = Instant::now();
        let stopped = {
            let mut motion = self.motion.lock();
            match command {
                DeviceCommand::MoveAbsolute(target) => {
                    motion.homing = false;
                    motion.retarget(target, self.speed, now);
                    false
                }
                DeviceCommand::MoveRelative(distance) => {
                    let target = motion.position(self.speed, now) + distance;
                    motion.homing = false;
                    motion.retarget(target, self.speed, now);
                    false
                }
                DeviceCommand::Home => {
                    motion.homing = true;
                    motion.retarget(0.0, self.speed, now);
                    false
                }
                DeviceCommand::Stop => {
                    let here = motion.position(self.speed, now);
                    *motion = Motion {
                        homed: motion.homed,
                        ..Motion::at(here)
                    };
                    true
                }
                DeviceCommand::Identify => false,
                DeviceCommand::Arm | DeviceCommand::Trigger => {
                    return Err(GatorError::InvalidParameter(
                        "Axis does not support triggering".into(),
                    ))
                }
            }
        };
        if stopped {
            self.notify(MessageKind::Stopped);
        }
        Ok(())
    }

    async fn request_status(&self) -> GatorResult<StatusReport> {
        self.status_requests.fetch_add(1, Ordering::Relaxed);
        if self.silent.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        let failing = self
            .failing_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(GatorError::io("mock axis", "status request failed"));
        }

        let now = Instant::now();
        let (position, bits, completed) = {
            let mut motion = self.motion.lock();
            let position = motion.position(self.speed, now);
            let arrived = position == motion.target;
            let completed = if arrived && !motion.completion_reported {
                motion.completion_reported = true;
                if motion.homing {
                    motion.homing = false;
                    motion.homed = true;
                    Some(MessageKind::Homed)
                } else {
                    Some(MessageKind::MotionComplete)
                }
            } else {
                None
            };
            let mut bits = STATUS_ENABLED;
            if !arrived {
                bits |= STATUS_MOVING;
            }
            if motion.homed {
                bits |= STATUS_HOMED;
            }
            (position, bits, completed)
        };
        if let Some(kind) = completed {
            self.notify(kind);
        }

        Ok(StatusReport {
            status_bits: StatusBits(bits),
            position: Some(position),
            reading: None,
        })
    }
}

// =============================================================================
// MockInstrument
// =============================================================================

/// Simulated scalar instrument.
pub struct MockInstrument {
    reading: Mutex<f64>,
    armed: AtomicBool,
    triggers: AtomicU64,
}

impl MockInstrument {
    /// Instrument that reports `reading`.
    pub fn new(reading: f64) -> Self {
        Self {
            reading: Mutex::new(reading),
            armed: AtomicBool::new(false),
            triggers: AtomicU64::new(0),
        }
    }

    /// Change the reported value.
    pub fn set_reading(&self, reading: f64) {
        *self.reading.lock() = reading;
    }

    /// Number of accepted triggers.
    pub fn trigger_count(&self) -> u64 {
        self.triggers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceTransport for MockInstrument {
    async fn connect(&self, _sink: MessageSink) -> GatorResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> GatorResult<()> {
        Ok(())
    }

    async fn send(&self, command: DeviceCommand) -> GatorResult<()> {
        match command {
            DeviceCommand::Arm => {
                self.armed.store(true, Ordering::SeqCst);
                Ok(())
            }
            DeviceCommand::Trigger => {
                if !self.armed.load(Ordering::SeqCst) {
                    return Err(GatorError::InvalidParameter("Instrument not armed".into()));
                }
                self.triggers.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            DeviceCommand::Identify | DeviceCommand::Stop => Ok(()),
            other => Err(GatorError::InvalidParameter(format!(
                "Instrument cannot execute {:?}",
                other
            ))),
        }
    }

    async fn request_status(&self) -> GatorResult<StatusReport> {
        Ok(StatusReport {
            status_bits: StatusBits(STATUS_ENABLED),
            position: None,
            reading: Some(*self.reading.lock()),
        })
    }
}

// =============================================================================
// MockFactory
// =============================================================================

/// Factory resolving device identities to pre-registered mock transports.
#[derive(Default)]
pub struct MockFactory {
    devices: Mutex<HashMap<DeviceId, Arc<dyn DeviceTransport>>>,
}

impl MockFactory {
    /// Empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `transport` under `id`, replacing any previous entry.
    pub fn insert(&self, id: impl Into<DeviceId>, transport: Arc<dyn DeviceTransport>) {
        self.devices.lock().insert(id.into(), transport);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with_device(self, id: impl Into<DeviceId>, transport: Arc<dyn DeviceTransport>) -> Self {
        self.insert(id, transport);
        self
    }

    /// One mock per configured device: a `MockAxis` for every axis, parked inside its
    /// travel, and a `MockInstrument` for every auxiliary.
    pub fn from_config(config: &GatorConfig) -> Self {
        let factory = Self::new();
        for axis in &config.axes {
            let start = 0.0_f64.clamp(axis.min, axis.max);
            let speed = axis.mock_speed.unwrap_or(DEFAULT_MOCK_SPEED);
            factory.insert(
                axis.device.as_str(),
                Arc::new(MockAxis::with_position_and_speed(start, speed)),
            );
        }
        for auxiliary in &config.auxiliaries {
            let reading = auxiliary.mock_reading.unwrap_or(0.0);
            factory.insert(
                auxiliary.device.as_str(),
                Arc::new(MockInstrument::new(reading)),
            );
        }
        factory
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, id: &DeviceId) -> GatorResult<Arc<dyn DeviceTransport>> {
        self.devices
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| GatorError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn axis_travels_at_its_speed() {
        let axis = MockAxis::with_speed(100.0);
        axis.send(DeviceCommand::MoveAbsolute(2.0)).await.unwrap();

        let first = axis.request_status().await.unwrap();
        assert!(first.status_bits.contains(STATUS_MOVING));

        tokio::time::sleep(Duration::from_millis(40)).await;
        let done = axis.request_status().await.unwrap();
        assert_eq!(done.position, Some(2.0));
        assert!(!done.status_bits.contains(STATUS_MOVING));
    }

    #[tokio::test]
    async fn stop_freezes_position() {
        let axis = MockAxis::with_speed(10.0);
        axis.send(DeviceCommand::MoveAbsolute(100.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        axis.send(DeviceCommand::Stop).await.unwrap();

        let frozen = axis.simulated_position();
        assert!(frozen > 0.0 && frozen < 100.0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(axis.simulated_position(), frozen);
    }

    #[tokio::test]
    async fn homing_sets_homed_bit() {
        let axis = MockAxis::with_position_and_speed(0.5, 100.0);
        axis.send(DeviceCommand::Home).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = axis.request_status().await.unwrap();
        assert_eq!(status.position, Some(0.0));
        assert!(status.status_bits.contains(STATUS_HOMED));
    }

    #[tokio::test]
    async fn injected_faults() {
        let axis = MockAxis::new();
        axis.fail_next_polls(2);
        assert!(axis.request_status().await.is_err());
        assert!(axis.request_status().await.is_err());
        assert!(axis.request_status().await.is_ok());

        axis.set_unreachable(true);
        assert!(matches!(
            axis.send(DeviceCommand::Stop).await,
            Err(GatorError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn instrument_requires_arm() {
        let meter = MockInstrument::new(1.5e-3);
        assert!(meter.send(DeviceCommand::Trigger).await.is_err());
        meter.send(DeviceCommand::Arm).await.unwrap();
        meter.send(DeviceCommand::Trigger).await.unwrap();
        assert_eq!(meter.trigger_count(), 1);
        assert_eq!(meter.request_status().await.unwrap().reading, Some(1.5e-3));
    }

    #[test]
    fn factory_rejects_unknown_identity() {
        let factory = MockFactory::new().with_device("x_motor", Arc::new(MockAxis::new()));
        assert!(factory.create(&DeviceId::new("x_motor")).is_ok());
        assert_eq!(
            factory.create(&DeviceId::new("y_motor")).err(),
            Some(GatorError::NotFound("y_motor".into()))
        );
    }
}
