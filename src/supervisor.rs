//! Polling supervisor.
//!
//! Owns one background task per polled device. Each task requests a status report on a
//! fixed interval, publishes the resulting snapshot through the link's `watch` channel and
//! evaluates the liveness timer after every tick:
//!
//! ```text
//!            start                  quiet > threshold
//!  Stopped ─────────► Polling ─────────────────────────► Faulted
//!     ▲                  ▲ ◄─────────────────────────────    │
//!     │   stop           │        messages resume            │ stop
//!     └──────────────────┴───────────────────────────────────┘
//! ```
//!
//! Transient failures (`Io`, `Timeout`) are logged and retried on the next tick; they never
//! reach callers and only surface as a liveness fault when they persist. The task exits on
//! its own when the link is closed.
//!
//! The supervisor task is the only writer of a link's snapshot and state channels. Each
//! task owns one polling epoch of its link; once `stop` closes that epoch, whatever the task
//! was doing at the time can no longer publish or change the state.
//!
//! Besides the status reply, every tick folds the events the device pushed since the last
//! tick (motion complete, stopped, homed, errors) into the published snapshot.

use crate::error::{GatorError, GatorResult};
use crate::hardware::link::{DeviceLink, PollState};
use crate::hardware::registry::{DeviceHandle, DeviceRegistry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct PollTask {
    interval: Duration,
    link: Arc<DeviceLink>,
    join: JoinHandle<()>,
}

impl PollTask {
    fn halt(&self) {
        self.link.end_polling();
        self.join.abort();
    }
}

/// Runs and tracks polling schedules for devices of one registry.
pub struct PollingSupervisor {
    registry: Arc<DeviceRegistry>,
    tasks: Mutex<HashMap<DeviceHandle, PollTask>>,
}

impl PollingSupervisor {
    /// Supervisor for devices of `registry`.
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// The registry this supervisor polls.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Start polling a device every `interval`.
    ///
    /// Starting an already-polled device with the same interval is a no-op.
    ///
    /// # Errors
    /// - `InvalidParameter` for a zero interval, or for a different interval while a
    ///   schedule is already running (stop it first)
    /// - `NotConnected` for a stale handle
    pub fn start(&self, handle: DeviceHandle, interval: Duration) -> GatorResult<()> {
        if interval.is_zero() {
            return Err(GatorError::InvalidParameter(
                "polling interval must be positive".into(),
            ));
        }
        let link = self.registry.link(handle)?;

        let mut tasks = self.tasks.lock();
        tasks.retain(|_, task| !task.join.is_finished());
        if let Some(task) = tasks.get(&handle) {
            if !task.join.is_finished() {
                if task.interval == interval {
                    return Ok(());
                }
                return Err(GatorError::InvalidParameter(format!(
                    "{} is already polled every {:?}; stop it before changing the interval",
                    link.id(),
                    task.interval
                )));
            }
        }

        let epoch = link.begin_polling();
        let join = tokio::spawn(poll_loop(link.clone(), interval, epoch));
        tracing::info!(device = %link.id(), ?interval, "Polling started");

        tasks.insert(
            handle,
            PollTask {
                interval,
                link,
                join,
            },
        );
        Ok(())
    }

    /// Stop polling a device. No-op when it is not polled.
    pub fn stop(&self, handle: DeviceHandle) {
        let task = self.tasks.lock().remove(&handle);
        if let Some(task) = task {
            tracing::info!(device = %task.link.id(), "Polling stopped");
            task.halt();
        }
    }

    /// Stop every polling schedule.
    pub fn stop_all(&self) {
        let tasks: Vec<PollTask> = self.tasks.lock().drain().map(|(_, task)| task).collect();
        for task in tasks {
            task.halt();
        }
    }

    /// Enable liveness monitoring with `threshold`. The quiet time is measured from now.
    ///
    /// # Errors
    /// `InvalidParameter` for a zero threshold, `NotConnected` for a stale handle.
    pub fn enable_liveness(&self, handle: DeviceHandle, threshold: Duration) -> GatorResult<()> {
        if threshold.is_zero() {
            return Err(GatorError::InvalidParameter(
                "liveness threshold must be positive".into(),
            ));
        }
        let link = self.registry.link(handle)?;
        link.set_liveness_timeout(Some(threshold));
        tracing::debug!(device = %link.id(), ?threshold, "Liveness monitoring enabled");
        Ok(())
    }

    /// Disable liveness monitoring.
    pub fn disable_liveness(&self, handle: DeviceHandle) -> GatorResult<()> {
        let link = self.registry.link(handle)?;
        link.clear_liveness();
        Ok(())
    }

    /// True iff monitoring is enabled and the device has been quiet past its threshold.
    /// False for stale handles.
    pub fn has_overrun(&self, handle: DeviceHandle) -> bool {
        self.registry
            .link(handle)
            .map(|link| link.has_overrun())
            .unwrap_or(false)
    }

    /// Polling state of a device. `Stopped` for stale handles.
    pub fn state(&self, handle: DeviceHandle) -> PollState {
        self.registry
            .link(handle)
            .map(|link| link.poll_state())
            .unwrap_or(PollState::Stopped)
    }

    /// Whether a polling task is running for the device.
    pub fn is_polling(&self, handle: DeviceHandle) -> bool {
        self.tasks
            .lock()
            .get(&handle)
            .is_some_and(|task| !task.join.is_finished())
    }
}

impl Drop for PollingSupervisor {
    fn drop(&mut self) {
        for (_, task) in self.tasks.get_mut().drain() {
            task.halt();
        }
    }
}

async fn poll_loop(link: Arc<DeviceLink>, interval: Duration, epoch: u64) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match link.poll_once().await {
            Ok(snapshot) => {
                if !link.publish_status(epoch, snapshot) {
                    return;
                }
            }
            Err(GatorError::NotConnected(_)) => {
                tracing::debug!(device = %link.id(), "Link closed; polling task exiting");
                link.end_polling_epoch(epoch);
                return;
            }
            Err(e) => {
                tracing::warn!(device = %link.id(), error = %e, "Status poll failed; retrying next tick");
            }
        }

        match link.update_liveness(epoch) {
            Some(PollState::Faulted) => tracing::warn!(
                device = %link.id(),
                quiet_for = ?link.time_since_last_message(),
                "No message within liveness threshold; device faulted"
            ),
            Some(PollState::Polling) => {
                tracing::info!(device = %link.id(), "Device talking again; fault cleared")
            }
            _ => {}
        }
    }
}
