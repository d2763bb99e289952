//! Device links: one live connection to a motorized axis or auxiliary instrument.
//!
//! The wire protocol is not part of this crate. A concrete device is reached through a
//! [`DeviceTransport`], an opaque capability that can connect, accept commands and answer
//! status requests. Wrapping a transport, a [`DeviceLink`] adds what the rest of the core
//! relies on:
//!
//! - a bounded [`MessageQueue`] fed by the transport through a [`MessageSink`]
//! - a last-message timer (time since the device last said anything, with an optional
//!   liveness threshold)
//! - a published [`StatusSnapshot`] and [`PollState`], written only by the polling
//!   supervisor and read by everyone else through `tokio::sync::watch`
//!
//! ```text
//! transport ──push──► MessageSink ──► MessageQueue / last-message timer
//!     ▲                    └────────► event queue ──► PollingSupervisor
//!     └── request_status ◄── DeviceLink::poll_once ◄── PollingSupervisor ──► watch<StatusSnapshot>
//! ```
//!
//! Polling state changes go through one lock together with a polling epoch. `begin_polling`
//! and `end_polling` open and close an epoch; a poll task may only change the state or
//! publish while its own epoch is current, so a task racing a stop can never overwrite
//! `Stopped`.

use crate::error::{GatorError, GatorResult};
use crate::hardware::queue::{Message, MessageKind, MessageQueue};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

// =============================================================================
// Identification and commands
// =============================================================================

/// Identity of a physical device (serial number or logical name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create an identity from a serial number or name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Command sent to a device. Encoding is the transport's business.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    /// Move to an absolute position (device-native units)
    MoveAbsolute(f64),
    /// Move by a distance from the current position
    MoveRelative(f64),
    /// Halt motion immediately
    Stop,
    /// Find the mechanical zero
    Home,
    /// Prepare for a trigger
    Arm,
    /// Software trigger
    Trigger,
    /// Flash the front panel (identify the physical unit)
    Identify,
}

// =============================================================================
// Status
// =============================================================================

/// Opaque device status bitmask.
///
/// Bit meanings are device-specific; only device adapters decode them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatusBits(pub u32);

impl StatusBits {
    /// Raw bits.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// True when every bit of `mask` is set.
    pub fn contains(&self, mask: u32) -> bool {
        self.0 & mask == mask
    }
}

/// Status answer produced by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatusReport {
    /// Device status bits
    pub status_bits: StatusBits,
    /// Position in device-native units, for positioners
    pub position: Option<f64>,
    /// Scalar reading, for measuring instruments
    pub reading: Option<f64>,
}

/// Last-known status of a device, stamped with its time of receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    /// Device that reported
    pub device: DeviceId,
    /// Device status bits
    pub status_bits: StatusBits,
    /// Position in device-native units
    pub position: Option<f64>,
    /// Scalar reading
    pub reading: Option<f64>,
    /// When the answer arrived
    pub received_at: Instant,
    /// Monotonic per-link counter of successful polls
    pub sequence: u64,
    /// Most recent non-status event the device pushed (motion complete, stopped, homed,
    /// error, vendor)
    pub last_event: Option<Message>,
    /// Most recent `Error` message the device pushed
    pub last_error: Option<Message>,
}

impl StatusSnapshot {
    /// The latest device error received at or after `since`.
    pub fn error_since(&self, since: Instant) -> Option<&Message> {
        self.last_error.as_ref().filter(|m| m.received_at >= since)
    }
}

/// Polling state of a device, as published by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PollState {
    /// No polling schedule is running
    #[default]
    Stopped,
    /// Polling and the device is talking
    Polling,
    /// Polling, but no message arrived within the liveness threshold
    Faulted,
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollState::Stopped => write!(f, "stopped"),
            PollState::Polling => write!(f, "polling"),
            PollState::Faulted => write!(f, "faulted"),
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Transport-agnostic device primitive.
///
/// Implementations wrap a vendor SDK, a serial port or a remote driver proxy. Methods take
/// `&self`; implementations use interior mutability for their state.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Establish the connection. `sink` receives every unsolicited message the device
    /// emits until `disconnect`.
    async fn connect(&self, sink: MessageSink) -> GatorResult<()>;

    /// Release the connection.
    async fn disconnect(&self) -> GatorResult<()>;

    /// Deliver one command.
    async fn send(&self, command: DeviceCommand) -> GatorResult<()>;

    /// Ask the device for its current status and wait for the answer.
    async fn request_status(&self) -> GatorResult<StatusReport>;
}

/// Creates transports for device identities.
pub trait TransportFactory: Send + Sync {
    /// Return the transport for `id`.
    ///
    /// # Errors
    /// `NotFound` when no device with this identity is known.
    fn create(&self, id: &DeviceId) -> GatorResult<Arc<dyn DeviceTransport>>;
}

// =============================================================================
// Last-message timer
// =============================================================================

#[derive(Debug)]
struct LastMessageTimer {
    last_message: Option<Instant>,
    baseline: Instant,
    threshold: Option<Duration>,
}

impl LastMessageTimer {
    fn new(now: Instant) -> Self {
        Self {
            last_message: None,
            baseline: now,
            threshold: None,
        }
    }

    fn quiet_for(&self, now: Instant) -> Duration {
        let reference = self
            .last_message
            .map_or(self.baseline, |last| last.max(self.baseline));
        now.saturating_duration_since(reference)
    }

    fn has_overrun(&self, now: Instant) -> bool {
        match self.threshold {
            Some(threshold) => self.quiet_for(now) > threshold,
            None => false,
        }
    }
}

/// Producer handle a transport uses to push device messages.
///
/// Every pushed message resets the link's last-message timer.
#[derive(Clone)]
pub struct MessageSink {
    queue: Arc<MessageQueue>,
    events: Arc<MessageQueue>,
    timer: Arc<Mutex<LastMessageTimer>>,
}

impl MessageSink {
    /// Push a message stamped with the current time.
    pub fn push(&self, kind: MessageKind, id: u16, data: u32) {
        self.push_at(kind, id, data, Instant::now());
    }

    fn push_at(&self, kind: MessageKind, id: u16, data: u32, received_at: Instant) {
        self.timer.lock().last_message = Some(received_at);
        let message = Message {
            kind,
            id,
            data,
            received_at,
        };
        if kind != MessageKind::Status {
            self.events.push(message.clone());
        }
        self.queue.push(message);
    }
}

// =============================================================================
// Device Link
// =============================================================================

/// Per-link tuning shared by every device opened through a registry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkOptions {
    /// Deadline for connect, send and status requests
    pub request_timeout: Duration,
    /// Capacity of the message queue
    pub queue_capacity: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            queue_capacity: 256,
        }
    }
}

/// A live, exclusively owned connection to one device.
pub struct DeviceLink {
    id: DeviceId,
    transport: Arc<dyn DeviceTransport>,
    queue: Arc<MessageQueue>,
    events: Arc<MessageQueue>,
    timer: Arc<Mutex<LastMessageTimer>>,
    poll_epoch: Mutex<u64>,
    connected: AtomicBool,
    request_timeout: Duration,
    sequence: AtomicU64,
    status_tx: watch::Sender<Option<Arc<StatusSnapshot>>>,
    state_tx: watch::Sender<PollState>,
}

impl fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLink")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("poll_state", &self.poll_state())
            .finish()
    }
}

impl DeviceLink {
    /// Connect `transport` and wrap it in a link.
    ///
    /// # Errors
    /// - `InvalidParameter` for a zero queue capacity
    /// - `Timeout` when connecting takes longer than the request timeout
    /// - whatever the transport's `connect` reports
    pub async fn connect(
        id: DeviceId,
        transport: Arc<dyn DeviceTransport>,
        options: LinkOptions,
    ) -> GatorResult<Arc<Self>> {
        let queue = Arc::new(MessageQueue::new(options.queue_capacity)?);
        let events = Arc::new(MessageQueue::new(options.queue_capacity)?);
        let (status_tx, _) = watch::channel(None);
        let (state_tx, _) = watch::channel(PollState::Stopped);
        let link = Arc::new(Self {
            id,
            transport,
            queue,
            events,
            timer: Arc::new(Mutex::new(LastMessageTimer::new(Instant::now()))),
            poll_epoch: Mutex::new(0),
            connected: AtomicBool::new(false),
            request_timeout: options.request_timeout,
            sequence: AtomicU64::new(0),
            status_tx,
            state_tx,
        });

        let sink = link.sink();
        link.with_deadline(link.transport.connect(sink)).await?;
        link.connected.store(true, Ordering::SeqCst);
        tracing::debug!(device = %link.id, "Device link connected");
        Ok(link)
    }

    /// Device identity.
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// False once the link was closed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Fail with `NotConnected` when the link was closed.
    pub fn ensure_connected(&self) -> GatorResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(GatorError::NotConnected(self.id.to_string()))
        }
    }

    /// A producer handle into this link's message queue.
    pub fn sink(&self) -> MessageSink {
        MessageSink {
            queue: self.queue.clone(),
            events: self.events.clone(),
            timer: self.timer.clone(),
        }
    }

    /// The message queue (for external subscribers and diagnostics).
    pub fn messages(&self) -> Arc<MessageQueue> {
        self.queue.clone()
    }

    /// Deliver a command to the device.
    ///
    /// # Errors
    /// `NotConnected`, `Timeout`, or the transport's `Io` failure.
    pub async fn send(&self, command: DeviceCommand) -> GatorResult<()> {
        self.ensure_connected()?;
        tracing::trace!(device = %self.id, ?command, "Sending command");
        self.with_deadline(self.transport.send(command)).await
    }

    /// Request one status report.
    ///
    /// A successful answer counts as a received message. The snapshot is returned, not
    /// published; publication is the polling supervisor's job.
    ///
    /// # Errors
    /// `NotConnected`, `Timeout` when the device does not answer in time, or the
    /// transport's `Io` failure.
    pub async fn poll_once(&self) -> GatorResult<StatusSnapshot> {
        self.ensure_connected()?;
        let report = self.with_deadline(self.transport.request_status()).await?;
        let received_at = Instant::now();
        self.sink().push_at(
            MessageKind::Status,
            0,
            report.status_bits.bits(),
            received_at,
        );
        Ok(StatusSnapshot {
            device: self.id.clone(),
            status_bits: report.status_bits,
            position: report.position,
            reading: report.reading,
            received_at,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            last_event: None,
            last_error: None,
        })
    }

    /// Time since the device last sent anything, `None` if it never has.
    pub fn time_since_last_message(&self) -> Option<Duration> {
        let timer = self.timer.lock();
        timer
            .last_message
            .map(|last| Instant::now().saturating_duration_since(last))
    }

    /// Enable (`Some`) or disable (`None`) the liveness threshold.
    ///
    /// Enabling restarts the quiet-time measurement from now.
    pub fn set_liveness_timeout(&self, threshold: Option<Duration>) {
        let mut timer = self.timer.lock();
        timer.threshold = threshold;
        if threshold.is_some() {
            timer.baseline = Instant::now();
        }
    }

    /// The configured liveness threshold.
    pub fn liveness_timeout(&self) -> Option<Duration> {
        self.timer.lock().threshold
    }

    /// True iff monitoring is enabled and the device has been quiet for longer than the
    /// threshold. Always false while monitoring is disabled.
    pub fn has_overrun(&self) -> bool {
        self.timer.lock().has_overrun(Instant::now())
    }

    /// Latest published snapshot.
    pub fn latest_status(&self) -> Option<Arc<StatusSnapshot>> {
        self.status_tx.borrow().clone()
    }

    /// Subscribe to published snapshots.
    pub fn subscribe_status(&self) -> watch::Receiver<Option<Arc<StatusSnapshot>>> {
        self.status_tx.subscribe()
    }

    /// Current polling state.
    pub fn poll_state(&self) -> PollState {
        *self.state_tx.borrow()
    }

    /// Subscribe to polling state changes.
    pub fn subscribe_poll_state(&self) -> watch::Receiver<PollState> {
        self.state_tx.subscribe()
    }

    /// Open a polling epoch: restart the liveness baseline and enter `Polling`.
    pub(crate) fn begin_polling(&self) -> u64 {
        let mut epoch = self.poll_epoch.lock();
        *epoch += 1;
        self.timer.lock().baseline = Instant::now();
        self.write_state(PollState::Polling);
        *epoch
    }

    /// Close the current polling epoch and enter `Stopped`.
    pub(crate) fn end_polling(&self) {
        let mut epoch = self.poll_epoch.lock();
        *epoch += 1;
        self.write_state(PollState::Stopped);
    }

    /// Close `epoch` if it is still current. Used by a poll task that exits on its own.
    pub(crate) fn end_polling_epoch(&self, epoch: u64) -> bool {
        let mut current = self.poll_epoch.lock();
        if *current != epoch {
            return false;
        }
        *current += 1;
        self.write_state(PollState::Stopped);
        true
    }

    /// Drain events pushed since the last call, folded onto `snapshot`, and publish it.
    ///
    /// Returns false without publishing when `epoch` is no longer current.
    pub(crate) fn publish_status(&self, epoch: u64, mut snapshot: StatusSnapshot) -> bool {
        let current = self.poll_epoch.lock();
        if *current != epoch {
            return false;
        }
        if let Some(previous) = self.status_tx.borrow().as_ref() {
            snapshot.last_event = previous.last_event.clone();
            snapshot.last_error = previous.last_error.clone();
        }
        for message in self.events.drain() {
            if message.kind == MessageKind::Error {
                tracing::warn!(device = %self.id, code = message.data, id = message.id, "Device reported an error");
                snapshot.last_error = Some(message.clone());
            }
            snapshot.last_event = Some(message);
        }
        self.status_tx.send_replace(Some(Arc::new(snapshot)));
        true
    }

    /// Re-evaluate liveness for `epoch`: `Polling` becomes `Faulted` on overrun and `Faulted`
    /// returns to `Polling` once the device talks again.
    ///
    /// Returns the new state when it changed.
    pub(crate) fn update_liveness(&self, epoch: u64) -> Option<PollState> {
        let current = self.poll_epoch.lock();
        if *current != epoch {
            return None;
        }
        let next = match (self.poll_state(), self.has_overrun()) {
            (PollState::Polling, true) => PollState::Faulted,
            (PollState::Faulted, false) => PollState::Polling,
            _ => return None,
        };
        self.write_state(next);
        Some(next)
    }

    /// Turn monitoring off and clear a liveness fault.
    pub(crate) fn clear_liveness(&self) {
        let _epoch = self.poll_epoch.lock();
        self.set_liveness_timeout(None);
        if self.poll_state() == PollState::Faulted {
            self.write_state(PollState::Polling);
        }
    }

    fn write_state(&self, state: PollState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Mark the link closed and disconnect the transport. Idempotent.
    pub(crate) async fn shutdown(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.end_polling();
        match self.with_deadline(self.transport.disconnect()).await {
            Ok(()) => tracing::debug!(device = %self.id, "Device link closed"),
            Err(e) => tracing::warn!(device = %self.id, error = %e, "Disconnect failed; link closed anyway"),
        }
    }

    async fn with_deadline<T>(
        &self,
        operation: impl std::future::Future<Output = GatorResult<T>>,
    ) -> GatorResult<T> {
        match tokio::time::timeout(self.request_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(GatorError::Timeout(self.request_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockAxis;

    async fn connected(axis: Arc<MockAxis>) -> Arc<DeviceLink> {
        DeviceLink::connect(DeviceId::new("x_motor"), axis, LinkOptions::default())
            .await
            .unwrap()
    }

    #[test]
    fn status_bits_masks() {
        let bits = StatusBits(0b1010);
        assert!(bits.contains(0b1000));
        assert!(bits.contains(0b1010));
        assert!(!bits.contains(0b0001));
    }

    #[tokio::test]
    async fn poll_counts_as_message() {
        let link = connected(Arc::new(MockAxis::with_position(3.0))).await;
        assert!(link.time_since_last_message().is_none());

        let snapshot = link.poll_once().await.unwrap();
        assert_eq!(snapshot.position, Some(3.0));
        assert_eq!(snapshot.sequence, 1);
        assert!(link.time_since_last_message().is_some());

        let queued = link.messages().drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, MessageKind::Status);
    }

    #[tokio::test]
    async fn poll_does_not_publish() {
        let link = connected(Arc::new(MockAxis::new())).await;
        link.poll_once().await.unwrap();
        assert!(link.latest_status().is_none());
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let axis = Arc::new(MockAxis::new());
        axis.set_silent(true);
        let options = LinkOptions {
            request_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let link = DeviceLink::connect(DeviceId::new("x_motor"), axis, options)
            .await
            .unwrap();

        let err = link.poll_once().await.unwrap_err();
        assert_eq!(err, GatorError::Timeout(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn closed_link_rejects_requests() {
        let link = connected(Arc::new(MockAxis::new())).await;
        link.shutdown().await;
        link.shutdown().await;

        assert!(matches!(
            link.send(DeviceCommand::Stop).await,
            Err(GatorError::NotConnected(_))
        ));
        assert!(matches!(
            link.poll_once().await,
            Err(GatorError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn overrun_requires_enabled_monitoring() {
        let link = connected(Arc::new(MockAxis::new())).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!link.has_overrun());

        link.set_liveness_timeout(Some(Duration::from_millis(10)));
        assert!(!link.has_overrun());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(link.has_overrun());

        link.poll_once().await.unwrap();
        assert!(!link.has_overrun());

        link.set_liveness_timeout(None);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!link.has_overrun());
    }

    #[tokio::test]
    async fn stale_epoch_cannot_leave_stopped() {
        let link = connected(Arc::new(MockAxis::new())).await;
        let epoch = link.begin_polling();
        link.set_liveness_timeout(Some(Duration::from_millis(1)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let snapshot = link.poll_once().await.unwrap();

        link.end_polling();
        assert!(!link.publish_status(epoch, snapshot));
        assert!(link.latest_status().is_none());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(link.update_liveness(epoch), None);
        assert!(!link.end_polling_epoch(epoch));
        assert_eq!(link.poll_state(), PollState::Stopped);

        let next = link.begin_polling();
        assert_eq!(link.update_liveness(epoch), None);
        assert_eq!(link.update_liveness(next), None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(link.update_liveness(next), Some(PollState::Faulted));
        link.clear_liveness();
        assert_eq!(link.poll_state(), PollState::Polling);
    }

    #[tokio::test]
    async fn pushed_events_fold_into_published_snapshot() {
        let link = connected(Arc::new(MockAxis::new())).await;
        let epoch = link.begin_polling();
        let sink = link.sink();
        sink.push(MessageKind::MotionComplete, 0, 0);
        sink.push(MessageKind::Error, 3, 0x20);
        sink.push(MessageKind::Homed, 0, 0);

        let before = Instant::now();
        assert!(link.publish_status(epoch, link.poll_once().await.unwrap()));
        let snapshot = link.latest_status().unwrap();
        assert_eq!(snapshot.last_event.as_ref().map(|m| m.kind), Some(MessageKind::Homed));
        assert_eq!(snapshot.last_error.as_ref().map(|m| m.data), Some(0x20));
        assert!(snapshot.error_since(before).is_none());

        // status replies are not events
        assert!(link.publish_status(epoch, link.poll_once().await.unwrap()));
        let next = link.latest_status().unwrap();
        assert_eq!(next.last_event, snapshot.last_event);
        assert_eq!(next.last_error, snapshot.last_error);
        assert_eq!(link.messages().len(), 5);
    }
}
