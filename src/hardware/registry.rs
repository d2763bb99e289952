//! Device Registry for Runtime Hardware Management
//!
//! The registry owns every open [`DeviceLink`] and hands out copyable [`DeviceHandle`]s.
//! Handles are indices into an arena of slots, tagged with a generation counter: closing a
//! device bumps its slot's generation, so a handle kept past `close` resolves to
//! `NotConnected` and can never alias a device opened later into the same slot.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     DeviceRegistry                        │
//! │   slots: [ Live(x_motor) | Opening(y_motor) | Vacant ]    │
//! │   by_id: { x_motor → 0, y_motor → 1 }                     │
//! ├───────────────────────────────────────────────────────────┤
//! │ DeviceLink (queue, last-message timer, status snapshot)   │
//! ├───────────────────────────────────────────────────────────┤
//! │ DeviceTransport (vendor SDK, serial, mock)                │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! At most one live handle exists per identity. `open` reserves the identity under the
//! table lock before connecting, so concurrent opens of the same device resolve
//! deterministically: the first reservation wins and every other caller gets
//! `AlreadyOpen`. Connecting happens outside the lock.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let registry = DeviceRegistry::new(Arc::new(MockFactory::from_config(&config)), LinkOptions::default());
//! let x = registry.open("27500001").await?;
//! registry.send(x, DeviceCommand::MoveAbsolute(12.5)).await?;
//! registry.close(x).await;
//! ```

use crate::error::{GatorError, GatorResult};
use crate::hardware::link::{
    DeviceCommand, DeviceId, DeviceLink, LinkOptions, PollState, StatusSnapshot, TransportFactory,
};
use crate::hardware::queue::MessageQueue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Handles
// =============================================================================

/// Reference to an open device.
///
/// Valid from a successful `open` until the matching `close`; stale afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}.{}", self.index, self.generation)
    }
}

/// Summary of one open device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Handle of the device
    pub handle: DeviceHandle,
    /// Device identity
    pub id: DeviceId,
    /// Current polling state
    pub poll_state: PollState,
    /// Messages queued and not yet consumed
    pub queued_messages: usize,
    /// Messages evicted from a full queue
    pub dropped_messages: u64,
}

// =============================================================================
// Slot table
// =============================================================================

enum SlotState {
    Vacant,
    Opening(DeviceId),
    Live(Arc<DeviceLink>),
}

struct Slot {
    generation: u32,
    state: SlotState,
}

#[derive(Default)]
struct SlotTable {
    slots: Vec<Slot>,
    by_id: HashMap<DeviceId, usize>,
    free: Vec<usize>,
}

impl SlotTable {
    fn reserve(&mut self, id: &DeviceId) -> GatorResult<usize> {
        if self.by_id.contains_key(id) {
            return Err(GatorError::AlreadyOpen(id.to_string()));
        }
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].state = SlotState::Opening(id.clone());
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    state: SlotState::Opening(id.clone()),
                });
                self.slots.len() - 1
            }
        };
        self.by_id.insert(id.clone(), index);
        Ok(index)
    }

    fn commit(&mut self, index: usize, link: Arc<DeviceLink>) -> DeviceHandle {
        let slot = &mut self.slots[index];
        slot.state = SlotState::Live(link);
        DeviceHandle {
            index: index as u32,
            generation: slot.generation,
        }
    }

    /// Give a slot back, invalidating every handle that referenced it.
    fn release(&mut self, index: usize) -> Option<Arc<DeviceLink>> {
        let slot = &mut self.slots[index];
        let previous = std::mem::replace(&mut slot.state, SlotState::Vacant);
        slot.generation = slot.generation.wrapping_add(1);
        let id = match &previous {
            SlotState::Vacant => return None,
            SlotState::Opening(id) => id.clone(),
            SlotState::Live(link) => link.id().clone(),
        };
        self.by_id.remove(&id);
        self.free.push(index);
        match previous {
            SlotState::Live(link) => Some(link),
            _ => None,
        }
    }

    fn live(&self, handle: DeviceHandle) -> Option<&Arc<DeviceLink>> {
        let slot = self.slots.get(handle.index as usize)?;
        match &slot.state {
            SlotState::Live(link) if slot.generation == handle.generation => Some(link),
            _ => None,
        }
    }
}

/// Releases an `Opening` reservation unless the open committed, including when the
/// opening future is dropped mid-connect.
struct Reservation<'a> {
    table: &'a Mutex<SlotTable>,
    index: usize,
    armed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, link: Arc<DeviceLink>) -> DeviceHandle {
        self.armed = false;
        self.table.lock().commit(self.index, link)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.table.lock().release(self.index);
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Central registry for open device links.
pub struct DeviceRegistry {
    factory: Arc<dyn TransportFactory>,
    options: LinkOptions,
    table: Mutex<SlotTable>,
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("options", &self.options)
            .field("open", &self.len())
            .finish()
    }
}

impl DeviceRegistry {
    /// Create a registry resolving identities through `factory`.
    pub fn new(factory: Arc<dyn TransportFactory>, options: LinkOptions) -> Self {
        Self {
            factory,
            options,
            table: Mutex::new(SlotTable::default()),
        }
    }

    /// Open the device with identity `id`.
    ///
    /// # Errors
    /// - `AlreadyOpen` if the identity has a live or in-progress handle
    /// - `NotFound` if the factory does not know the identity
    /// - `Timeout`/`Io` if connecting fails
    pub async fn open(&self, id: impl Into<DeviceId>) -> GatorResult<DeviceHandle> {
        let id = id.into();
        let index = self.table.lock().reserve(&id)?;
        let reservation = Reservation {
            table: &self.table,
            index,
            armed: true,
        };

        let transport = self.factory.create(&id)?;
        let link = DeviceLink::connect(id.clone(), transport, self.options).await?;
        let handle = reservation.commit(link);
        tracing::info!(device = %id, %handle, "Device opened");
        Ok(handle)
    }

    /// Close a device. Idempotent: closing a stale handle is a no-op.
    ///
    /// Disconnect failures are logged and never reported; the handle is stale afterwards
    /// either way.
    pub async fn close(&self, handle: DeviceHandle) {
        let link = {
            let mut table = self.table.lock();
            if table.live(handle).is_none() {
                return;
            }
            table.release(handle.index as usize)
        };
        if let Some(link) = link {
            link.shutdown().await;
            tracing::info!(device = %link.id(), %handle, "Device closed");
        }
    }

    /// Resolve a handle to its link.
    ///
    /// # Errors
    /// `NotConnected` for a stale handle.
    pub fn link(&self, handle: DeviceHandle) -> GatorResult<Arc<DeviceLink>> {
        self.table
            .lock()
            .live(handle)
            .cloned()
            .ok_or_else(|| GatorError::NotConnected(handle.to_string()))
    }

    /// Handle of the open device with identity `id`.
    pub fn handle_of(&self, id: &DeviceId) -> Option<DeviceHandle> {
        let table = self.table.lock();
        let index = *table.by_id.get(id)?;
        let slot = &table.slots[index];
        match slot.state {
            SlotState::Live(_) => Some(DeviceHandle {
                index: index as u32,
                generation: slot.generation,
            }),
            _ => None,
        }
    }

    /// Deliver a command to a device.
    pub async fn send(&self, handle: DeviceHandle, command: DeviceCommand) -> GatorResult<()> {
        self.link(handle)?.send(command).await
    }

    /// Request one status report without publishing it.
    pub async fn poll_once(&self, handle: DeviceHandle) -> GatorResult<StatusSnapshot> {
        self.link(handle)?.poll_once().await
    }

    /// Message queue of a device.
    pub fn messages(&self, handle: DeviceHandle) -> GatorResult<Arc<MessageQueue>> {
        Ok(self.link(handle)?.messages())
    }

    /// Time since a device last sent anything.
    pub fn time_since_last_message(&self, handle: DeviceHandle) -> GatorResult<Option<Duration>> {
        Ok(self.link(handle)?.time_since_last_message())
    }

    /// Summaries of every open device, sorted by identity.
    pub fn list(&self) -> Vec<DeviceInfo> {
        let table = self.table.lock();
        let mut devices: Vec<DeviceInfo> = table
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.state {
                SlotState::Live(link) => {
                    let queue = link.messages();
                    Some(DeviceInfo {
                        handle: DeviceHandle {
                            index: index as u32,
                            generation: slot.generation,
                        },
                        id: link.id().clone(),
                        poll_state: link.poll_state(),
                        queued_messages: queue.len(),
                        dropped_messages: queue.dropped_count(),
                    })
                }
                _ => None,
            })
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Handles of every open device.
    pub fn handles(&self) -> Vec<DeviceHandle> {
        self.list().into_iter().map(|info| info.handle).collect()
    }

    /// Number of open devices.
    pub fn len(&self) -> usize {
        let table = self.table.lock();
        table
            .slots
            .iter()
            .filter(|slot| matches!(slot.state, SlotState::Live(_)))
            .count()
    }

    /// True when no device is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
