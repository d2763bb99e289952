//! Hardware layer
//!
//! Device transports, links and the registry that owns them, plus the capability traits
//! and adapters the stage controller is built from.

pub mod adapters;
pub mod capabilities;
pub mod link;
pub mod mock;
pub mod queue;
pub mod registry;

pub use adapters::{LinearAxis, PowerMeter, TravelLimits, TriggerSource};
pub use capabilities::{Capability, Movable, Readable, Triggerable};
pub use link::{
    DeviceCommand, DeviceId, DeviceLink, DeviceTransport, LinkOptions, MessageSink, PollState,
    StatusBits, StatusReport, StatusSnapshot, TransportFactory,
};
pub use queue::{Message, MessageKind, MessageQueue};
pub use registry::{DeviceHandle, DeviceInfo, DeviceRegistry};
