//! USB gamepad subsystem
//!
//! Device lifecycle, transfer bookkeeping and the libusb transport.
//!
//! Transfers complete on transport threads. Everything those completions
//! touch lives behind one per-device lock, except the reference count
//! (atomic) and the input sink (read-mostly, see [`presence::SinkSlot`]).

pub mod anchor;
pub mod buffers;
pub mod device;
pub mod error;
pub mod hotplug;
pub mod output;
pub mod presence;
pub mod rusb_transport;

pub use anchor::Anchor;
pub use buffers::{BufferPool, EndpointPair};
pub use device::{DeviceOptions, DeviceStats, GamepadDevice, OpenHandle};
pub use error::DriverError;
pub use hotplug::{HotplugEvent, HotplugWatcher};
pub use output::PermitPool;
pub use presence::{PresenceState, SinkSlot};
pub use rusb_transport::RusbTransport;
