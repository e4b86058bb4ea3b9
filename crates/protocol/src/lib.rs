//! Report protocol for the usb-gamepad driver
//!
//! This crate defines everything about the gamepad that can be stated without
//! touching a bus: the fixed 64-byte input report layout and its decoder, the
//! capability list announced to an input-event consumer, the event stream
//! produced per report, the opaque output report payload, and the USB types
//! shared with the transport layer.
//!
//! Nothing here performs I/O or holds device state.
//!
//! # Example
//!
//! ```
//! use protocol::{Axis, Button, REPORT_LEN, decode};
//!
//! let mut raw = [0u8; REPORT_LEN];
//! raw[2] = 0x01; // dpad up
//! raw[3] = 0x10; // A
//!
//! let report = decode(&raw);
//! assert!(report.pressed(Button::DpadUp));
//! assert!(report.pressed(Button::A));
//! assert_eq!(report.axis(Axis::LeftX), 0);
//! ```

pub mod capabilities;
pub mod error;
pub mod event;
pub mod output;
pub mod report;
pub mod types;

pub use capabilities::{AXES, AbsInfo, Axis, BUTTONS, Button, Capabilities};
pub use error::{ProtocolError, Result};
pub use event::InputEvent;
pub use output::OutputReport;
pub use report::{DecodedReport, REPORT_LEN, decode, decode_slice};
pub use types::{
    DeviceIdentity, EndpointDescriptor, EndpointDirection, EndpointKind, TransferId,
    TransferStatus,
};
