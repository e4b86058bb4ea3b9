//! Common utilities for usb-gamepad
//!
//! This crate provides the seams between the driver core and its
//! collaborators: the bus transport trait and transfer descriptor, the
//! input-event sink trait, the async channel bridge that carries events from
//! the transfer completion context to a Tokio consumer, error handling and
//! logging setup, plus test doubles shared across crates.

pub mod channel;
pub mod error;
pub mod logging;
pub mod sink;
pub mod test_utils;
pub mod transport;

pub use channel::{ChannelSink, EventReceiver, SinkMessage, create_event_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use sink::InputSink;
pub use transport::{CompletionHandler, ReportBuffer, SubmitError, Transfer, Transport};
