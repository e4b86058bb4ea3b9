//! Input-event sink boundary
//!
//! A sink is the consumer side of the driver: it learns the device's
//! capability set once at attach time and then receives one event frame per
//! input report. Frames are runs of key/axis events closed by
//! [`InputEvent::Sync`].

use protocol::{Capabilities, DecodedReport, DeviceIdentity, InputEvent};

/// Consumer of decoded gamepad input
///
/// `emit` and `publish` are called from the transfer completion context and
/// must not block.
pub trait InputSink: Send + Sync {
    /// Announce a device and its capabilities
    fn register(&self, identity: &DeviceIdentity, capabilities: &Capabilities)
    -> crate::Result<()>;

    /// Deliver one event
    fn emit(&self, event: InputEvent);

    /// Close the current frame
    fn sync(&self) {
        self.emit(InputEvent::Sync);
    }

    /// The device is gone; no further events follow
    fn unregister(&self);

    /// Deliver a whole report as one frame
    fn publish(&self, report: &DecodedReport) {
        for event in report.events() {
            self.emit(event);
        }
    }
}
