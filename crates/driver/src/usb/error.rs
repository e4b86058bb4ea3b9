//! Driver error taxonomy

use crate::usb::presence::PresenceState;
use thiserror::Error;

/// Errors surfaced by the device lifecycle and output path
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The interface lacks an interrupt IN or interrupt OUT endpoint
    #[error("Interrupt IN and OUT endpoints not found on interface")]
    EndpointNotFound,

    /// A transfer buffer could not be allocated
    #[error("Failed to allocate transfer buffer")]
    AllocationFailed,

    /// The transport refused a transfer
    #[error("Transfer submission failed (code {0})")]
    SubmitFailed(i32),

    /// The device has been removed
    #[error("Device is gone")]
    DeviceGone,

    /// The link could not be resumed for an open
    #[error("Power resume failed (code {0})")]
    PowerResumeFailed(i32),

    /// The input sink refused the device
    #[error("Input sink registration failed: {0}")]
    Registration(String),

    /// Output payload longer than one report
    #[error("Payload too large: {len} bytes (max: {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// Presence state machine rejected a transition
    #[error("Invalid presence transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: PresenceState,
        to: PresenceState,
    },
}

impl From<common::Error> for DriverError {
    fn from(err: common::Error) -> Self {
        DriverError::Registration(err.to_string())
    }
}
