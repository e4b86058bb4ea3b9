//! USB type definitions
//!
//! Types shared between the driver core and the transport that carries its
//! transfers: endpoint descriptors, transfer identifiers and completion
//! statuses.

use serde::{Deserialize, Serialize};

/// Identity of one attached gamepad
///
/// Opaque to the driver core beyond pass-through to the event consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Human-readable device name
    pub name: String,
    /// Stable physical path, e.g. `usb-1-4/input0`
    pub phys: String,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
}

impl DeviceIdentity {
    /// Build the physical path from a bus number and port chain
    ///
    /// Mirrors the `usb-<bus>-<port>.<port>/input0` form used by Linux.
    pub fn phys_path(bus: u8, ports: &[u8]) -> String {
        let ports: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
        format!("usb-{}-{}/input0", bus, ports.join("."))
    }
}

/// Endpoint direction, from bit 7 of the endpoint address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointDirection {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl EndpointDirection {
    pub fn from_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            EndpointDirection::In
        } else {
            EndpointDirection::Out
        }
    }
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint descriptor as reported by the bus for the claimed interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Endpoint address (e.g., 0x81 for IN endpoint 1)
    pub address: u8,
    pub kind: EndpointKind,
    pub max_packet_size: u16,
    /// Polling interval (bInterval)
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn direction(&self) -> EndpointDirection {
        EndpointDirection::from_address(self.address)
    }

    pub fn is_interrupt_in(&self) -> bool {
        self.kind == EndpointKind::Interrupt && self.direction() == EndpointDirection::In
    }

    pub fn is_interrupt_out(&self) -> bool {
        self.kind == EndpointKind::Interrupt && self.direction() == EndpointDirection::Out
    }
}

/// Identifier of one submission, unique per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(pub u64);

/// Completion status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Transfer completed and carries data
    Success,
    /// Transfer was unlinked (cancelled) by the host side
    ConnectionReset,
    /// Transfer was killed because its endpoint went away
    EndpointGone,
    /// The device is being removed or the bus is shutting down
    ShuttingDown,
    /// Any other failure, with the transport's error code
    Other(i32),
}

impl TransferStatus {
    /// Statuses that end a transfer's life: never resubmit, never treat as an error
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::ConnectionReset
                | TransferStatus::EndpointGone
                | TransferStatus::ShuttingDown
        )
    }

    pub fn is_success(&self) -> bool {
        *self == TransferStatus::Success
    }
}
