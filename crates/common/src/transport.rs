//! Bus transport boundary
//!
//! The driver core never talks to a USB stack directly. It hands
//! [`Transfer`] descriptors to a [`Transport`], which performs them
//! asynchronously and reports each outcome through a [`CompletionHandler`]
//! on a context of its own choosing (a worker thread, an event loop, an
//! interrupt handler). Completion handlers must not block.
//!
//! Ownership of the report buffer travels with the transfer: it moves into
//! the transport on [`Transport::submit`] and comes back with the
//! completion (or with the [`SubmitError`]), so a buffer can never be
//! released while the bus may still write into it.

use protocol::{EndpointDescriptor, EndpointDirection, REPORT_LEN, TransferId, TransferStatus};
use std::fmt;
use std::sync::Arc;

/// Fixed-size, heap-pinned report buffer
pub type ReportBuffer = Box<[u8; REPORT_LEN]>;

/// One asynchronous interrupt transfer
pub struct Transfer {
    id: TransferId,
    endpoint: u8,
    interval: u8,
    buffer: ReportBuffer,
    /// Bytes to send (OUT) or requested (IN)
    length: usize,
    /// Bytes actually moved by the bus
    actual_length: usize,
}

impl Transfer {
    /// Create a transfer over `buffer` for `endpoint`
    ///
    /// IN transfers request the full report length; OUT transfers start
    /// empty until [`Transfer::fill`] is called.
    pub fn new(id: TransferId, endpoint: &EndpointDescriptor, buffer: ReportBuffer) -> Self {
        let length = match endpoint.direction() {
            EndpointDirection::In => REPORT_LEN,
            EndpointDirection::Out => 0,
        };

        Self {
            id,
            endpoint: endpoint.address,
            interval: endpoint.interval,
            buffer,
            length,
            actual_length: 0,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Give the transfer a fresh identity before resubmitting it
    pub fn renew(&mut self, id: TransferId) {
        self.id = id;
        self.actual_length = 0;
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn direction(&self) -> EndpointDirection {
        EndpointDirection::from_address(self.endpoint)
    }

    pub fn interval(&self) -> u8 {
        self.interval
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Copy an outbound payload into the buffer
    ///
    /// The caller guarantees `payload.len() <= REPORT_LEN`; anything past the
    /// buffer is cut off.
    pub fn fill(&mut self, payload: &[u8]) {
        let len = payload.len().min(REPORT_LEN);
        self.buffer[..len].copy_from_slice(&payload[..len]);
        self.buffer[len..].fill(0);
        self.length = len;
    }

    /// Bytes the transport should send
    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.length]
    }

    /// Whole buffer, for transports reading into it
    pub fn buffer_mut(&mut self) -> &mut [u8; REPORT_LEN] {
        &mut self.buffer
    }

    pub fn buffer(&self) -> &[u8; REPORT_LEN] {
        &self.buffer
    }

    pub fn actual_length(&self) -> usize {
        self.actual_length
    }

    pub fn set_actual_length(&mut self, len: usize) {
        self.actual_length = len.min(REPORT_LEN);
    }

    /// Bytes received by the last completion
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length]
    }

    pub fn into_buffer(self) -> ReportBuffer {
        self.buffer
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("endpoint", &format_args!("{:#04x}", self.endpoint))
            .field("length", &self.length)
            .field("actual_length", &self.actual_length)
            .finish()
    }
}

/// Transport refused a submission; the transfer is handed back
#[derive(Debug)]
pub struct SubmitError {
    pub transfer: Transfer,
    /// Transport error code (negative errno / libusb style)
    pub code: i32,
}

/// Receives transfer completions on the transport's completion context
pub trait CompletionHandler: Send + Sync {
    fn complete(&self, transfer: Transfer, status: TransferStatus);
}

/// Bus layer as seen by the driver core
///
/// Contract:
/// - `submit` must not invoke the handler before it returns; the caller may
///   hold locks the handler needs.
/// - Every accepted transfer is completed exactly once, including after
///   `cancel` (with a terminal status).
/// - `cancel` may complete the transfer on the calling thread.
pub trait Transport: Send + Sync {
    /// Endpoints of the claimed interface
    fn endpoints(&self) -> Vec<EndpointDescriptor>;

    /// Arm one transfer
    fn submit(
        &self,
        transfer: Transfer,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<(), SubmitError>;

    /// Request cancellation of a submitted transfer; unknown ids are ignored
    fn cancel(&self, id: TransferId);

    /// Take a power-management reference, resuming the link if suspended
    fn power_resume(&self) -> Result<(), i32>;

    /// Drop a reference taken by [`Transport::power_resume`]
    fn power_release(&self);

    /// Give the interface and device back; called once, after the last transfer
    fn release(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::EndpointKind;

    fn endpoint(address: u8) -> EndpointDescriptor {
        EndpointDescriptor {
            address,
            kind: EndpointKind::Interrupt,
            max_packet_size: 32,
            interval: 4,
        }
    }

    #[test]
    fn test_in_transfer_requests_full_report() {
        let transfer = Transfer::new(TransferId(1), &endpoint(0x81), Box::new([0; REPORT_LEN]));
        assert_eq!(transfer.direction(), EndpointDirection::In);
        assert_eq!(transfer.length(), REPORT_LEN);
        assert!(transfer.data().is_empty());
    }

    #[test]
    fn test_out_fill_clears_stale_bytes() {
        let mut transfer =
            Transfer::new(TransferId(2), &endpoint(0x02), Box::new([0xaa; REPORT_LEN]));
        transfer.fill(&[1, 2, 3]);

        assert_eq!(transfer.payload(), &[1, 2, 3]);
        assert!(transfer.buffer()[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_renew_resets_length() {
        let mut transfer = Transfer::new(TransferId(1), &endpoint(0x81), Box::new([0; REPORT_LEN]));
        transfer.set_actual_length(20);
        transfer.renew(TransferId(7));

        assert_eq!(transfer.id(), TransferId(7));
        assert_eq!(transfer.actual_length(), 0);
    }

    #[test]
    fn test_actual_length_is_clamped() {
        let mut transfer = Transfer::new(TransferId(1), &endpoint(0x81), Box::new([0; REPORT_LEN]));
        transfer.set_actual_length(1000);
        assert_eq!(transfer.data().len(), REPORT_LEN);
    }
}
