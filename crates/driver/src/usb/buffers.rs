//! Transfer buffer pool
//!
//! Owns the report buffers of one device. The single input transfer is
//! parked here between completions and resubmission; output buffers are
//! drawn per report and recycled on completion, up to the permit count.
//! Buffers cross into the transport inside a [`Transfer`] and come back
//! with its completion, so the pool never frees memory the bus can still
//! touch.

use crate::usb::anchor::Anchor;
use crate::usb::error::DriverError;
use common::{CompletionHandler, ReportBuffer, SubmitError, Transfer, Transport};
use protocol::{EndpointDescriptor, REPORT_LEN, TransferId};
use std::sync::Arc;
use tracing::trace;

/// Interrupt endpoints used by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPair {
    pub input: EndpointDescriptor,
    pub output: EndpointDescriptor,
}

impl EndpointPair {
    /// Pick the first interrupt IN and interrupt OUT endpoint
    pub fn discover(endpoints: &[EndpointDescriptor]) -> Result<Self, DriverError> {
        let input = endpoints.iter().find(|ep| ep.is_interrupt_in());
        let output = endpoints.iter().find(|ep| ep.is_interrupt_out());

        match (input, output) {
            (Some(input), Some(output)) => Ok(Self {
                input: *input,
                output: *output,
            }),
            _ => Err(DriverError::EndpointNotFound),
        }
    }
}

/// Allocate one zeroed report buffer without aborting on exhaustion
fn alloc_buffer() -> Result<ReportBuffer, DriverError> {
    let mut bytes: Vec<u8> = Vec::new();
    bytes
        .try_reserve_exact(REPORT_LEN)
        .map_err(|_| DriverError::AllocationFailed)?;
    bytes.resize(REPORT_LEN, 0);

    bytes
        .into_boxed_slice()
        .try_into()
        .map_err(|_| DriverError::AllocationFailed)
}

pub struct BufferPool {
    endpoints: EndpointPair,
    /// Input transfer while it is not submitted
    input: Option<Transfer>,
    /// Output buffers ready for reuse
    spare: Vec<ReportBuffer>,
    max_spare: usize,
    next_id: u64,
}

impl BufferPool {
    /// Allocate the input buffer and `output_slots` output buffers
    pub fn allocate(endpoints: EndpointPair, output_slots: usize) -> Result<Self, DriverError> {
        let mut spare = Vec::new();
        spare
            .try_reserve_exact(output_slots)
            .map_err(|_| DriverError::AllocationFailed)?;
        for _ in 0..output_slots {
            spare.push(alloc_buffer()?);
        }

        let input = Transfer::new(TransferId(0), &endpoints.input, alloc_buffer()?);

        Ok(Self {
            endpoints,
            input: Some(input),
            spare,
            max_spare: output_slots,
            next_id: 1,
        })
    }

    pub fn endpoints(&self) -> &EndpointPair {
        &self.endpoints
    }

    fn next_id(&mut self) -> TransferId {
        let id = TransferId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Whether the input transfer is parked (not in flight)
    pub fn input_parked(&self) -> bool {
        self.input.is_some()
    }

    pub fn spare_outputs(&self) -> usize {
        self.spare.len()
    }

    /// Arm the input transfer under a fresh id
    ///
    /// The id is anchored before submission so a completion racing with the
    /// return of `submit` always finds it.
    pub fn submit_input(
        &mut self,
        transport: &dyn Transport,
        anchor: &Anchor,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<TransferId, DriverError> {
        let id = self.next_id();
        // The input transfer is already in flight
        let mut transfer = self.input.take().ok_or(DriverError::SubmitFailed(-16))?;
        transfer.renew(id);

        anchor.add(id);
        match transport.submit(transfer, handler) {
            Ok(()) => {
                trace!("Input transfer {:?} submitted", id);
                Ok(id)
            }
            Err(SubmitError { transfer, code }) => {
                anchor.remove(id);
                self.input = Some(transfer);
                Err(DriverError::SubmitFailed(code))
            }
        }
    }

    /// Take back the input transfer after its completion
    pub fn park_input(&mut self, transfer: Transfer) {
        self.input = Some(transfer);
    }

    /// Copy `payload` into an output buffer and arm it
    pub fn submit_output(
        &mut self,
        payload: &[u8],
        transport: &dyn Transport,
        anchor: &Anchor,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<TransferId, DriverError> {
        if payload.len() > REPORT_LEN {
            return Err(DriverError::PayloadTooLarge {
                len: payload.len(),
                max: REPORT_LEN,
            });
        }

        let buffer = match self.spare.pop() {
            Some(buffer) => buffer,
            None => alloc_buffer()?,
        };
        let id = self.next_id();
        let mut transfer = Transfer::new(id, &self.endpoints.output, buffer);
        transfer.fill(payload);

        anchor.add(id);
        match transport.submit(transfer, handler) {
            Ok(()) => {
                trace!("Output transfer {:?} submitted ({} bytes)", id, payload.len());
                Ok(id)
            }
            Err(SubmitError { transfer, code }) => {
                anchor.remove(id);
                self.recycle_output(transfer);
                Err(DriverError::SubmitFailed(code))
            }
        }
    }

    /// Return a completed output transfer's buffer to the pool
    pub fn recycle_output(&mut self, transfer: Transfer) {
        if self.spare.len() < self.max_spare {
            self.spare.push(transfer.into_buffer());
        }
    }
}
