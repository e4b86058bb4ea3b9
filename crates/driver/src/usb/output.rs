//! Output queue
//!
//! Outbound reports are throttled by a fixed pool of permits: a writer
//! takes one before its transfer is armed and the completion hands it back,
//! whatever the status. A writer with no permit blocks on the device's
//! condition variable until a completion or a removal wakes it.

use crate::usb::device::DeviceShared;
use crate::usb::error::DriverError;
use common::Transfer;
use protocol::{REPORT_LEN, TransferId, TransferStatus};
use std::sync::PoisonError;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Most of the removal budget kept for force-cancelled outputs to come back
const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Counting semaphore over the device lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermitPool {
    capacity: usize,
    available: usize,
}

impl PermitPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            available: capacity,
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        if self.available == 0 {
            return false;
        }
        self.available -= 1;
        true
    }

    /// Return a permit; never grows past capacity
    pub fn release(&mut self) -> bool {
        if self.available == self.capacity {
            return false;
        }
        self.available += 1;
        true
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.available
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.available
    }
}

/// Output side of the per-device state
#[derive(Debug)]
pub(crate) struct OutputQueue {
    pub(crate) permits: PermitPool,
    /// At least one output was armed and no terminal status has been seen since
    pub(crate) active: bool,
}

impl OutputQueue {
    pub(crate) fn new(writes_in_flight: usize) -> Self {
        Self {
            permits: PermitPool::new(writes_in_flight),
            active: false,
        }
    }
}

impl DeviceShared {
    /// Arm one outbound report, blocking while every permit is in use
    pub(crate) fn enqueue(&self, payload: &[u8]) -> Result<TransferId, DriverError> {
        if payload.len() > REPORT_LEN {
            return Err(DriverError::PayloadTooLarge {
                len: payload.len(),
                max: REPORT_LEN,
            });
        }

        let mut state = self.lock_state();
        loop {
            if !state.present {
                return Err(DriverError::DeviceGone);
            }
            if state.output.permits.try_acquire() {
                break;
            }
            trace!("All {} output permits in use, waiting", state.output.permits.capacity());
            state = self
                .permit_returned
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let state = &mut *state;
        let submitted = match state.pool.as_mut() {
            Some(pool) => pool.submit_output(
                payload,
                &*self.transport,
                &self.output_anchor,
                self.handler.clone(),
            ),
            None => Err(DriverError::DeviceGone),
        };

        match submitted {
            Ok(id) => {
                state.output.active = true;
                Ok(id)
            }
            Err(e) => {
                state.output.permits.release();
                self.permit_returned.notify_one();
                Err(e)
            }
        }
    }

    pub(crate) fn complete_output(&self, transfer: Transfer, status: TransferStatus) {
        let id = transfer.id();
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            state.output.permits.release();
            if status.is_terminal() {
                state.output.active = false;
            }
            if let Some(pool) = state.pool.as_mut() {
                pool.recycle_output(transfer);
            }
        }
        self.permit_returned.notify_one();
        self.output_anchor.remove(id);

        match status {
            TransferStatus::Success => {
                self.counters.outputs_sent.fetch_add(1, Ordering::Relaxed);
                trace!("Output transfer {:?} done", id);
            }
            status if status.is_terminal() => {
                debug!("Output transfer {:?} ended: {:?}", id, status);
            }
            status => {
                self.counters.outputs_failed.fetch_add(1, Ordering::Relaxed);
                warn!("Output transfer {:?} failed: {:?}", id, status);
            }
        }
    }

    /// Wait out pending outputs, then cancel whatever is left
    ///
    /// Everything happens before `deadline`: the tail of the budget is kept
    /// for cancelled transfers to come back, and whatever is still tracked
    /// when it runs out is abandoned.
    pub(crate) fn drain_outputs(&self, deadline: Instant) {
        let pending = self.output_anchor.len();
        if pending == 0 {
            return;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let grace = CANCEL_GRACE.min(remaining / 4);
        debug!(
            "Waiting up to {:?} for {} output transfers",
            remaining - grace,
            pending
        );
        if self.output_anchor.wait_empty_until(deadline - grace) {
            return;
        }

        warn!(
            "{} output transfers still pending after {:?}, cancelling",
            self.output_anchor.len(),
            remaining - grace
        );
        self.output_anchor.cancel_all(&*self.transport);

        if !self.output_anchor.wait_empty_until(deadline) {
            let abandoned = self.output_anchor.abandon();
            error!(
                "{} output transfers ignored cancellation, abandoning them",
                abandoned
            );
        }
    }
}
