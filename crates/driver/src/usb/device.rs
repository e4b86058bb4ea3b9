//! Gamepad device object
//!
//! One [`GamepadDevice`] exists per bound interface. It is shared between
//! the thread that attached it, every [`OpenHandle`], and the transport's
//! completion context.
//!
//! Lifetime is reference counted: attach holds one reference, each open
//! handle holds one more. Whoever drops the count to zero performs the
//! reclamation (buffers dropped, transport released) exactly once. Removal
//! ([`GamepadDevice::detach`]) only clears presence and drops the attach
//! reference, so open handles keep the object alive until they close.
//!
//! Lock order: device state, then anchor. Completion handlers take the
//! device state lock briefly and never block on anything else.

use crate::usb::anchor::Anchor;
use crate::usb::buffers::{BufferPool, EndpointPair};
use crate::usb::error::DriverError;
use crate::usb::output::OutputQueue;
use crate::usb::presence::{PresenceState, SinkSlot};
use common::{CompletionHandler, InputSink, Transfer, Transport};
use protocol::{
    Capabilities, DeviceIdentity, EndpointDirection, TransferStatus, decode_slice,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Output transfers allowed in flight at once
pub const DEFAULT_WRITES_IN_FLIGHT: usize = 8;

/// How long removal waits for outstanding outputs
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(5000);

/// Per-device tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceOptions {
    pub writes_in_flight: usize,
    pub drain_timeout: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            writes_in_flight: DEFAULT_WRITES_IN_FLIGHT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) reports: AtomicU64,
    pub(crate) input_errors: AtomicU64,
    pub(crate) outputs_sent: AtomicU64,
    pub(crate) outputs_failed: AtomicU64,
}

/// Transfer counters of one attachment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    /// Input reports decoded and published
    pub reports: u64,
    /// Input completions with a non-terminal error
    pub input_errors: u64,
    pub outputs_sent: u64,
    pub outputs_failed: u64,
}

/// State guarded by the device lock
pub(crate) struct DeviceState {
    pub(crate) present: bool,
    pub(crate) lifecycle: PresenceState,
    /// Input loop is armed
    pub(crate) polling: bool,
    pub(crate) output: OutputQueue,
    pub(crate) pool: Option<BufferPool>,
    /// Transport has been released
    pub(crate) released: bool,
}

pub(crate) struct DeviceShared {
    pub(crate) identity: DeviceIdentity,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) options: DeviceOptions,
    pub(crate) state: Mutex<DeviceState>,
    /// Signalled when an output permit comes back or presence drops
    pub(crate) permit_returned: Condvar,
    /// Signalled when the transport has been released
    pub(crate) release_done: Condvar,
    pub(crate) refs: AtomicUsize,
    pub(crate) reclaimed: AtomicBool,
    pub(crate) detached: AtomicBool,
    pub(crate) sink: SinkSlot,
    pub(crate) input_anchor: Anchor,
    pub(crate) output_anchor: Anchor,
    pub(crate) counters: Counters,
    pub(crate) handler: Arc<dyn CompletionHandler>,
}

/// Completion entry point handed to the transport
///
/// Holds a weak reference so an in-flight transfer never keeps a
/// reclaimed device alive.
struct Completions {
    device: Weak<DeviceShared>,
}

impl CompletionHandler for Completions {
    fn complete(&self, transfer: Transfer, status: TransferStatus) {
        let Some(device) = self.device.upgrade() else {
            trace!("Completion for {:?} after device drop ignored", transfer.id());
            return;
        };
        if device.reclaimed.load(Ordering::Acquire) {
            trace!("Completion for {:?} after reclamation ignored", transfer.id());
            return;
        }

        match transfer.direction() {
            EndpointDirection::In => device.complete_input(transfer, status),
            EndpointDirection::Out => device.complete_output(transfer, status),
        }
    }
}

impl DeviceShared {
    fn new(
        weak: &Weak<DeviceShared>,
        transport: Arc<dyn Transport>,
        identity: DeviceIdentity,
        sink: Arc<dyn InputSink>,
        options: DeviceOptions,
        pool: BufferPool,
    ) -> Self {
        Self {
            identity,
            transport,
            options,
            state: Mutex::new(DeviceState {
                present: false,
                lifecycle: PresenceState::Detached,
                polling: false,
                output: OutputQueue::new(options.writes_in_flight.max(1)),
                pool: Some(pool),
                released: false,
            }),
            permit_returned: Condvar::new(),
            release_done: Condvar::new(),
            refs: AtomicUsize::new(1),
            reclaimed: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            sink: SinkSlot::new(sink),
            input_anchor: Anchor::new("input"),
            output_anchor: Anchor::new("output"),
            counters: Counters::default(),
            handler: Arc::new(Completions {
                device: weak.clone(),
            }),
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, to: PresenceState) -> Result<(), DriverError> {
        let mut state = self.lock_state();
        let from = state.lifecycle;
        state.lifecycle.transition(to)?;
        debug!("{}: {:?} -> {:?}", self.identity.name, from, to);
        Ok(())
    }

    /// Register with the sink and arm the first input transfer
    fn start(&self) -> Result<(), DriverError> {
        self.advance(PresenceState::Attaching)?;

        let capabilities = Capabilities::gamepad();
        if let Some(Err(e)) = self
            .sink
            .with(|sink| sink.register(&self.identity, &capabilities))
        {
            self.sink.retract();
            return Err(DriverError::Registration(e.to_string()));
        }

        let armed = {
            let mut state = self.lock_state();
            let state = &mut *state;
            state.present = true;

            let submitted = match state.pool.as_mut() {
                Some(pool) => {
                    pool.submit_input(&*self.transport, &self.input_anchor, self.handler.clone())
                }
                None => Err(DriverError::AllocationFailed),
            };
            match submitted {
                Ok(_) => {
                    state.polling = true;
                    state.lifecycle.transition(PresenceState::Active)
                }
                Err(e) => {
                    state.present = false;
                    Err(e)
                }
            }
        };

        if let Err(e) = armed {
            if let Some(sink) = self.sink.retract() {
                sink.unregister();
            }
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn complete_input(&self, transfer: Transfer, status: TransferStatus) {
        let id = transfer.id();
        let resubmit = match status {
            TransferStatus::Success => {
                let report = decode_slice(transfer.data());
                trace!("Report {:?}: {} bytes", id, transfer.actual_length());
                self.sink.with(|sink| sink.publish(&report));
                self.counters.reports.fetch_add(1, Ordering::Relaxed);
                true
            }
            status if status.is_terminal() => {
                debug!("Input transfer {:?} ended: {:?}", id, status);
                false
            }
            status => {
                self.counters.input_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Input transfer {:?} failed: {:?}, resubmitting", id, status);
                true
            }
        };

        let resubmitted = {
            let mut state = self.lock_state();
            let state = &mut *state;
            match state.pool.as_mut() {
                Some(pool) => {
                    pool.park_input(transfer);
                    if resubmit && state.present {
                        let result = pool.submit_input(
                            &*self.transport,
                            &self.input_anchor,
                            self.handler.clone(),
                        );
                        state.polling = result.is_ok();
                        Some(result)
                    } else {
                        state.polling = false;
                        None
                    }
                }
                None => None,
            }
        };
        // The replacement is anchored before the old id goes
        self.input_anchor.remove(id);

        if let Some(Err(e)) = resubmitted {
            error!(
                "Input polling for {} stopped, re-attach required: {}",
                self.identity.name, e
            );
        }
    }

    /// Drop one reference; the last one reclaims
    pub(crate) fn put(&self) {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        trace!("{}: references {} -> {}", self.identity.name, previous, previous.saturating_sub(1));
        if previous == 1 {
            self.reclaim();
        }
    }

    fn reclaim(&self) {
        if self.reclaimed.swap(true, Ordering::AcqRel) {
            return;
        }

        let pool = {
            let mut state = self.lock_state();
            if let Err(e) = state.lifecycle.transition(PresenceState::Reclaimed) {
                error!("{}: {}", self.identity.name, e);
            }
            state.present = false;
            state.polling = false;
            state.pool.take()
        };
        drop(pool);

        let stranded = self.input_anchor.len() + self.output_anchor.len();
        if stranded > 0 {
            warn!(
                "{}: reclaiming with {} abandoned transfers",
                self.identity.name, stranded
            );
        }
        self.transport.release();

        self.lock_state().released = true;
        self.release_done.notify_all();
        info!("{} ({}) reclaimed", self.identity.name, self.identity.phys);
    }

    fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            debug!("{} already detached", self.identity.name);
            return;
        }
        info!("Detaching {} ({})", self.identity.name, self.identity.phys);
        // One budget covers the input cancel and the output drain
        let deadline = Instant::now() + self.options.drain_timeout;

        {
            let mut state = self.lock_state();
            state.present = false;
            if let Err(e) = state.lifecycle.transition(PresenceState::Detaching) {
                debug!("{}: {}", self.identity.name, e);
            }
        }
        // Writers waiting for a permit fail with DeviceGone
        self.permit_returned.notify_all();

        self.input_anchor.cancel_all(&*self.transport);
        if !self.input_anchor.wait_empty_until(deadline) {
            let abandoned = self.input_anchor.abandon();
            warn!(
                "Input transfer ignored cancellation, abandoned {}",
                abandoned
            );
        }

        if let Some(sink) = self.sink.retract() {
            sink.unregister();
        }

        self.drain_outputs(deadline);

        debug!("{}: {:?}", self.identity.name, self.stats());
        self.put();
    }

    fn stats(&self) -> DeviceStats {
        DeviceStats {
            reports: self.counters.reports.load(Ordering::Relaxed),
            input_errors: self.counters.input_errors.load(Ordering::Relaxed),
            outputs_sent: self.counters.outputs_sent.load(Ordering::Relaxed),
            outputs_failed: self.counters.outputs_failed.load(Ordering::Relaxed),
        }
    }
}

/// A bound gamepad interface
///
/// Dropping the device detaches it if that has not happened yet, which can
/// block for up to the drain timeout. Neither `detach` nor the drop may run
/// on the transport's completion context.
pub struct GamepadDevice {
    shared: Arc<DeviceShared>,
}

impl GamepadDevice {
    /// Bind an interface and start polling it
    ///
    /// On failure everything acquired so far is released again, including
    /// the transport.
    pub fn attach(
        transport: Arc<dyn Transport>,
        identity: DeviceIdentity,
        sink: Arc<dyn InputSink>,
        options: DeviceOptions,
    ) -> Result<Self, DriverError> {
        let prepared = EndpointPair::discover(&transport.endpoints())
            .and_then(|endpoints| BufferPool::allocate(endpoints, options.writes_in_flight));
        let pool = match prepared {
            Ok(pool) => pool,
            Err(e) => {
                warn!("Cannot attach {}: {}", identity.name, e);
                transport.release();
                return Err(e);
            }
        };

        let shared = Arc::new_cyclic(|weak| {
            DeviceShared::new(weak, transport, identity, sink, options, pool)
        });

        if let Err(e) = shared.start() {
            warn!("Cannot attach {}: {}", shared.identity.name, e);
            shared.put();
            return Err(e);
        }

        let endpoints = shared
            .lock_state()
            .pool
            .as_ref()
            .map(|pool| *pool.endpoints());
        if let Some(endpoints) = endpoints {
            debug!(
                "{}: interrupt in {:#04x}, interrupt out {:#04x}",
                shared.identity.name, endpoints.input.address, endpoints.output.address
            );
        }
        info!(
            "{} attached at {} ({:04x}:{:04x})",
            shared.identity.name,
            shared.identity.phys,
            shared.identity.vendor_id,
            shared.identity.product_id
        );

        Ok(Self { shared })
    }

    /// Take a reference and wake the link
    pub fn open(&self) -> Result<OpenHandle, DriverError> {
        {
            let state = self.shared.lock_state();
            if !state.present {
                return Err(DriverError::DeviceGone);
            }
            self.shared.refs.fetch_add(1, Ordering::AcqRel);
        }

        if let Err(code) = self.shared.transport.power_resume() {
            warn!("{}: power resume failed ({})", self.shared.identity.name, code);
            self.shared.put();
            return Err(DriverError::PowerResumeFailed(code));
        }

        debug!(
            "Opened {} (references: {})",
            self.shared.identity.name,
            self.ref_count()
        );
        Ok(OpenHandle {
            shared: self.shared.clone(),
        })
    }

    /// Give back a handle from [`GamepadDevice::open`]
    pub fn close(&self, handle: OpenHandle) {
        drop(handle);
    }

    /// Handle removal of the device
    ///
    /// Idempotent. Stops input polling, unregisters from the sink, waits up
    /// to the drain timeout for outputs (cancelling stragglers) and drops
    /// the attach reference.
    pub fn detach(&self) {
        self.shared.detach();
    }

    /// Queue one output report (at most 64 bytes)
    pub fn enqueue(&self, payload: impl AsRef<[u8]>) -> Result<(), DriverError> {
        self.shared.enqueue(payload.as_ref()).map(|_| ())
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    pub fn ref_count(&self) -> usize {
        self.shared.refs.load(Ordering::Acquire)
    }

    pub fn is_present(&self) -> bool {
        self.shared.lock_state().present
    }

    pub fn state(&self) -> PresenceState {
        self.shared.lock_state().lifecycle
    }

    pub fn is_polling(&self) -> bool {
        self.shared.lock_state().polling
    }

    pub fn output_active(&self) -> bool {
        self.shared.lock_state().output.active
    }

    pub fn permits_available(&self) -> usize {
        self.shared.lock_state().output.permits.available()
    }

    pub fn stats(&self) -> DeviceStats {
        self.shared.stats()
    }

    /// Wait until the transport has been released
    ///
    /// Returns false on timeout.
    pub fn wait_reclaimed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock_state();

        while !state.released {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .release_done
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl Drop for GamepadDevice {
    fn drop(&mut self) {
        self.shared.detach();
    }
}

/// Reference taken by [`GamepadDevice::open`]
///
/// Dropping it releases the power reference and the device reference.
pub struct OpenHandle {
    shared: Arc<DeviceShared>,
}

impl OpenHandle {
    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    pub fn enqueue(&self, payload: impl AsRef<[u8]>) -> Result<(), DriverError> {
        self.shared.enqueue(payload.as_ref()).map(|_| ())
    }
}

impl Drop for OpenHandle {
    fn drop(&mut self) {
        self.shared.transport.power_release();
        self.shared.put();
    }
}
