//! Test utilities for usb-gamepad
//!
//! Provides mock implementations and helper functions for testing across crates.
//!
//! [`MockTransport`] holds every submitted transfer until the test completes
//! it explicitly, which makes completion ordering and races scriptable.
//! [`RecordingSink`] records everything the driver publishes.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockTransport, gamepad_report};
//!
//! let transport = MockTransport::new();
//! assert_eq!(transport.endpoints_len(), 2);
//!
//! let report = gamepad_report(0x01, 0x10);
//! assert_eq!(report[2], 0x01);
//! ```

use crate::sink::InputSink;
use crate::transport::{CompletionHandler, SubmitError, Transfer, Transport};
use protocol::{
    Capabilities, DeviceIdentity, EndpointDescriptor, EndpointDirection, EndpointKind, InputEvent,
    REPORT_LEN, TransferId, TransferStatus,
};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Interrupt IN endpoint of the reference pad
pub const GAMEPAD_EP_IN: u8 = 0x81;

/// Interrupt OUT endpoint of the reference pad
pub const GAMEPAD_EP_OUT: u8 = 0x02;

/// Endpoint pair of the reference pad (F310, XInput mode)
pub fn gamepad_endpoints() -> Vec<EndpointDescriptor> {
    vec![
        EndpointDescriptor {
            address: GAMEPAD_EP_IN,
            kind: EndpointKind::Interrupt,
            max_packet_size: 32,
            interval: 4,
        },
        EndpointDescriptor {
            address: GAMEPAD_EP_OUT,
            kind: EndpointKind::Interrupt,
            max_packet_size: 32,
            interval: 8,
        },
    ]
}

/// Identity of the reference pad
pub fn gamepad_identity() -> DeviceIdentity {
    DeviceIdentity {
        name: "Gamepad F310".to_string(),
        phys: DeviceIdentity::phys_path(1, &[4]),
        vendor_id: 0x046d,
        product_id: 0xc21d,
    }
}

/// Build a 64-byte input report with the given button bytes (offsets 2 and 3)
pub fn gamepad_report(buttons_low: u8, buttons_high: u8) -> [u8; REPORT_LEN] {
    let mut raw = [0u8; REPORT_LEN];
    raw[0] = 0x00;
    raw[1] = 0x14;
    raw[2] = buttons_low;
    raw[3] = buttons_high;
    raw
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Pending = (Transfer, Arc<dyn CompletionHandler>);

#[derive(Default)]
struct MockState {
    /// Submitted, not yet completed, in submission order
    pending: VecDeque<Pending>,
    fail_next_submit: Option<i32>,
    fail_power_resume: Option<i32>,
    ignore_cancel: bool,
    cancelled: Vec<TransferId>,
    submitted: usize,
}

/// Transport double driven by the test
///
/// Nothing completes on its own: the test calls [`MockTransport::complete_input`]
/// or [`MockTransport::complete_output`] from whatever thread it likes, and
/// [`Transport::cancel`] completes the transfer on the cancelling thread with
/// `ConnectionReset`, as a synchronous kill would.
pub struct MockTransport {
    endpoints: Vec<EndpointDescriptor>,
    state: Mutex<MockState>,
    changed: Condvar,
    power_resumes: AtomicUsize,
    power_releases: AtomicUsize,
    releases: AtomicUsize,
}

impl MockTransport {
    /// Mock with the reference pad's endpoints
    pub fn new() -> Self {
        Self::with_endpoints(gamepad_endpoints())
    }

    pub fn with_endpoints(endpoints: Vec<EndpointDescriptor>) -> Self {
        Self {
            endpoints,
            state: Mutex::new(MockState::default()),
            changed: Condvar::new(),
            power_resumes: AtomicUsize::new(0),
            power_releases: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    pub fn endpoints_len(&self) -> usize {
        self.endpoints.len()
    }

    /// Refuse the next submission with `code`
    pub fn fail_next_submit(&self, code: i32) {
        lock(&self.state).fail_next_submit = Some(code);
    }

    /// Refuse every power resume with `code`
    pub fn fail_power_resume(&self, code: i32) {
        lock(&self.state).fail_power_resume = Some(code);
    }

    /// Make `cancel` a no-op, simulating a transfer the bus never gives back
    pub fn ignore_cancel(&self, ignore: bool) {
        lock(&self.state).ignore_cancel = ignore;
    }

    /// Submitted transfers still pending in `direction`
    pub fn pending(&self, direction: EndpointDirection) -> usize {
        lock(&self.state)
            .pending
            .iter()
            .filter(|(t, _)| t.direction() == direction)
            .count()
    }

    /// Total accepted submissions
    pub fn submitted(&self) -> usize {
        lock(&self.state).submitted
    }

    /// Ids passed to `cancel` that matched a pending transfer
    pub fn cancelled(&self) -> Vec<TransferId> {
        lock(&self.state).cancelled.clone()
    }

    pub fn power_resumes(&self) -> usize {
        self.power_resumes.load(Ordering::SeqCst)
    }

    pub fn power_releases(&self) -> usize {
        self.power_releases.load(Ordering::SeqCst)
    }

    /// Number of `release` calls (the driver's reclamation)
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` transfers are pending in `direction`
    pub fn wait_pending(
        &self,
        direction: EndpointDirection,
        count: usize,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            let pending = state
                .pending
                .iter()
                .filter(|(t, _)| t.direction() == direction)
                .count();
            if pending >= count {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn take_oldest(&self, direction: EndpointDirection) -> Option<Pending> {
        let mut state = lock(&self.state);
        let index = state
            .pending
            .iter()
            .position(|(t, _)| t.direction() == direction)?;
        state.pending.remove(index)
    }

    /// Complete the pending input transfer with `data` and `status`
    ///
    /// Returns false if no input transfer was pending.
    pub fn complete_input(&self, data: &[u8], status: TransferStatus) -> bool {
        let Some((mut transfer, handler)) = self.take_oldest(EndpointDirection::In) else {
            return false;
        };

        let len = data.len().min(REPORT_LEN);
        transfer.buffer_mut()[..len].copy_from_slice(&data[..len]);
        transfer.set_actual_length(if status.is_success() { len } else { 0 });
        handler.complete(transfer, status);
        true
    }

    /// Complete the oldest pending output transfer with `status`
    pub fn complete_output(&self, status: TransferStatus) -> bool {
        let Some((mut transfer, handler)) = self.take_oldest(EndpointDirection::Out) else {
            return false;
        };

        let sent = if status.is_success() { transfer.length() } else { 0 };
        transfer.set_actual_length(sent);
        handler.complete(transfer, status);
        true
    }

    /// Payloads of pending output transfers, oldest first
    pub fn pending_payloads(&self) -> Vec<Vec<u8>> {
        lock(&self.state)
            .pending
            .iter()
            .filter(|(t, _)| t.direction() == EndpointDirection::Out)
            .map(|(t, _)| t.payload().to_vec())
            .collect()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn endpoints(&self) -> Vec<EndpointDescriptor> {
        self.endpoints.clone()
    }

    fn submit(
        &self,
        transfer: Transfer,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<(), SubmitError> {
        let mut state = lock(&self.state);
        if let Some(code) = state.fail_next_submit.take() {
            return Err(SubmitError { transfer, code });
        }

        state.submitted += 1;
        state.pending.push_back((transfer, handler));
        self.changed.notify_all();
        Ok(())
    }

    fn cancel(&self, id: TransferId) {
        let found = {
            let mut state = lock(&self.state);
            if state.ignore_cancel {
                return;
            }
            let index = state.pending.iter().position(|(t, _)| t.id() == id);
            let found = index.and_then(|i| state.pending.remove(i));
            if found.is_some() {
                state.cancelled.push(id);
            }
            found
        };

        if let Some((transfer, handler)) = found {
            handler.complete(transfer, TransferStatus::ConnectionReset);
        }
    }

    fn power_resume(&self) -> Result<(), i32> {
        if let Some(code) = lock(&self.state).fail_power_resume {
            return Err(code);
        }
        self.power_resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn power_release(&self) {
        self.power_releases.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Recorded {
    registrations: Vec<(DeviceIdentity, Capabilities)>,
    events: Vec<InputEvent>,
    unregistrations: usize,
    /// Events emitted while no device was registered
    late_events: usize,
}

/// Sink that records everything it is given
#[derive(Default)]
pub struct RecordingSink {
    recorded: Mutex<Recorded>,
    fail_register: Mutex<Option<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `register` fail with `reason`
    pub fn failing(reason: &str) -> Self {
        let sink = Self::default();
        *lock(&sink.fail_register) = Some(reason.to_string());
        sink
    }

    pub fn registrations(&self) -> usize {
        lock(&self.recorded).registrations.len()
    }

    pub fn unregistrations(&self) -> usize {
        lock(&self.recorded).unregistrations
    }

    pub fn events(&self) -> Vec<InputEvent> {
        lock(&self.recorded).events.clone()
    }

    /// Events that arrived while no device was registered (should stay 0)
    pub fn late_events(&self) -> usize {
        lock(&self.recorded).late_events
    }

    /// Recorded events split into sync-terminated frames
    pub fn frames(&self) -> Vec<Vec<InputEvent>> {
        let events = self.events();
        events
            .split_inclusive(|e| *e == InputEvent::Sync)
            .filter(|frame| frame.last() == Some(&InputEvent::Sync))
            .map(|frame| frame.to_vec())
            .collect()
    }
}

impl InputSink for RecordingSink {
    fn register(
        &self,
        identity: &DeviceIdentity,
        capabilities: &Capabilities,
    ) -> crate::Result<()> {
        if let Some(reason) = lock(&self.fail_register).clone() {
            return Err(crate::Error::Sink(reason));
        }
        lock(&self.recorded)
            .registrations
            .push((identity.clone(), *capabilities));
        Ok(())
    }

    fn emit(&self, event: InputEvent) {
        let mut recorded = lock(&self.recorded);
        // Every registered device has already unregistered
        if recorded.unregistrations >= recorded.registrations.len() {
            recorded.late_events += 1;
        }
        recorded.events.push(event);
    }

    fn unregister(&self) {
        lock(&self.recorded).unregistrations += 1;
    }
}
