//! Async channel bridge between the completion context and Tokio
//!
//! Transfer completions run on transport threads that must never block,
//! while the event consumer is usually async. [`ChannelSink`] is an
//! [`InputSink`] that batches each report into one frame and hands it over
//! with a non-blocking send; [`EventReceiver`] is the consumer end.

use crate::sink::InputSink;
use async_channel::{Receiver, Sender, TrySendError, bounded};
use protocol::{Capabilities, DecodedReport, DeviceIdentity, InputEvent};
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Messages delivered to the consumer
#[derive(Debug, Clone, PartialEq)]
pub enum SinkMessage {
    /// A device announced itself
    Registered {
        identity: DeviceIdentity,
        capabilities: Capabilities,
    },

    /// One report's worth of events, ending with `InputEvent::Sync`
    Frame(Vec<InputEvent>),

    /// The device is gone
    Unregistered,
}

/// Sink end, owned by the driver (non-blocking)
pub struct ChannelSink {
    tx: Sender<SinkMessage>,
    /// Events emitted since the last sync
    pending: Mutex<Vec<InputEvent>>,
    /// Frames dropped because the consumer fell behind
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Number of frames dropped on a full channel
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send_frame(&self, frame: Vec<InputEvent>) {
        match self.tx.try_send(SinkMessage::Frame(frame)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(
                        "Event consumer is behind, dropped frame (total dropped: {})",
                        dropped
                    );
                }
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Event consumer gone, discarding frame");
            }
        }
    }
}

impl InputSink for ChannelSink {
    fn register(
        &self,
        identity: &DeviceIdentity,
        capabilities: &Capabilities,
    ) -> crate::Result<()> {
        self.tx
            .try_send(SinkMessage::Registered {
                identity: identity.clone(),
                capabilities: *capabilities,
            })
            .map_err(|e| crate::Error::Channel(e.to_string()))?;

        debug!("Registered {} ({}) with event bridge", identity.name, identity.phys);
        Ok(())
    }

    fn emit(&self, event: InputEvent) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.push(event);

        if event == InputEvent::Sync {
            let frame = std::mem::take(&mut *pending);
            drop(pending);
            self.send_frame(frame);
        }
    }

    fn publish(&self, report: &DecodedReport) {
        self.send_frame(report.events());
    }

    fn unregister(&self) {
        if let Err(e) = self.tx.try_send(SinkMessage::Unregistered) {
            debug!("Could not deliver unregister notification: {}", e);
        }
    }
}

/// Consumer end, used from Tokio (async) or a plain thread (blocking)
#[derive(Clone)]
pub struct EventReceiver {
    rx: Receiver<SinkMessage>,
}

impl EventReceiver {
    /// Receive the next message
    pub async fn recv(&self) -> crate::Result<SinkMessage> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next message (blocking)
    pub fn recv_blocking(&self) -> crate::Result<SinkMessage> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a message without blocking
    pub fn try_recv(&self) -> Option<SinkMessage> {
        self.rx.try_recv().ok()
    }
}

/// Create the bridge between the driver and an event consumer
///
/// `capacity` is the number of frames buffered before new frames are
/// dropped. Returns (sink for the driver, receiver for the consumer).
pub fn create_event_bridge(capacity: usize) -> (ChannelSink, EventReceiver) {
    let (tx, rx) = bounded(capacity.max(1));

    (
        ChannelSink {
            tx,
            pending: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        },
        EventReceiver { rx },
    )
}
