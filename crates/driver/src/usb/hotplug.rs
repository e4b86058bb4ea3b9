//! Hot-plug notifications
//!
//! libusb delivers hot-plug callbacks from `handle_events`, so a dedicated
//! thread pumps events for the context and forwards arrivals and removals
//! of the configured vendor/product pair over an async channel.

use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// How often the event thread checks for shutdown
const EVENT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    Arrived { bus: u8, address: u8 },
    Left { bus: u8, address: u8 },
}

impl HotplugEvent {
    /// Whether this is the removal of the device at `bus`/`address`
    pub fn is_removal_of(&self, bus: u8, address: u8) -> bool {
        *self == HotplugEvent::Left { bus, address }
    }
}

struct Callback {
    events: async_channel::Sender<HotplugEvent>,
}

impl Callback {
    fn forward(&self, event: HotplugEvent) {
        debug!("Hot-plug: {:?}", event);
        if let Err(e) = self.events.try_send(event) {
            warn!("Dropped hot-plug notification: {}", e);
        }
    }
}

impl<T: UsbContext> Hotplug<T> for Callback {
    fn device_arrived(&mut self, device: Device<T>) {
        self.forward(HotplugEvent::Arrived {
            bus: device.bus_number(),
            address: device.address(),
        });
    }

    fn device_left(&mut self, device: Device<T>) {
        self.forward(HotplugEvent::Left {
            bus: device.bus_number(),
            address: device.address(),
        });
    }
}

/// Background thread delivering [`HotplugEvent`]s
pub struct HotplugWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugWatcher {
    /// Start watching for `vendor_id:product_id`
    ///
    /// Returns `None` when the platform's libusb lacks hot-plug support.
    pub fn spawn(
        context: Context,
        vendor_id: u16,
        product_id: u16,
        events: async_channel::Sender<HotplugEvent>,
    ) -> common::Result<Option<Self>> {
        if !rusb::has_hotplug() {
            warn!("libusb has no hot-plug support, removal will not be detected");
            return Ok(None);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new().name("usb-hotplug".to_string()).spawn({
            let stop = stop.clone();
            move || run_events(context, vendor_id, product_id, events, stop)
        })?;

        Ok(Some(Self {
            stop,
            thread: Some(thread),
        }))
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Hot-plug thread panicked");
            }
        }
    }
}

impl Drop for HotplugWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_events(
    context: Context,
    vendor_id: u16,
    product_id: u16,
    events: async_channel::Sender<HotplugEvent>,
    stop: Arc<AtomicBool>,
) {
    let registration: rusb::Result<Registration<Context>> = HotplugBuilder::new()
        .vendor_id(vendor_id)
        .product_id(product_id)
        .enumerate(false)
        .register(&context, Box::new(Callback { events }));
    let registration = match registration {
        Ok(registration) => registration,
        Err(e) => {
            error!("Failed to register hot-plug callback: {}", e);
            return;
        }
    };
    debug!(
        "Watching for {:04x}:{:04x} hot-plug events",
        vendor_id, product_id
    );

    while !stop.load(Ordering::Acquire) {
        match context.handle_events(Some(EVENT_SLICE)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => debug!("USB event handling interrupted"),
            Err(e) => warn!("Error handling USB events: {}", e),
        }
    }

    drop(registration);
    debug!("Hot-plug thread stopped");
}
