//! libusb transport
//!
//! libusb's synchronous interrupt calls are driven from one dedicated
//! thread per endpoint direction, fed through async channels. Each call
//! runs in short timeout slices so cancellation and shutdown are noticed
//! between slices; completions are delivered from those worker threads.

use common::{CompletionHandler, SubmitError, Transfer, Transport};
use protocol::{
    DeviceIdentity, EndpointDescriptor, EndpointDirection, EndpointKind, TransferId,
    TransferStatus,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Jobs queued per direction before `submit` reports busy
const QUEUE_DEPTH: usize = 16;

// libusb error codes
const LIBUSB_ERROR_NO_DEVICE: i32 = -4;
const LIBUSB_ERROR_BUSY: i32 = -6;

type Job = (Transfer, Arc<dyn CompletionHandler>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// libusb error code for an `rusb::Error`
pub fn libusb_code(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => -99,
    }
}

/// Completion status for a failed libusb call
pub fn map_status(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::NoDevice => TransferStatus::ShuttingDown,
        rusb::Error::Interrupted => TransferStatus::EndpointGone,
        other => TransferStatus::Other(libusb_code(other)),
    }
}

fn endpoint_kind(transfer_type: rusb::TransferType) -> EndpointKind {
    match transfer_type {
        rusb::TransferType::Control => EndpointKind::Control,
        rusb::TransferType::Isochronous => EndpointKind::Isochronous,
        rusb::TransferType::Bulk => EndpointKind::Bulk,
        rusb::TransferType::Interrupt => EndpointKind::Interrupt,
    }
}

/// Endpoints of alternate setting 0 of `interface` in the active configuration
fn interface_endpoints(
    device: &Device<Context>,
    interface: u8,
) -> Result<Vec<EndpointDescriptor>, rusb::Error> {
    let config = device.active_config_descriptor()?;
    let iface = config
        .interfaces()
        .find(|i| i.number() == interface)
        .ok_or(rusb::Error::NotFound)?;
    let setting = iface.descriptors().next().ok_or(rusb::Error::NotFound)?;

    Ok(setting
        .endpoint_descriptors()
        .map(|ep| EndpointDescriptor {
            address: ep.address(),
            kind: endpoint_kind(ep.transfer_type()),
            max_packet_size: ep.max_packet_size(),
            interval: ep.interval(),
        })
        .collect())
}

/// First device on the bus matching `vendor_id:product_id`
pub fn find_gamepad(
    context: &Context,
    vendor_id: u16,
    product_id: u16,
) -> Result<Option<Device<Context>>, rusb::Error> {
    for device in context.devices()?.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if desc.vendor_id() == vendor_id && desc.product_id() == product_id {
            return Ok(Some(device));
        }
    }
    Ok(None)
}

/// Identity of `device` as presented to the event consumer
pub fn device_identity(device: &Device<Context>, name: &str) -> Result<DeviceIdentity, rusb::Error> {
    let desc = device.device_descriptor()?;
    let ports = device.port_numbers().unwrap_or_default();

    Ok(DeviceIdentity {
        name: name.to_string(),
        phys: DeviceIdentity::phys_path(device.bus_number(), &ports),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
    })
}

/// State shared with the worker threads
struct Link {
    handle: DeviceHandle<Context>,
    poll_slice: Duration,
    in_flight: Mutex<HashSet<TransferId>>,
    cancelled: Mutex<HashSet<TransferId>>,
    shutdown: AtomicBool,
}

impl Link {
    fn take_cancelled(&self, id: TransferId) -> bool {
        lock(&self.cancelled).remove(&id)
    }

    fn finish(&self, id: TransferId) {
        lock(&self.in_flight).remove(&id);
        lock(&self.cancelled).remove(&id);
    }

    /// Run one transfer to completion, cancellation or shutdown
    fn perform(&self, transfer: &mut Transfer) -> TransferStatus {
        let endpoint = transfer.endpoint();
        loop {
            if self.take_cancelled(transfer.id()) {
                return TransferStatus::ConnectionReset;
            }
            if self.shutdown.load(Ordering::Acquire) {
                return TransferStatus::ShuttingDown;
            }

            let result = match transfer.direction() {
                EndpointDirection::In => {
                    self.handle
                        .read_interrupt(endpoint, transfer.buffer_mut(), self.poll_slice)
                }
                EndpointDirection::Out => {
                    self.handle
                        .write_interrupt(endpoint, transfer.payload(), self.poll_slice)
                }
            };

            match result {
                Ok(len) => {
                    transfer.set_actual_length(len);
                    return TransferStatus::Success;
                }
                Err(rusb::Error::Timeout) => continue,
                Err(e) => {
                    trace!("Transfer {:?} on {:#04x} failed: {}", transfer.id(), endpoint, e);
                    return map_status(e);
                }
            }
        }
    }
}

fn run_worker(link: Arc<Link>, jobs: async_channel::Receiver<Job>) {
    debug!("Transfer worker started");

    while let Ok((mut transfer, handler)) = jobs.recv_blocking() {
        let status = link.perform(&mut transfer);
        link.finish(transfer.id());
        handler.complete(transfer, status);
    }

    debug!("Transfer worker stopped");
}

/// [`Transport`] over a claimed libusb interface
pub struct RusbTransport {
    link: Arc<Link>,
    interface: u8,
    endpoints: Vec<EndpointDescriptor>,
    input_jobs: async_channel::Sender<Job>,
    output_jobs: async_channel::Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    kernel_driver_detached: bool,
    power_refs: AtomicUsize,
    released: AtomicBool,
}

impl RusbTransport {
    /// Open `device`, claim `interface` and start the transfer workers
    ///
    /// An active kernel driver is detached first and reattached on release.
    pub fn open(device: &Device<Context>, interface: u8, poll_slice: Duration) -> common::Result<Self> {
        let usb = |what: &str, e: rusb::Error| common::Error::Usb(format!("{}: {}", what, e));

        let endpoints =
            interface_endpoints(device, interface).map_err(|e| usb("Failed to read descriptors", e))?;
        let handle = device.open().map_err(|e| usb("Failed to open device", e))?;

        let kernel_driver_detached = match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                handle
                    .detach_kernel_driver(interface)
                    .map_err(|e| usb("Failed to detach kernel driver", e))?;
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!("Could not check kernel driver status: {}", e);
                false
            }
        };

        if let Err(e) = handle.claim_interface(interface) {
            if kernel_driver_detached {
                let _ = handle.attach_kernel_driver(interface);
            }
            return Err(usb("Failed to claim interface", e));
        }
        debug!("Claimed interface {}", interface);

        let link = Arc::new(Link {
            handle,
            poll_slice,
            in_flight: Mutex::new(HashSet::new()),
            cancelled: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
        });

        let (input_jobs, input_rx) = async_channel::bounded(QUEUE_DEPTH);
        let (output_jobs, output_rx) = async_channel::bounded(QUEUE_DEPTH);

        let transport = Self {
            link: link.clone(),
            interface,
            endpoints,
            input_jobs,
            output_jobs,
            workers: Mutex::new(Vec::new()),
            kernel_driver_detached,
            power_refs: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        };

        for (name, jobs) in [("gamepad-in", input_rx), ("gamepad-out", output_rx)] {
            let link = link.clone();
            let worker = thread::Builder::new()
                .name(name.to_string())
                .spawn(move || run_worker(link, jobs));
            match worker {
                Ok(worker) => lock(&transport.workers).push(worker),
                // Drop releases the interface and stops any worker already running
                Err(e) => return Err(common::Error::Io(e)),
            }
        }

        Ok(transport)
    }
}

impl Transport for RusbTransport {
    fn endpoints(&self) -> Vec<EndpointDescriptor> {
        self.endpoints.clone()
    }

    fn submit(
        &self,
        transfer: Transfer,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<(), SubmitError> {
        if self.link.shutdown.load(Ordering::Acquire) {
            return Err(SubmitError {
                transfer,
                code: LIBUSB_ERROR_NO_DEVICE,
            });
        }

        let id = transfer.id();
        let jobs = match transfer.direction() {
            EndpointDirection::In => &self.input_jobs,
            EndpointDirection::Out => &self.output_jobs,
        };

        lock(&self.link.in_flight).insert(id);
        match jobs.try_send((transfer, handler)) {
            Ok(()) => Ok(()),
            Err(e) => {
                lock(&self.link.in_flight).remove(&id);
                let code = if e.is_full() {
                    LIBUSB_ERROR_BUSY
                } else {
                    LIBUSB_ERROR_NO_DEVICE
                };
                let (transfer, _) = e.into_inner();
                Err(SubmitError { transfer, code })
            }
        }
    }

    fn cancel(&self, id: TransferId) {
        if lock(&self.link.in_flight).contains(&id) {
            lock(&self.link.cancelled).insert(id);
        }
    }

    // libusb gives no control over autosuspend; references are only counted
    fn power_resume(&self) -> Result<(), i32> {
        let refs = self.power_refs.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("Power references: {}", refs);
        Ok(())
    }

    fn power_release(&self) {
        let _ = self
            .power_refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        self.link.shutdown.store(true, Ordering::Release);
        self.input_jobs.close();
        self.output_jobs.close();

        let current = thread::current().id();
        for worker in lock(&self.workers).drain(..) {
            // Released from a completion on this worker
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("Transfer worker panicked");
            }
        }

        if let Err(e) = self.link.handle.release_interface(self.interface) {
            warn!("Failed to release interface {}: {}", self.interface, e);
        }
        if self.kernel_driver_detached {
            match self.link.handle.attach_kernel_driver(self.interface) {
                Ok(()) => debug!("Reattached kernel driver to interface {}", self.interface),
                Err(e) => debug!("Could not reattach kernel driver: {}", e),
            }
        }

        info!("Released interface {}", self.interface);
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        self.release();
    }
}
