//! usb-gamepad
//!
//! Userspace driver for USB gamepads speaking the XInput-style 64-byte
//! report. Binds the configured pad through libusb, prints decoded input
//! and follows the pad across unplug and replug.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{EventReceiver, InputSink, SinkMessage, create_event_bridge, setup_logging};
use driver::config::DriverConfig;
use driver::usb::rusb_transport::{device_identity, find_gamepad};
use driver::usb::{GamepadDevice, HotplugEvent, HotplugWatcher, RusbTransport};
use protocol::{InputEvent, OutputReport};
use rusb::{Context as LibusbContext, UsbContext};
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-gamepad")]
#[command(author, version, about = "Userspace USB gamepad driver")]
#[command(long_about = "
Binds a USB gamepad through libusb, decodes its input reports and prints
them as key and axis events. Output reports (rumble, LEDs) can be sent with
--write.

EXAMPLES:
    # Run with default config (Logitech F310 in XInput mode)
    usb-gamepad

    # Print events as JSON lines
    usb-gamepad --json

    # Send a rumble report after attaching
    usb-gamepad --write 000800ff00000000

    # List matching pads and exit
    usb-gamepad --list-devices

CONFIGURATION:
    The driver looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-gamepad/driver.toml
    3. /etc/usb-gamepad/driver.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List matching USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Output report to send after attaching, as hex (repeatable)
    #[arg(short, long, value_name = "HEX")]
    write: Vec<String>,
}

/// Why the attach loop stopped waiting
enum Wake {
    Shutdown,
    /// The pad arrived or left
    Plugged,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DriverConfig::default();
        let path = DriverConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        DriverConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        DriverConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.driver.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-gamepad v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    // Reject malformed --write arguments before touching the bus
    let writes = args
        .write
        .iter()
        .map(|hex| OutputReport::from_hex(hex).with_context(|| format!("Bad --write value {:?}", hex)))
        .collect::<Result<Vec<_>>>()?;

    let vendor_id = config.vendor_id()?;
    let product_id = config.product_id()?;
    let context = LibusbContext::new().context("Failed to initialise libusb")?;

    if args.list_devices {
        return list_devices(&context, vendor_id, product_id);
    }

    let (hotplug_tx, hotplug_rx) = async_channel::bounded(16);
    let _watcher = HotplugWatcher::spawn(context.clone(), vendor_id, product_id, hotplug_tx)
        .context("Failed to start hot-plug watcher")?;

    let (sink, events) = create_event_bridge(config.transfers.event_queue);
    let sink: Arc<dyn InputSink> = Arc::new(sink);
    let printer = tokio::spawn(print_events(events, args.json));

    let result = run(&config, &context, vendor_id, product_id, sink, &hotplug_rx, &writes).await;

    printer.abort();
    info!("Shutdown complete");
    result
}

/// Attach, wait for removal or Ctrl+C, repeat
async fn run(
    config: &DriverConfig,
    context: &LibusbContext,
    vendor_id: u16,
    product_id: u16,
    sink: Arc<dyn InputSink>,
    hotplug: &async_channel::Receiver<HotplugEvent>,
    writes: &[OutputReport],
) -> Result<()> {
    loop {
        let Some(device) = find_gamepad(context, vendor_id, product_id)? else {
            info!("Waiting for {:04x}:{:04x}", vendor_id, product_id);
            match wait_for_arrival(hotplug).await {
                Wake::Shutdown => return Ok(()),
                Wake::Plugged => continue,
            }
        };

        let (bus, address) = (device.bus_number(), device.address());
        let identity = device_identity(&device, &config.device.name)?;
        let transport =
            match RusbTransport::open(&device, config.device.interface, config.poll_slice()) {
                Ok(transport) => transport,
                Err(e) => {
                    warn!("Failed to open gamepad: {}", e);
                    match wait_for_arrival(hotplug).await {
                        Wake::Shutdown => return Ok(()),
                        Wake::Plugged => continue,
                    }
                }
            };

        let options = config.device_options();
        let attach_sink = sink.clone();
        let gamepad = tokio::task::spawn_blocking(move || {
            GamepadDevice::attach(Arc::new(transport), identity, attach_sink, options)
        })
        .await?
        .context("Failed to attach gamepad")?;
        let gamepad = Arc::new(gamepad);

        for report in writes {
            let gamepad = gamepad.clone();
            let report = report.clone();
            let len = report.len();
            let sent = tokio::task::spawn_blocking(move || gamepad.enqueue(&report)).await?;
            match sent {
                Ok(()) => debug!("Queued {} byte output report", len),
                Err(e) => warn!("Output report not sent: {}", e),
            }
        }

        let wake = wait_for_removal(hotplug, bus, address).await;

        let stats = gamepad.stats();
        tokio::task::spawn_blocking(move || gamepad.detach()).await?;
        info!(
            "Session ended: {} reports, {} outputs sent",
            stats.reports, stats.outputs_sent
        );

        if let Wake::Shutdown = wake {
            return Ok(());
        }
    }
}

async fn wait_for_arrival(hotplug: &async_channel::Receiver<HotplugEvent>) -> Wake {
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => return Wake::Shutdown,
            event = hotplug.recv() => match event {
                Ok(HotplugEvent::Arrived { .. }) => return Wake::Plugged,
                Ok(_) => {}
                // No hot-plug support: only Ctrl+C can end the wait
                Err(_) => {
                    let _ = signal::ctrl_c().await;
                    return Wake::Shutdown;
                }
            },
        }
    }
}

async fn wait_for_removal(
    hotplug: &async_channel::Receiver<HotplugEvent>,
    bus: u8,
    address: u8,
) -> Wake {
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, detaching...");
                return Wake::Shutdown;
            }
            event = hotplug.recv() => match event {
                Ok(event) if event.is_removal_of(bus, address) => {
                    info!("Gamepad unplugged");
                    return Wake::Plugged;
                }
                Ok(_) => {}
                Err(_) => {
                    let _ = signal::ctrl_c().await;
                    return Wake::Shutdown;
                }
            },
        }
    }
}

async fn print_events(events: EventReceiver, json: bool) {
    let mut last_frame = String::new();

    while let Ok(message) = events.recv().await {
        if json {
            match serde_json::to_string(&message_json(&message)) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Failed to encode event: {}", e),
            }
            continue;
        }

        match message {
            SinkMessage::Registered {
                identity,
                capabilities,
            } => println!(
                "{} ({}) {:04x}:{:04x}: {} buttons, {} axes",
                identity.name,
                identity.phys,
                identity.vendor_id,
                identity.product_id,
                capabilities.buttons.len(),
                capabilities.axes.len()
            ),
            SinkMessage::Frame(frame) => {
                let line = describe_frame(&frame);
                if line != last_frame {
                    println!("{}", line);
                    last_frame = line;
                }
            }
            SinkMessage::Unregistered => println!("-- removed --"),
        }
    }
}

/// Held buttons and axis values of one frame
fn describe_frame(frame: &[InputEvent]) -> String {
    let mut parts = Vec::new();
    for event in frame {
        match event {
            InputEvent::Key {
                button,
                pressed: true,
            } => parts.push(format!("{:?}", button)),
            InputEvent::Abs { axis, value } => parts.push(format!("{:?}={}", axis, value)),
            _ => {}
        }
    }
    parts.join(" ")
}

fn message_json(message: &SinkMessage) -> serde_json::Value {
    match message {
        SinkMessage::Registered {
            identity,
            capabilities,
        } => serde_json::json!({
            "registered": identity,
            "capabilities": capabilities,
        }),
        SinkMessage::Frame(frame) => serde_json::json!({ "frame": frame }),
        SinkMessage::Unregistered => serde_json::json!({ "unregistered": true }),
    }
}

fn list_devices(context: &LibusbContext, vendor_id: u16, product_id: u16) -> Result<()> {
    let devices = context.devices().context("Failed to enumerate USB devices")?;
    let mut found = 0;

    for device in devices.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if desc.vendor_id() != vendor_id || desc.product_id() != product_id {
            continue;
        }

        found += 1;
        let phys = device_identity(&device, "")
            .map(|identity| identity.phys)
            .unwrap_or_else(|_| "unknown".to_string());
        println!(
            "  {:04x}:{:04x}  Bus {:03} Device {:03}  {}",
            desc.vendor_id(),
            desc.product_id(),
            device.bus_number(),
            device.address(),
            phys
        );
    }

    if found == 0 {
        return Err(anyhow!(
            "No device {:04x}:{:04x} found",
            vendor_id,
            product_id
        ));
    }
    Ok(())
}
