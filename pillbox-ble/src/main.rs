//! BLE companion tool for Pillbox devices
//!
//! Finds a pillbox, writes one command to its control characteristic and
//! prints the notified replies.

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use pillbox_proto::ble::{CHARACTERISTIC_UUID_U128, DEFAULT_LOCAL_NAME, SERVICE_UUID_U128};
use pillbox_proto::Command;
use std::time::Duration;
use uuid::Uuid;

const SERVICE_UUID: Uuid = Uuid::from_u128(SERVICE_UUID_U128);
const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(CHARACTERISTIC_UUID_U128);

#[derive(Parser)]
#[command(name = "pillbox-ble")]
#[command(about = "BLE companion tool for Pillbox devices")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Device name or address to connect to
    #[arg(short, long)]
    device: Option<String>,
    /// Stop waiting for replies after this many quiet milliseconds
    #[arg(short, long, default_value = "1500")]
    quiet: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for Pillbox devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Write raw text to the control characteristic
    Send {
        #[command(flatten)]
        target: Target,
        /// Text to write, e.g. "READ|3"
        raw: String,
    },
    /// Save a dose slot
    Save {
        #[command(flatten)]
        target: Target,
        id: i32,
        time: String,
        date: String,
        /// Defaults to "scheduled" on the device
        status: Option<String>,
    },
    /// Change the status of a saved slot
    Status {
        #[command(flatten)]
        target: Target,
        id: i32,
        status: String,
    },
    /// Read one slot
    Read {
        #[command(flatten)]
        target: Target,
        id: i32,
    },
    /// Read every slot
    Dump {
        #[command(flatten)]
        target: Target,
    },
    /// Wipe every slot
    Clear {
        #[command(flatten)]
        target: Target,
    },
    /// Ask the device to push a notification through its relay
    Notify {
        #[command(flatten)]
        target: Target,
        title: String,
        body: String,
    },
    /// Check the device answers
    Ping {
        #[command(flatten)]
        target: Target,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    let adapter = adapters.into_iter().next().ok_or("No Bluetooth adapter found")?;

    let (target, wire) = match cli.command {
        Commands::Scan { duration } => return scan_devices(&adapter, duration).await,
        Commands::Send { target, raw } => (target, raw),
        Commands::Save {
            target,
            id,
            time,
            date,
            status,
        } => (
            target,
            Command::Save {
                id,
                time,
                date,
                status,
            }
            .to_wire(),
        ),
        Commands::Status { target, id, status } => {
            (target, Command::Status { id, status }.to_wire())
        }
        Commands::Read { target, id } => (target, Command::Read { id }.to_wire()),
        Commands::Dump { target } => (target, Command::Dump.to_wire()),
        Commands::Clear { target } => (target, Command::Clear.to_wire()),
        Commands::Notify {
            target,
            title,
            body,
        } => (target, Command::Notify { title, body }.to_wire()),
        Commands::Ping { target } => (target, Command::Ping.to_wire()),
    };

    send_command(&adapter, target, &wire).await
}

fn is_pillbox(name: &str, services: &[Uuid]) -> bool {
    name.starts_with(DEFAULT_LOCAL_NAME) || services.contains(&SERVICE_UUID)
}

async fn scan_devices(adapter: &Adapter, duration: u64) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for Pillbox devices ({} seconds)...", duration);

    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(Duration::from_secs(duration)).await;

    let peripherals = adapter.peripherals().await?;

    println!("\nFound {} devices:", peripherals.len());
    for peripheral in peripherals {
        let props = peripheral.properties().await?;
        if let Some(props) = props {
            let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
            let addr = peripheral.address();
            let rssi = props.rssi.map(|r| format!("{} dBm", r)).unwrap_or_else(|| "N/A".to_string());
            let marker = if is_pillbox(&name, &props.services) { " [PILLBOX]" } else { "" };

            println!("  {} ({}) RSSI: {}{}", name, addr, rssi, marker);
        }
    }

    adapter.stop_scan().await?;
    Ok(())
}

async fn find_pillbox_device(
    adapter: &Adapter,
    target: Option<String>,
) -> Result<Peripheral, Box<dyn std::error::Error>> {
    println!("Scanning for Pillbox devices...");

    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let peripherals = adapter.peripherals().await?;

    for peripheral in peripherals {
        let props = peripheral.properties().await?;
        if let Some(props) = props {
            let name = props.local_name.unwrap_or_default();
            let addr = peripheral.address().to_string();

            // Match by target (name or address) or find any pillbox
            let matches = match &target {
                Some(t) => name.contains(t) || addr.contains(t),
                None => is_pillbox(&name, &props.services),
            };

            if matches {
                adapter.stop_scan().await?;
                println!("Found device: {} ({})", name, addr);
                return Ok(peripheral);
            }
        }
    }

    adapter.stop_scan().await?;
    Err("No Pillbox device found".into())
}

async fn send_command(
    adapter: &Adapter,
    target: Target,
    wire: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let device = find_pillbox_device(adapter, target.device).await?;

    println!("Connecting...");
    device.connect().await?;
    device.discover_services().await?;

    let characteristics = device.characteristics();
    let control = characteristics
        .iter()
        .find(|c| c.uuid == CHARACTERISTIC_UUID)
        .ok_or("Control characteristic not found")?;

    device.subscribe(control).await?;
    let mut notifications = device.notifications().await?;

    println!("-> {}", wire);
    device.write(control, wire.as_bytes(), WriteType::WithResponse).await?;

    // Replies arrive as notifications; stop once the device goes quiet
    let quiet = Duration::from_millis(target.quiet);
    let mut replies = 0;
    while let Ok(Some(notification)) = tokio::time::timeout(quiet, notifications.next()).await {
        if notification.uuid != CHARACTERISTIC_UUID {
            continue;
        }
        replies += 1;
        println!("<- {}", String::from_utf8_lossy(&notification.value));
    }
    if replies == 0 {
        println!("No reply");
    }

    let _ = device.unsubscribe(control).await;
    device.disconnect().await?;
    Ok(())
}
