//! ptylink bridge daemon
//!
//! Exposes a USB-attached 3D-printer controller board to a local
//! print-management process as a standard serial device file, by bridging a
//! pseudo-terminal endpoint to the physical USB connection.

mod config;
mod host;
mod manager;
mod permission;
mod pty;
mod pump;

use anyhow::{Context, Result};
use clap::Parser;
use common::{create_bridge, setup_logging};
use config::BridgeConfig;
use host::{SerialHost, SystemSerialHost};
use manager::ConnectionManager;
use permission::{AutoApproveBroker, PermissionGate};
use pty::PtyBridge;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ptylink-bridge")]
#[command(
    author,
    version,
    about = "Bridge a USB serial printer board to a pseudo-terminal"
)]
#[command(long_about = "
Bridges a USB-attached 3D-printer controller board to a pseudo-terminal so
a local print-management process can open it like any serial port. Handles
device discovery, access permission, in-band baud-rate changes, and
hot-plug, reconnecting as needed.

EXAMPLES:
    # Run with default config
    ptylink-bridge

    # Run with custom config
    ptylink-bridge --config /path/to/bridge.toml

    # List candidate USB serial adapters and exit
    ptylink-bridge --list-devices

    # Run with debug logging
    ptylink-bridge --log-level debug

CONFIGURATION:
    The bridge looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/ptylink/bridge.toml
    3. /etc/ptylink/bridge.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List candidate USB serial devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        BridgeConfig::load(path).context("Failed to load configuration")?
    } else {
        BridgeConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.bridge.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("ptylink-bridge v{}", env!("CARGO_PKG_VERSION"));

    let serial_host = Arc::new(SystemSerialHost::new(config.usb.filters.clone()));

    if args.list_devices {
        return list_devices_mode(serial_host.as_ref());
    }

    // Wire the three execution contexts together: pty reader thread ->
    // manager task <- permission broker, with the pump channel created
    // inside the manager
    let (frame_tx, frame_rx) = create_bridge();
    let (decision_tx, decision_rx) = create_bridge();

    let gate = PermissionGate::new(Box::new(AutoApproveBroker::new(decision_tx)));

    let mut pty = PtyBridge::open(config.bridge.link_path.clone())
        .context("Failed to allocate pseudo-terminal")?;
    pty.spawn_reader(frame_tx);

    println!("Virtual serial port: {}", pty.public_path().display());
    info!(path = %pty.public_path().display(), "virtual serial port ready");

    let manager = ConnectionManager::new(
        serial_host,
        gate,
        Box::new(pty.writer()),
        frame_rx,
        decision_rx,
        config.serial.tuning(),
    );

    let shutdown = CancellationToken::new();
    let manager_task = tokio::spawn(manager.run(shutdown.clone()));

    signal::ctrl_c().await.context("Failed to wait for ctrl-c")?;
    info!("Shutting down...");

    shutdown.cancel();
    let _ = manager_task.await;
    pty.shutdown();

    info!("Shutdown complete");
    Ok(())
}

fn list_devices_mode(host: &dyn SerialHost) -> Result<()> {
    let devices = host.list_candidates();
    if devices.is_empty() {
        println!("No candidate USB serial devices found.");
        return Ok(());
    }

    println!("Candidate USB serial devices:");
    for device in devices {
        println!("  {}", device.description());
        if let Some(serial) = &device.serial_number {
            println!("    serial number: {}", serial);
        }
        if device.port_count > 1 {
            println!("    serial channels: {}", device.port_count);
        }
    }
    Ok(())
}
