//! usbip-share
//!
//! Shares locally attached USB devices over the USB/IP protocol. The
//! subcommands map one-to-one onto registry and enumerator operations;
//! `server` runs the listener itself.

use anyhow::{Context, Result, anyhow};
use clap::{ArgGroup, Parser, Subcommand};
use common::setup_logging;
use protocol::BusId;
use server::config::ServerConfig;
use server::enumerator::{DeviceEnumerator, UsbEnumerator, find_connected};
use server::registry::{BindingRegistry, RegistryError};
use server::service::run_server;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_CANCELLED: u8 = 3;
// clap exits with code 2 on parse errors by itself.

#[derive(Parser, Debug)]
#[command(name = "usbip-share")]
#[command(
    author,
    version,
    about = "Share local USB devices over the USB/IP protocol"
)]
#[command(long_about = "
Shares locally attached USB devices with remote USB/IP clients (such as the
Linux vhci-hcd driver) over TCP port 3240.

EXAMPLES:
    # Share the device at bus 3, port 4
    usbip-share bind --bus-id 3-4

    # See what is connected and what is shared
    usbip-share list

    # Run the server
    usbip-share server

    # Stop sharing everything
    usbip-share unbind --all

CONFIGURATION:
    The server looks for configuration in the following order:
    1. Path specified with --config
    2. ~/.config/usbip-share/server.toml
    3. /etc/usbip-share/server.toml
    4. Built-in defaults
")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Share a connected device with remote clients
    Bind {
        /// Bus id of the device, e.g. 3-4
        #[arg(long, value_name = "BUSID")]
        bus_id: BusId,
    },

    /// Stop sharing devices
    #[command(group(ArgGroup::new("target").required(true).args(["all", "bus_id", "guid"])))]
    Unbind {
        /// Unbind every shared device
        #[arg(long)]
        all: bool,

        /// Bus id of the device, e.g. 3-4
        #[arg(long, value_name = "BUSID")]
        bus_id: Option<BusId>,

        /// Persistent guid of the device (works while unplugged)
        #[arg(long, value_name = "GUID")]
        guid: Option<Uuid>,
    },

    /// List connected and persisted devices
    List,

    /// Run the server
    Server,

    /// Print license information
    License,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = if let Some(path) = &cli.config {
        match ServerConfig::load(Some(path.clone())) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {e:#}");
                return ExitCode::from(EXIT_FAILURE);
            }
        }
    } else {
        ServerConfig::load_or_default()
    };

    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);
    if let Err(e) = setup_logging(log_level) {
        eprintln!("error: {e}");
        return ExitCode::from(EXIT_FAILURE);
    }

    // Ctrl+C during a CLI operation is a distinct outcome.
    let result = tokio::select! {
        res = dispatch(cli.command, config) => res,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("cancelled");
            return ExitCode::from(EXIT_CANCELLED);
        }
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn dispatch(command: Command, config: ServerConfig) -> Result<()> {
    match command {
        Command::Bind { bus_id } => cmd_bind(&config, bus_id),
        Command::Unbind { all, bus_id, guid } => cmd_unbind(&config, all, bus_id, guid),
        Command::List => cmd_list(&config),
        Command::Server => {
            info!("usbip-share v{}", env!("CARGO_PKG_VERSION"));
            run_server(config).await
        }
        Command::License => {
            print!("{}", include_str!("../LICENSE.txt"));
            Ok(())
        }
    }
}

fn open_registry(config: &ServerConfig) -> Result<BindingRegistry> {
    BindingRegistry::open(config.registry_path()).map_err(|e| anyhow!(e))
}

fn cmd_bind(config: &ServerConfig, bus_id: BusId) -> Result<()> {
    let registry = open_registry(config)?;
    let enumerator = UsbEnumerator::new().context("initializing USB enumeration")?;

    let Some(device) = find_connected(&enumerator, bus_id, true) else {
        return Err(anyhow!(RegistryError::NotPresent(bus_id)));
    };

    let description = device
        .description
        .unwrap_or_else(|| format!("USB device {bus_id}"));
    let instance_id = format!(
        "usb:{:04x}:{:04x}:{}",
        device.export.vendor_id, device.export.product_id, bus_id
    );

    match registry.bind(bus_id, description.clone(), instance_id) {
        Ok(shared) => {
            println!("shared {bus_id} ({description}) as {}", shared.guid);
            Ok(())
        }
        Err(RegistryError::AlreadyShared(_)) => {
            println!("{bus_id} is already shared");
            Ok(())
        }
        Err(e) => Err(anyhow!(e)),
    }
}

fn cmd_unbind(
    config: &ServerConfig,
    all: bool,
    bus_id: Option<BusId>,
    guid: Option<Uuid>,
) -> Result<()> {
    let registry = open_registry(config)?;

    if all {
        let count = registry.unbind_all()?;
        println!("unshared {count} device(s)");
        return Ok(());
    }
    if let Some(bus_id) = bus_id {
        registry.unbind_bus_id(bus_id)?;
        println!("unshared {bus_id}");
        return Ok(());
    }
    if let Some(guid) = guid {
        registry.unbind_guid(guid)?;
        println!("unshared {guid}");
        return Ok(());
    }
    unreachable!("clap enforces the target group")
}

fn cmd_list(config: &ServerConfig) -> Result<()> {
    let registry = Arc::new(open_registry(config)?);
    let enumerator = UsbEnumerator::new().context("initializing USB enumeration")?;
    let connected = enumerator.list_connected(true);

    println!("Connected devices:");
    if connected.is_empty() {
        println!("  (none)");
    }
    for device in &connected {
        let bus_id = device.export.bus_id;
        let shared = registry.list_shared().into_iter().find(|s| s.bus_id == bus_id);
        let state = match &shared {
            Some(s) if s.attached.is_some() => "attached",
            Some(_) => "shared",
            None => "not shared",
        };
        println!(
            "  {:<8} {:04x}:{:04x}  {:<32} {}",
            bus_id.to_string(),
            device.export.vendor_id,
            device.export.product_id,
            device.description.as_deref().unwrap_or("Unknown device"),
            state
        );
    }

    let connected_ids: Vec<BusId> = connected.iter().map(|d| d.export.bus_id).collect();
    let persisted = registry.list_persisted(&connected_ids);
    if !persisted.is_empty() {
        println!();
        println!("Persisted (shared but not connected):");
        for device in persisted {
            println!(
                "  {:<8} {:<32} {}",
                device.bus_id.to_string(),
                device.description,
                device.guid
            );
        }
    }

    Ok(())
}
