//! escpos-printer
//!
//! Command-line front end for the USB thermal-printer bridge: list devices,
//! print text or raw ESC/POS data, or serve framed bridge calls over stdio.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use common::setup_logging;
use printer::bridge::BridgeHandler;
use printer::config::{self, PrinterConfig};
use printer::usb::{
    ConnectionState, PermissionPolicy, PrinterAdapter, RusbHost, SimulatedHost, TransferStatus,
    UsbHost, decode_base64,
};
use protocol::DeviceDescriptor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Poll interval while waiting for a permission decision
const PERMISSION_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Extra time allowed on top of the transfer timeout before giving up
const OUTCOME_GRACE: Duration = Duration::from_secs(1);

/// Printer announced by the simulated host when no printer is configured
const SIMULATED_VENDOR_ID: u16 = 0x0483;
const SIMULATED_PRODUCT_ID: u16 = 0x5743;

#[derive(Parser, Debug)]
#[command(name = "escpos-printer")]
#[command(
    author,
    version,
    about = "Print to ESC/POS thermal printers over USB"
)]
#[command(long_about = "
Drives ESC/POS thermal receipt printers through their USB bulk OUT endpoint.

EXAMPLES:
    # List attached USB devices
    escpos-printer list

    # Same, as JSON
    escpos-printer list --json

    # Print a line of text on a POS-58 printer
    escpos-printer print-text --vendor 0x0483 --product 0x5743 'Hello'

    # Send a base64-encoded ESC/POS job (ESC @)
    escpos-printer print-raw G0A=

    # Answer framed bridge calls on stdin/stdout
    escpos-printer serve

CONFIGURATION:
    The configuration is looked up in the following order:
    1. Path specified with --config
    2. ~/.config/escpos-usb/printer.toml
    3. /etc/escpos-usb/printer.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Use an in-memory printer instead of real USB hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

/// Printer selection shared by the printing commands
#[derive(clap::Args, Debug)]
struct Target {
    /// USB vendor id (decimal or 0x hex); defaults to the configured printer
    #[arg(long, value_parser = config::parse_usb_id)]
    vendor: Option<u16>,

    /// USB product id (decimal or 0x hex); defaults to the configured printer
    #[arg(long, value_parser = config::parse_usb_id)]
    product: Option<u16>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached USB devices
    List {
        /// Print the descriptors as JSON
        #[arg(long)]
        json: bool,
    },

    /// Select a printer and open a connection to it
    Connect {
        #[command(flatten)]
        target: Target,
    },

    /// Print UTF-8 text
    PrintText {
        #[command(flatten)]
        target: Target,

        /// Text to print
        text: String,

        /// Append a line feed
        #[arg(short, long)]
        newline: bool,
    },

    /// Print base64-encoded raw data
    PrintRaw {
        #[command(flatten)]
        target: Target,

        /// Standard base64 payload
        data: String,
    },

    /// Write the contents of a file to the printer
    Write {
        #[command(flatten)]
        target: Target,

        /// File holding the raw bytes
        #[arg(short, long, value_name = "PATH")]
        file: PathBuf,
    },

    /// Answer framed bridge calls on stdin/stdout
    Serve,

    /// Save the default configuration and exit
    SaveConfig {
        /// Destination (defaults to the per-user configuration path)
        #[arg(long, value_name = "PATH")]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::SaveConfig { path } = &args.command {
        let config = PrinterConfig::default();
        let path = path.clone().unwrap_or_else(PrinterConfig::default_path);
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        PrinterConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("escpos-printer v{}", env!("CARGO_PKG_VERSION"));
    debug!("Log level: {}", log_level);

    let adapter = Arc::new(PrinterAdapter::new(config.adapter_settings()));
    let simulated = if args.simulate {
        let host = Arc::new(simulated_host(&adapter, &config));
        adapter.init(host.clone());
        Some(host)
    } else {
        let host = RusbHost::new(adapter.event_sink()).context("Failed to initialize USB")?;
        adapter.init(Arc::new(host) as Arc<dyn UsbHost>);
        None
    };

    let result = match args.command {
        Command::List { json } => list_devices(&adapter, json),
        Command::Connect { target } => {
            let (vendor, product) = resolve_target(&target, &config)?;
            connect(&adapter, vendor, product, config.permission.timeout()).await?;
            println!("Connected to {:04x}:{:04x}", vendor, product);
            Ok(())
        }
        Command::PrintText {
            target,
            text,
            newline,
        } => {
            let (vendor, product) = resolve_target(&target, &config)?;
            connect(&adapter, vendor, product, config.permission.timeout()).await?;
            let mut payload = text.into_bytes();
            if newline {
                payload.push(b'\n');
            }
            print_and_wait(&adapter, payload).await
        }
        Command::PrintRaw { target, data } => {
            let payload = decode_base64(&data).context("Invalid base64 payload")?;
            let (vendor, product) = resolve_target(&target, &config)?;
            connect(&adapter, vendor, product, config.permission.timeout()).await?;
            print_and_wait(&adapter, payload).await
        }
        Command::Write { target, file } => {
            let payload = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let (vendor, product) = resolve_target(&target, &config)?;
            connect(&adapter, vendor, product, config.permission.timeout()).await?;
            print_and_wait(&adapter, payload).await
        }
        Command::Serve => serve_stdio(adapter.clone()).await,
        Command::SaveConfig { .. } => Ok(()),
    };

    if let Some(host) = simulated {
        info!(
            "Simulated printer received {} bulk writes",
            host.writes().len()
        );
    }

    adapter.close_connection_if_exists();
    adapter.detach();
    result
}

fn simulated_host(adapter: &PrinterAdapter, config: &PrinterConfig) -> SimulatedHost {
    let (vendor_id, product_id) = config
        .printer
        .ids()
        .unwrap_or((SIMULATED_VENDOR_ID, SIMULATED_PRODUCT_ID));

    let host = SimulatedHost::new(adapter.event_sink());
    host.set_permission_policy(PermissionPolicy::AutoGrant);
    host.add_printer(DeviceDescriptor {
        device_id: 0x0101,
        vendor_id,
        product_id,
        name: "/dev/bus/usb/001/001".to_string(),
        manufacturer: Some("Simulated".to_string()),
        product: Some("ESC/POS Printer".to_string()),
    });
    info!("Using simulated printer {:04x}:{:04x}", vendor_id, product_id);
    host
}

fn resolve_target(target: &Target, config: &PrinterConfig) -> Result<(u16, u16)> {
    match (target.vendor, target.product) {
        (Some(vendor), Some(product)) => Ok((vendor, product)),
        (None, None) => config.printer.ids().ok_or_else(|| {
            anyhow!("No printer given; pass --vendor/--product or set [printer] in the config")
        }),
        _ => bail!("--vendor and --product must be given together"),
    }
}

fn list_devices(adapter: &PrinterAdapter, json: bool) -> Result<()> {
    let devices = adapter.list_devices();

    if json {
        let output =
            serde_json::to_string_pretty(&devices).context("Failed to serialize device list")?;
        println!("{}", output);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  [{}] {:04x}:{:04x} - {} {}",
            device.device_id,
            device.vendor_id,
            device.product_id,
            device
                .manufacturer
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            device.product.as_deref().unwrap_or("Unknown Product")
        );
        println!("      {}", device.name);
    }
    Ok(())
}

/// Select the printer, wait for permission and open the connection
async fn connect(
    adapter: &PrinterAdapter,
    vendor: u16,
    product: u16,
    permission_timeout: Duration,
) -> Result<()> {
    if !adapter.select_device(vendor, product) {
        bail!("No printer matches {:04x}:{:04x}", vendor, product);
    }

    let deadline = Instant::now() + permission_timeout;
    while adapter.state() == ConnectionState::PermissionPending {
        if Instant::now() >= deadline {
            bail!(
                "Timed out after {:?} waiting for permission to use {:04x}:{:04x}",
                permission_timeout,
                vendor,
                product
            );
        }
        tokio::time::sleep(PERMISSION_POLL_INTERVAL).await;
    }

    if !adapter.open_connection() {
        bail!(
            "Failed to open {:04x}:{:04x} (state: {})",
            vendor,
            product,
            adapter.state()
        );
    }
    Ok(())
}

/// Dispatch a payload and wait for its transfer outcome
async fn print_and_wait(adapter: &PrinterAdapter, payload: Vec<u8>) -> Result<()> {
    let outcomes = adapter.transfer_outcomes();
    let len = payload.len();
    let ticket = adapter
        .dispatch(payload)
        .ok_or_else(|| anyhow!("Print job of {} bytes was not accepted", len))?;

    let wait = adapter.settings().transfer_timeout + OUTCOME_GRACE;
    let outcome = tokio::time::timeout(wait, async {
        loop {
            let outcome = outcomes.recv().await?;
            if outcome.id == ticket.id {
                return Ok::<_, async_channel::RecvError>(outcome);
            }
        }
    })
    .await
    .context("Timed out waiting for the print transfer")?
    .context("Transfer outcome channel closed")?;

    match outcome.status {
        TransferStatus::Completed { written } => {
            println!("Printed {} of {} bytes", written, outcome.requested);
            Ok(())
        }
        TransferStatus::Failed { error } => Err(anyhow!("Print transfer failed: {}", error)),
        TransferStatus::Cancelled => Err(anyhow!("Print transfer was cancelled")),
    }
}

async fn serve_stdio(adapter: Arc<PrinterAdapter>) -> Result<()> {
    let _pump = adapter
        .spawn_event_pump()
        .context("Failed to start event pump")?;

    let handler = BridgeHandler::new(adapter);
    let answered = printer::serve::serve(handler, tokio::io::stdin(), tokio::io::stdout()).await?;
    info!("Bridge served {} calls", answered);
    Ok(())
}
