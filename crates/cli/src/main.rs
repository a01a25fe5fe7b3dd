//! plotctl
//!
//! Command-line tool for USB label plotters: stream plot jobs, query device
//! status, and watch plug/unplug activity.

mod config;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use config::{DeviceEntry, PlotctlConfig};
use engine::{CommandPort, DeviceIdentity, DeviceSession, HotplugEvent, HotplugMonitor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::spawn_blocking;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use transport::UsbTransport;

#[derive(Parser, Debug)]
#[command(name = "plotctl")]
#[command(author, version, about = "Drive USB label plotters")]
#[command(long_about = "
Stream plot jobs to USB label plotters, query their status, and watch
plug/unplug activity on the bus.

EXAMPLES:
    # Send a plot job to the first configured plotter that is attached
    plotctl send label.plt

    # Send to one configured model only
    plotctl send --device GNS label.plt

    # Query firmware version, model, and readiness
    plotctl status

    # Watch plug/unplug activity for one vendor
    plotctl monitor --vendor 0x0483

CONFIGURATION:
    plotctl looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/plotterlink/plotctl.toml
    3. /etc/plotterlink/plotctl.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream a plot job file to a plotter
    Send {
        /// File holding the plot job payload
        file: PathBuf,

        /// Only try this configured device name
        #[arg(short, long, value_name = "NAME")]
        device: Option<String>,
    },
    /// Query firmware version, model, and readiness
    Status {
        /// Only try this configured device name
        #[arg(short, long, value_name = "NAME")]
        device: Option<String>,
    },
    /// Watch plug/unplug activity
    Monitor {
        /// Vendor ID to match; 0 matches any vendor
        #[arg(long, value_name = "VID", default_value = "0")]
        vendor: String,

        /// Product ID to match; 0 matches any product
        #[arg(long, value_name = "PID", default_value = "0")]
        product: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = PlotctlConfig::default();
        let path = PlotctlConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    // Load configuration first (to get log level from config if not specified)
    let config = if let Some(ref path) = args.config {
        let path = PathBuf::from(shellexpand::tilde(path).as_ref());
        PlotctlConfig::load(Some(path)).context("Failed to load configuration")?
    } else {
        PlotctlConfig::load_or_default()
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("plotctl v{}", env!("CARGO_PKG_VERSION"));

    let Some(command) = args.command else {
        return Err(anyhow!("No command given; run with --help for usage"));
    };

    match command {
        Command::Send { file, device } => run_send(&config, file, device.as_deref()).await,
        Command::Status { device } => run_status(&config, device.as_deref()).await,
        Command::Monitor { vendor, product } => run_monitor(&vendor, &product).await,
    }
}

/// Setup the tracing subscriber; RUST_LOG overrides the configured level.
fn setup_logging(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("Invalid log filter: {}", e))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    Ok(())
}

/// Build a transport with the configured write timeout.
fn build_transport(config: &PlotctlConfig) -> Result<UsbTransport> {
    let transport = UsbTransport::new()
        .context("Failed to initialize USB transport")?
        .with_write_timeout(config.link.write_timeout());
    Ok(transport)
}

/// Connect to the first configured device that is attached.
///
/// With `--device`, only that entry is tried. The engine runs blocking USB
/// calls, so each attempt goes through `spawn_blocking`.
async fn connect_first(
    session: &Arc<DeviceSession<UsbTransport>>,
    config: &PlotctlConfig,
    device: Option<&str>,
) -> Result<DeviceEntry> {
    let entries: Vec<DeviceEntry> = match device {
        Some(name) => {
            let entry = config.find_device(name).cloned().ok_or_else(|| {
                let known: Vec<&str> = config.devices.iter().map(|d| d.name.as_str()).collect();
                if known.is_empty() {
                    anyhow!("Unknown device '{}'. No devices configured.", name)
                } else {
                    anyhow!(
                        "Unknown device '{}'. Configured devices: {}",
                        name,
                        known.join(", ")
                    )
                }
            })?;
            vec![entry]
        }
        None => config.devices.clone(),
    };

    if entries.is_empty() {
        anyhow::bail!("No devices configured; add [[devices]] entries or run --save-config");
    }

    for entry in entries {
        let filter = entry.identity()?;
        debug!("Scanning for {} ({})", entry.name, filter);

        let session = Arc::clone(session);
        let found = spawn_blocking(move || session.connect(filter))
            .await
            .context("Connect task panicked")?
            .with_context(|| format!("Failed to connect to {}", entry.name))?;
        if found {
            return Ok(entry);
        }
    }

    anyhow::bail!("No matching plotter is attached")
}

/// Disconnect the session from a blocking task.
async fn teardown(session: &Arc<DeviceSession<UsbTransport>>) -> Result<()> {
    let session = Arc::clone(session);
    let disconnected = spawn_blocking(move || session.disconnect())
        .await
        .context("Disconnect task panicked")?;
    debug!("Session closed: {}", disconnected);
    Ok(())
}

/// Stream a plot job to the plotter, reporting progress while it runs.
async fn run_send(config: &PlotctlConfig, file: PathBuf, device: Option<&str>) -> Result<()> {
    let payload = tokio::fs::read(&file)
        .await
        .with_context(|| format!("Failed to read plot job: {}", file.display()))?;
    if payload.is_empty() {
        anyhow::bail!("Plot job {} is empty", file.display());
    }

    let session = Arc::new(DeviceSession::new(build_transport(config)?));
    let entry = connect_first(&session, config, device).await?;
    info!("Connected to {}", entry.name);

    let total = payload.len() as u64;
    let mut sender = {
        let session = Arc::clone(&session);
        spawn_blocking(move || session.send(&payload))
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let sent = loop {
        tokio::select! {
            result = &mut sender => {
                let sent = result.context("Transfer task panicked")?;
                break sent;
            }
            _ = ticker.tick() => {
                info!("Progress: {} / {} bytes", session.progress(), total);
            }
        }
    };

    teardown(&session).await?;
    let sent = sent.context("Transfer failed")?;

    println!("Sent {} bytes to {}", sent, entry.name);
    Ok(())
}

/// Status values gathered over one connection.
struct StatusReport {
    version: Vec<u8>,
    model: Vec<u8>,
    ready: bool,
}

/// Query firmware version, model ID, and readiness.
async fn run_status(config: &PlotctlConfig, device: Option<&str>) -> Result<()> {
    let session = Arc::new(DeviceSession::new(build_transport(config)?));
    let entry = connect_first(&session, config, device).await?;

    let spacing = config.link.command_spacing();
    let response_timeout = config.link.response_timeout();
    let report = {
        let session = Arc::clone(&session);
        spawn_blocking(move || -> engine::Result<StatusReport> {
            let port = CommandPort::with_config(&session, spacing, response_timeout);
            let version = port.exchange(b"RSVER;")?;
            let model = port.exchange(b"RPID;")?;
            let ready = port.query_status()?.is_ready();
            Ok(StatusReport {
                version,
                model,
                ready,
            })
        })
        .await
        .context("Status task panicked")?
    };

    // Tear the link down even when a query failed.
    teardown(&session).await?;
    let report = report.context("Status query failed")?;

    println!("Device:  {}", entry.name);
    println!("Version: {}", String::from_utf8_lossy(&report.version).trim());
    println!("Model:   {}", String::from_utf8_lossy(&report.model).trim());
    println!("Ready:   {}", if report.ready { "yes" } else { "no" });
    Ok(())
}

/// Print plug/unplug activity until Ctrl+C.
async fn run_monitor(vendor: &str, product: &str) -> Result<()> {
    let filter = DeviceIdentity::new(
        config::parse_device_id(vendor).context("Invalid --vendor")?,
        config::parse_device_id(product).context("Invalid --product")?,
    );

    let transport = UsbTransport::new().context("Failed to initialize USB transport")?;
    let monitor = HotplugMonitor::new(transport);

    monitor
        .start(filter, |event| match event {
            HotplugEvent::Arrival { identity } => println!("attached  {identity}"),
            HotplugEvent::Removal { identity } => println!("detached  {identity}"),
            HotplugEvent::Error { message } => eprintln!("error     {message}"),
        })
        .context("Failed to start hotplug monitoring")?;

    println!("Watching for {filter} (press Ctrl+C to stop)");
    signal::ctrl_c().await.context("Failed to wait for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    monitor.stop();
    Ok(())
}
