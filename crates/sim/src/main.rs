//! usbd-sim
//!
//! Hosts a `UsbdStack` on a worker thread and drives it from a simulated
//! host: enumeration, bulk and interrupt traffic, start-of-frame ticks and a
//! suspend/resume cycle. Every state notification can be written to a
//! JSON-lines trace.

mod bus;
mod classes;
mod config;
mod driver;
mod worker;

use anyhow::{Context, Result, bail};
use clap::Parser;
use common::{ControlBridge, DEFAULT_CHANNEL_CAPACITY, create_control_bridge, setup_logging};
use config::{Mode, SimConfig};
use stack::{Event, StartStatus};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use worker::{SimCommand, SimNotification, spawn_stack_worker};

/// Start attempts before giving up on a glitching peripheral
const START_ATTEMPTS: u32 = 5;
/// How long a deferred start may take to be confirmed
const START_CONFIRM_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "usbd-sim")]
#[command(author, version, about = "Simulated USB device running the usbd stack")]
#[command(long_about = "
Runs the usbd device stack against a simulated peripheral and host.
The host enumerates the device, exchanges bulk and interrupt traffic,
suspends the bus and waits for the device to wake it up again.

EXAMPLES:
    # Run with default config
    usbd-sim

    # Deliver bus events inline instead of through the interrupt ring
    usbd-sim --mode immediate

    # Record every state notification
    usbd-sim --trace /tmp/usbd-trace.jsonl

CONFIGURATION:
    The simulator looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbd-sim/sim.toml
    3. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Event delivery mode (overrides the config file)
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Number of SOF ticks the host sends (overrides the config file)
    #[arg(short, long, value_name = "N")]
    frames: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Write state notifications as JSON lines to this file
    #[arg(long, value_name = "PATH")]
    trace: Option<PathBuf>,
}

type Bridge = ControlBridge<SimCommand, SimNotification>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = SimConfig::default();
        let path = SimConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        SimConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        SimConfig::load_or_default()
    };
    if let Some(mode) = args.mode {
        config.sim.mode = mode;
    }
    if let Some(frames) = args.frames {
        config.bus.frames = frames;
    }
    if let Some(level) = args.log_level.clone() {
        config.sim.log_level = level;
    }
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.sim.log_level).context("Failed to setup logging")?;
    info!("usbd-sim v{}", env!("CARGO_PKG_VERSION"));
    info!("Delivery mode: {:?}", config.sim.mode);

    let mut trace = match &args.trace {
        Some(path) => Some(BufWriter::new(File::create(path).with_context(|| {
            format!("Failed to create trace file: {}", path.display())
        })?)),
        None => None,
    };

    let (bridge, control) = create_control_bridge(DEFAULT_CHANNEL_CAPACITY);
    let remote_wakeup = config.bus.remote_wakeup;
    let worker_handle =
        spawn_stack_worker(control, config).context("Failed to spawn stack worker")?;

    let result = tokio::select! {
        r = run_session(&bridge, remote_wakeup, &mut trace) => r,
        r = signal::ctrl_c() => {
            match r {
                Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                Err(e) => error!("Error waiting for Ctrl+C: {}", e),
            }
            Ok(())
        }
    };

    info!("Shutting down stack worker...");
    if let Err(e) = bridge.send_command(SimCommand::Shutdown).await {
        warn!("Stack worker already gone: {}", e);
    }
    match tokio::task::spawn_blocking(move || worker_handle.join()).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("Stack worker failed: {:#}", e),
        Ok(Err(e)) => error!("Stack worker thread panicked: {:?}", e),
        Err(e) => error!("Failed to join stack worker: {}", e),
    }

    if let Some(mut trace) = trace {
        trace.flush().context("Failed to flush trace file")?;
    }

    result
}

fn record(trace: &mut Option<BufWriter<File>>, notification: &SimNotification) -> Result<()> {
    if let Some(out) = trace.as_mut() {
        serde_json::to_writer(&mut *out, notification).context("Failed to encode trace")?;
        writeln!(out).context("Failed to write trace")?;
    }
    Ok(())
}

/// Start the device, retrying aborted or unconfirmed starts
async fn start_device(bridge: &Bridge, trace: &mut Option<BufWriter<File>>) -> Result<()> {
    for attempt in 1..=START_ATTEMPTS {
        bridge
            .send_command(SimCommand::Start)
            .await
            .context("Failed to send Start")?;

        let deadline = tokio::time::Instant::now() + START_CONFIRM_TIMEOUT;
        loop {
            let next = tokio::time::timeout_at(deadline, bridge.recv_notification()).await;
            let Ok(notification) = next else {
                warn!(attempt, "start was never confirmed, retrying");
                break;
            };
            let notification = notification.context("Stack worker hung up")?;
            record(trace, &notification)?;

            match notification {
                SimNotification::Stack {
                    event: Event::Started,
                } => {
                    info!(attempt, "device started");
                    return Ok(());
                }
                SimNotification::StartResult {
                    status: StartStatus::Aborted,
                } => {
                    warn!(attempt, "peripheral aborted startup, retrying");
                    break;
                }
                SimNotification::Failed { context, error } => {
                    bail!("{} failed: {}", context, error)
                }
                _ => {}
            }
        }
    }
    bail!("device did not start after {} attempts", START_ATTEMPTS)
}

/// Drive one session until the host script ends
async fn run_session(
    bridge: &Bridge,
    remote_wakeup: bool,
    trace: &mut Option<BufWriter<File>>,
) -> Result<()> {
    start_device(bridge, trace).await?;

    loop {
        let notification = bridge
            .recv_notification()
            .await
            .context("Stack worker hung up")?;
        record(trace, &notification)?;

        match notification {
            SimNotification::Stack {
                event: Event::Suspend,
            } => {
                info!("bus suspended, entering low power");
                bridge.send_command(SimCommand::SuspendRequest).await?;
                if remote_wakeup {
                    bridge.send_command(SimCommand::Wakeup).await?;
                }
            }
            SimNotification::Stack { event } => info!(event = event.name(), "state change"),
            SimNotification::Request { command, accepted } => {
                info!(%command, accepted, "request processed")
            }
            SimNotification::BusFinished { report } => {
                info!(
                    frames = report.frames,
                    transfers = report.transfers,
                    retries = report.retries,
                    "host script finished"
                );
                bridge.send_command(SimCommand::Status).await?;
            }
            SimNotification::Status(status) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status).context("Failed to encode status")?
                );
                bridge.send_command(SimCommand::Stop).await?;
                return Ok(());
            }
            SimNotification::Failed { context, error } => {
                bail!("{} failed: {}", context, error)
            }
            SimNotification::StartResult { .. } => {}
        }
    }
}
