use anyhow::{Context, Result};
use clap::Parser;
use droidmond::app::{App, AppConfig};
use droidmon_adb::DEFAULT_ADDR;
use droidmon_capture::CaptureMode;
use droidmon_events::{Event, EventKind};
use droidmon_store::StoreConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Multi-device network inspector for Android handsets reachable over
/// ADB.
#[derive(Debug, Parser)]
#[command(name = "droidmond", version, about)]
struct Args {
    /// ADB server address (host:port)
    #[arg(long, default_value = DEFAULT_ADDR)]
    adb_addr: String,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Capture mode: auto, tcpdump, procnet
    #[arg(long, default_value = "auto")]
    mode: CaptureMode,

    /// Start capture automatically when a device comes online
    #[arg(long)]
    auto_capture: bool,

    /// Device property collection interval in seconds
    #[arg(long, default_value_t = 30)]
    prop_interval_secs: u64,

    /// Maximum concurrent worker tasks
    #[arg(long, default_value_t = 100)]
    max_workers: usize,

    /// Packet ring buffer capacity
    #[arg(long, default_value_t = 50_000)]
    max_packets: usize,

    /// Connection ring buffer capacity
    #[arg(long, default_value_t = 10_000)]
    max_connections: usize,

    /// Print bus events as JSON lines on stdout
    #[arg(long)]
    json_events: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, &args.log_format);

    let app = App::new(AppConfig {
        adb_addr: args.adb_addr.clone(),
        max_workers: args.max_workers,
        store: StoreConfig {
            max_packets: args.max_packets,
            max_connections: args.max_connections,
        },
        capture_mode: args.mode,
        auto_capture: args.auto_capture,
        prop_interval: Duration::from_secs(args.prop_interval_secs),
    });

    // Verify connectivity before settling into the main loop.
    let version = app
        .adb_version()
        .await
        .with_context(|| format!("cannot connect to ADB server at {}", args.adb_addr))?;
    info!(version = %version, addr = %args.adb_addr, "connected to ADB server");

    if args.json_events {
        app.bus().subscribe("stdout_printer", Arc::new(print_event_json));
    } else {
        app.bus().subscribe("stdout_printer", Arc::new(log_event));
    }

    Arc::clone(&app).startup();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down on signal");

    app.shutdown().await;
    Ok(())
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    if format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_event_json(e: &Event) {
    match serde_json::to_string(e) {
        Ok(line) => println!("{line}"),
        Err(err) => tracing::error!(error = %err, "failed to encode event"),
    }
}

fn log_event(e: &Event) {
    match e.kind {
        EventKind::DeviceConnected => {
            info!(serial = %e.serial, state = ?e.new_state, "EVENT: device connected");
        }
        EventKind::DeviceDisconnected => {
            info!(serial = %e.serial, last_state = ?e.old_state, "EVENT: device disconnected");
        }
        EventKind::DeviceStateChanged => {
            info!(
                serial = %e.serial,
                old = ?e.old_state,
                new = ?e.new_state,
                "EVENT: device state changed"
            );
        }
        EventKind::DeviceProperties => {
            info!(
                serial = %e.serial,
                count = e.props.as_ref().map_or(0, |p| p.len()),
                "EVENT: device properties"
            );
        }
    }
}
