use anyhow::{Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::signal;

use clap_verbosity_flag::{InfoLevel, Verbosity};
#[cfg(not(target_os = "linux"))]
use tracing::warn;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cis3_lib::conditioning::ConditioningPipeline;
#[cfg(target_os = "linux")]
use cis3_lib::heartbeat::SocketCanListener;
use cis3_lib::heartbeat::{Heartbeat, SimulatedBus};
use cis3_lib::publish::{JsonLinesSink, LogSink};
use cis3_lib::serial::{PortTransport, SimulatedResponder};
use cis3_lib::source::{IioSampleSource, SimulatedSource};
use cis3_lib::{BridgeConfig, LinMaster, Scheduler, TelemetryStore};

/// Sensor bridge for the CIS3 board: ADC conditioning plus LIN sensor polling.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Run against simulated ADC, LIN slave and bus instead of hardware.
    #[arg(long)]
    simulate: bool,
    /// UART device for the LIN transceiver (overrides the config).
    #[arg(short = 'p', long)]
    serial_port: Option<String>,
    /// LIN baud rate (overrides the config).
    #[arg(short, long)]
    baud: Option<u32>,
    /// IIO device index of the MCP3008.
    #[arg(short, long, default_value_t = 0)]
    iio_device: u32,
    /// SocketCAN interface watched for bus liveness.
    #[arg(long, default_value = "can0")]
    can_interface: String,
    /// Append one JSON snapshot per publish interval to this file.
    #[arg(long)]
    jsonl: Option<PathBuf>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn setup_logging(
    log_file_path: Option<PathBuf>,
    verbosity: &Verbosity<InfoLevel>,
) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_thread_ids(false);

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path)
            .with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // INFO by default, DEBUG with -v, TRACE with -vv. RUST_LOG still wins.
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => BridgeConfig::default(),
    };
    if let Some(port) = &cli.serial_port {
        config.lin.port = port.clone();
    }
    if let Some(baud) = cli.baud {
        config.lin.baud_rate = baud;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    if let Err(e) = run(cli).await {
        error!("Bridge failed: {:?}", e);
        process::exit(1);
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn spawn_can_heartbeat(
    scheduler: &mut Scheduler,
    interface: &str,
    config: &BridgeConfig,
    store: &TelemetryStore,
) -> Result<()> {
    let listener = SocketCanListener::open(interface)
        .with_context(|| format!("Failed to open CAN interface {}", interface))?;
    scheduler.spawn_heartbeat(Heartbeat::new(listener, &config.heartbeat, store.clone()));
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn spawn_can_heartbeat(
    _scheduler: &mut Scheduler,
    interface: &str,
    _config: &BridgeConfig,
    _store: &TelemetryStore,
) -> Result<()> {
    warn!("SocketCAN is Linux-only; not watching {}, bus status stays OFF.", interface);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let store = TelemetryStore::new();
    let mut scheduler = Scheduler::new(store.clone());
    let schedule = &config.schedule;

    if cli.simulate {
        info!("Starting in simulation mode, no hardware is touched.");
        let pipeline = ConditioningPipeline::new(SimulatedSource::bench_defaults(), &config.adc, store.clone());
        scheduler.spawn_conditioning(pipeline, Duration::from_millis(schedule.adc_interval_ms));

        // Plausible room readings in hundredths.
        let values = BTreeMap::from([(0x50, 2150), (0x51, 4520)]);
        let responder = SimulatedResponder::new(config.lin.sync_byte, values);
        let master = LinMaster::new(responder, config.lin.clone(), store.clone());
        scheduler.spawn_protocol(master, Duration::from_millis(schedule.lin_interval_ms));

        let bus = SimulatedBus::new(Duration::from_millis(50));
        scheduler.spawn_heartbeat(Heartbeat::new(bus, &config.heartbeat, store.clone()));
    } else {
        let source = IioSampleSource::open(cli.iio_device)
            .with_context(|| format!("Failed to open IIO device {}", cli.iio_device))?;
        let pipeline = ConditioningPipeline::new(source, &config.adc, store.clone());
        scheduler.spawn_conditioning(pipeline, Duration::from_millis(schedule.adc_interval_ms));

        let transport = PortTransport::open(&config.lin.port, config.lin.baud_rate)
            .with_context(|| format!("Failed to open UART {}", config.lin.port))?;
        let master = LinMaster::new(transport, config.lin.clone(), store.clone());
        scheduler.spawn_protocol(master, Duration::from_millis(schedule.lin_interval_ms));

        spawn_can_heartbeat(&mut scheduler, &cli.can_interface, &config, &store)?;
    }

    let publish_period = Duration::from_millis(schedule.publish_interval_ms);
    scheduler.spawn_consumer("log", LogSink::new(config.publish.topic_prefix.clone()), publish_period);
    if let Some(path) = &cli.jsonl {
        let file = File::options()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open JSON lines output at: {:?}", path))?;
        info!("Writing snapshots to {:?}", path);
        scheduler.spawn_consumer("jsonl", JsonLinesSink::new(BufWriter::new(file)), publish_period);
    }

    scheduler
        .run_until(async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {e}");
            }
            info!("Ctrl+C received, shutting down.");
        })
        .await;

    Ok(())
}
