// src/bin/lin_probe.rs

use anyhow::{Context, Result, bail};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use tracing::{error, info};

use cis3_lib::config::PidConfig;
use cis3_lib::lin::CycleReport;
use cis3_lib::serial::PortTransport;
use cis3_lib::{BridgeConfig, LinMaster, PidOutcome, TelemetryStore};

/// Poll the LIN sensors once and print what every PID returned.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// UART device for the LIN transceiver (overrides the config).
    #[arg(short = 'p', long)]
    serial_port: Option<String>,
    #[arg(short, long)]
    baud: Option<u32>,
    /// Poll only this PID (hex, e.g. 0x50), reusing its config entry if any.
    #[arg(long, value_parser = parse_pid)]
    pid: Option<u8>,
    /// Number of cycles to run.
    #[arg(short = 'n', long, default_value_t = 1)]
    cycles: usize,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn parse_pid(text: &str) -> Result<u8, String> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("invalid PID {text:?}: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbose.tracing_level_filter())
        .with_target(false)
        .init();
    if let Err(e) = run(cli) {
        error!("LIN probe failed: {:?}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::load(path).with_context(|| format!("Failed to load {:?}", path))?,
        None => BridgeConfig::default(),
    };
    let mut lin = config.lin.clone();
    if let Some(port) = cli.serial_port {
        lin.port = port;
    }
    if let Some(baud) = cli.baud {
        lin.baud_rate = baud;
    }
    if let Some(pid) = cli.pid {
        let entry = lin
            .pids
            .iter()
            .find(|p| p.pid == pid)
            .cloned()
            .unwrap_or_else(|| PidConfig::new(pid, format!("PID_{pid:02X}")));
        lin.pids = vec![entry];
    }
    config.lin = lin;
    config.validate().context("Invalid configuration")?;

    let transport = PortTransport::open(&config.lin.port, config.lin.baud_rate)
        .with_context(|| format!("Failed to open UART {}", config.lin.port))?;
    let store = TelemetryStore::new();
    let mut master = LinMaster::new(transport, config.lin.clone(), store.clone());

    let mut failures = 0;
    for cycle in 1..=cli.cycles {
        info!("Cycle {}/{}", cycle, cli.cycles);
        let report = master.run_cycle();
        failures += print_report(&report, &config);
    }

    let snapshot = store.snapshot();
    for (sensor, value) in &snapshot.sensors {
        println!("{sensor:>12}: {value:.2}");
    }
    if snapshot.sensors.is_empty() {
        bail!("No PID answered in {} cycle(s)", cli.cycles);
    }
    if failures > 0 {
        info!("{} exchange(s) failed.", failures);
    }
    Ok(())
}

fn print_report(report: &CycleReport, config: &BridgeConfig) -> usize {
    let mut failures = 0;
    for (pid, outcome) in &report.outcomes {
        let sensor = config.lin.sensor_name(*pid).unwrap_or("?");
        let header = hex::encode([config.lin.sync_byte, *pid]);
        match outcome {
            PidOutcome::Committed(value) => println!("0x{pid:02X} {sensor:<12} [{header}] -> {value:.2}"),
            PidOutcome::ChecksumMismatch { expected, received } => {
                failures += 1;
                println!("0x{pid:02X} {sensor:<12} [{header}] -> checksum 0x{received:02X}, expected 0x{expected:02X}");
            }
            other => {
                failures += 1;
                println!("0x{pid:02X} {sensor:<12} [{header}] -> {other:?}");
            }
        }
    }
    failures
}
