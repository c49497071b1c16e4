// src/bin/adc_dump.rs

use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use cis3_lib::conditioning::ConditioningPipeline;
use cis3_lib::source::{IioSampleSource, SampleSource, SimulatedSource};
use cis3_lib::{BridgeConfig, TelemetryStore};

/// Sample every ADC channel a few times and print the conditioned values.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// IIO device index of the MCP3008.
    #[arg(short, long, default_value_t = 0)]
    iio_device: u32,
    /// Use the simulated source instead of the IIO device.
    #[arg(long)]
    simulate: bool,
    /// Number of passes over all channels.
    #[arg(short = 'n', long, default_value_t = 10)]
    passes: usize,
    /// Delay between passes in milliseconds.
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbose.tracing_level_filter())
        .with_target(false)
        .init();
    if let Err(e) = run(cli).await {
        error!("ADC dump failed: {:?}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => BridgeConfig::load(path).with_context(|| format!("Failed to load {:?}", path))?,
        None => BridgeConfig::default(),
    };

    if cli.simulate {
        dump(SimulatedSource::bench_defaults(), &config, &cli).await
    } else {
        let source = IioSampleSource::open(cli.iio_device)
            .with_context(|| format!("Failed to open IIO device {}", cli.iio_device))?;
        dump(source, &config, &cli).await
    }
}

async fn dump<S: SampleSource>(source: S, config: &BridgeConfig, cli: &Cli) -> Result<()> {
    let store = TelemetryStore::new();
    let mut pipeline = ConditioningPipeline::new(source, &config.adc, store.clone());
    info!("Sampling {} channels, {} passes.", pipeline.channel_count(), cli.passes);

    for pass in 1..=cli.passes {
        pipeline.process_all();
        let snapshot = store.snapshot();
        let line: Vec<String> = snapshot
            .channels
            .iter()
            .map(|(name, reading)| format!("{name}={reading}"))
            .collect();
        println!("[{pass:>3}] {}", line.join("  "));
        tokio::time::sleep(Duration::from_millis(cli.interval_ms)).await;
    }
    Ok(())
}
