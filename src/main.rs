//! CLI entry point for the bq76pl536 pack monitor
//!
//! Attaches to a chain and prints what it finds:
//! - `discover`: discovery, chip health and topology report
//! - `snapshot`: one acquisition, decoded and as raw frame bytes
//! - `monitor`: periodic acquisition
//!
//! The chain is simulated from the configured pack layout; `--simulated-cells`
//! builds a different chain to exercise the discrepancy handling.
//!
//! # Usage
//! ```bash
//! bq-pack --config config/pack.toml discover
//! bq-pack snapshot
//! bq-pack --simulated-cells 4,4,3 monitor --interval-ms 500 --count 10
//! ```

use anyhow::{Context, Result};
use bq76pl536_daq::{
    config::PackConfig,
    logging::{self, OutputFormat, TracingConfig},
    protocol::Checksum,
    transport::SimulatedChain,
    AttachReport, PackMonitor, TelemetryFrame,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "bq-pack")]
#[command(about = "bq76pl536 battery pack discovery and telemetry", long_about = None)]
struct Cli {
    /// Pack configuration file
    #[arg(long, default_value = bq76pl536_daq::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,

    /// Cells per simulated chip (defaults to the configured layout)
    #[arg(long, value_delimiter = ',')]
    simulated_cells: Option<Vec<u8>>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover the chain and report chips, health and topology
    Discover,

    /// Acquire one telemetry frame
    Snapshot,

    /// Acquire frames periodically
    Monitor {
        /// Milliseconds between cycles
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Stop after this many cycles (runs until interrupted if omitted)
        #[arg(long)]
        count: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PackConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate().context("invalid pack configuration")?;
    let tracing_config = TracingConfig::from_pack_config(&config)?.with_format(cli.log_format);
    logging::init(tracing_config)?;

    let cells = cli.simulated_cells.clone().unwrap_or_else(|| {
        config.pack.cells_per_device[..config.pack.devices_used as usize].to_vec()
    });
    let chain = SimulatedChain::nominal(&cells);
    let monitor = PackMonitor::new(config, chain)?;

    info!(chips = cells.len(), "attaching simulated chain");
    let report = monitor.attach().await?;

    match cli.command {
        Commands::Discover => {
            print_report(&report);
            Ok(())
        }
        Commands::Snapshot => snapshot(&monitor).await,
        Commands::Monitor { interval_ms, count } => {
            run_monitor(&monitor, Duration::from_millis(interval_ms), count).await
        }
    }
}

fn print_report(report: &AttachReport) {
    println!(
        "Chips: {} of {} expected",
        report.discovery.found, report.discovery.expected
    );
    if let Some(stop) = &report.discovery.stop {
        println!("Discovery stopped: {stop}");
    }
    for discrepancy in &report.discrepancies {
        println!("  ! {discrepancy}");
    }

    for health in &report.health {
        let conditions = health.conditions();
        println!(
            "Chip {}: status 0x{:02x}{}",
            health.address,
            health.status.bits(),
            if conditions.is_empty() {
                String::new()
            } else {
                format!(" ({})", conditions.join(", "))
            }
        );
    }

    if let Some(layout) = &report.layout {
        println!("Cells: {}", layout.topology.cell_count());
        for chip in 1..=layout.topology.chip_count() {
            let channels: Vec<String> = layout
                .topology
                .channels()
                .iter()
                .filter(|c| c.chip == chip)
                .map(|c| c.channel().to_string())
                .collect();
            println!("  chip {chip}: channels [{}]", channels.join(", "));
        }
    }
}

async fn snapshot<T>(monitor: &PackMonitor<T>) -> Result<()>
where
    T: bq76pl536_daq::transport::BusTransport,
{
    match monitor.acquire().await? {
        Some(bytes) => print_frame(&bytes),
        None => {
            println!("No data ready");
            Ok(())
        }
    }
}

async fn run_monitor<T>(monitor: &PackMonitor<T>, interval: Duration, count: Option<u64>) -> Result<()>
where
    T: bq76pl536_daq::transport::BusTransport,
{
    let mut ticker = tokio::time::interval(interval);
    let mut cycle = 0u64;

    while count.map_or(true, |n| cycle < n) {
        ticker.tick().await;
        cycle += 1;
        match monitor.acquire().await {
            Ok(Some(bytes)) => {
                println!("--- cycle {cycle} ---");
                print_frame(&bytes)?;
            }
            Ok(None) => println!("--- cycle {cycle}: no data ready ---"),
            Err(e) if e.is_fatal() => error!(cycle, error = %e, "acquisition failed"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn print_frame(bytes: &[u8]) -> Result<()> {
    let frame = TelemetryFrame::decode(bytes, &Checksum::new())?;

    let volts: Vec<String> = frame.cell_volts().map(|v| format!("{v:.2}")).collect();
    println!("Cells ({}): [{}] V", frame.voltages.len(), volts.join(", "));
    println!("Pack: {:.2} V", frame.pack_volts());
    for (i, chip) in frame.chips.iter().enumerate() {
        println!(
            "Chip {}: {} cells, {} / {} °C, status 0x{:02x} fault 0x{:02x} alert 0x{:02x} cuv 0x{:02x} cov 0x{:02x}",
            i + 1,
            chip.expected_cells,
            chip.temperature1,
            chip.temperature2,
            chip.device_status,
            chip.fault_status,
            chip.alert_status,
            chip.undervoltage_fault,
            chip.overvoltage_fault,
        );
    }
    println!("Frame: {bytes:02x?}");
    Ok(())
}
