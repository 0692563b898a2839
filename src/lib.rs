//! # bq76pl536 Pack Acquisition Library
//!
//! Drives a daisy chain of bq76pl536 battery-monitor chips sharing one SPI
//! bus: discovers and addresses the chips, learns which cell channels are
//! populated, and acquires telemetry snapshots encoded as compact binary
//! frames. The physical bus is supplied by the caller through
//! [`transport::BusTransport`]; [`transport::SimulatedChain`] stands in for
//! hardware in tests and in the `bq-pack` CLI.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: CRC-8 checksum, register map and the transaction batch
//!   builder that frames register operations on the wire.
//! - **`transport`**: the bus seam and the simulated chain.
//! - **`chain`**: the register access layer (`BusSession`) and the chain-level
//!   procedures built on it: discovery, topology probing, default programming
//!   and fault/alert inspection.
//! - **`acquisition`**: one acquisition cycle and the telemetry frame format.
//! - **`monitor`**: `PackMonitor`, which owns a chain and serializes attach,
//!   detach and acquisition.
//! - **`config`**: figment-based configuration (`config/pack.toml` plus
//!   `BQ_PACK_` environment overrides).
//! - **`error`**: the `BqError` type and non-fatal `Discrepancy` reports.
//! - **`logging`**: tracing subscriber setup.
//!
//! ## Example
//! ```no_run
//! use bq76pl536_daq::{config::PackConfig, monitor::PackMonitor, transport::SimulatedChain};
//!
//! # async fn run() -> bq76pl536_daq::Result<()> {
//! let config = PackConfig::load()?;
//! let chain = SimulatedChain::nominal(&config.pack.cells_per_device);
//! let monitor = PackMonitor::new(config, chain)?;
//!
//! let report = monitor.attach().await?;
//! println!("{} chips, {} cells", report.chip_count(), report.cell_count());
//!
//! if let Some(frame) = monitor.acquire().await? {
//!     println!("{frame:02x?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod chain;
pub mod config;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod protocol;
pub mod transport;

pub use acquisition::{ChipTelemetry, TelemetryFrame};
pub use error::{BqError, Discrepancy, Result};
pub use monitor::{AttachReport, PackMonitor};
