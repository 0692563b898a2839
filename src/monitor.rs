//! Pack monitor: attach, detach and acquisition over one chain.
//!
//! Two locks guard the shared state. The layout lock (`RwLock`) is held for
//! writing while the chain is attached or detached and for reading during an
//! acquisition cycle, so a topology rebuild never races a cycle that is
//! walking the channel table. The session lock (`Mutex`) serializes whole
//! cycles on the bus. Locks are always taken layout first, then session.

use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, instrument, warn};

use crate::acquisition::{self, TelemetryFrame};
use crate::chain::discovery::{search_pack, DiscoveryOutcome};
use crate::chain::health::{inspect_chip, program_defaults, ChipHealth, ProtectionRegisters};
use crate::chain::session::BusSession;
use crate::chain::topology::{probe, CellCountTable, Topology};
use crate::config::PackConfig;
use crate::error::{BqError, Discrepancy, Result};
use crate::transport::BusTransport;

/// What acquisition needs from an attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackLayout {
    /// Populated channels in sampling order.
    pub topology: Topology,
    /// Expected cells per chip, corrected by the topology probe.
    pub cell_counts: CellCountTable,
}

/// Everything learned while attaching.
#[derive(Debug, Clone)]
pub struct AttachReport {
    /// Discovery result.
    pub discovery: DiscoveryOutcome,
    /// Per-chip status at attach, faults and alerts already cleared.
    pub health: Vec<ChipHealth>,
    /// Layout adopted for acquisition; `None` when no chip answered.
    pub layout: Option<PackLayout>,
    /// Corrections made to the configured pack.
    pub discrepancies: Vec<Discrepancy>,
}

impl AttachReport {
    /// Chips in the active chain.
    pub fn chip_count(&self) -> u8 {
        self.discovery.found
    }

    /// Populated cells in the active chain.
    pub fn cell_count(&self) -> usize {
        self.layout
            .as_ref()
            .map_or(0, |layout| layout.topology.cell_count())
    }
}

/// Owns one chain and serves acquisition requests against it.
pub struct PackMonitor<T: BusTransport> {
    config: PackConfig,
    protection: ProtectionRegisters,
    layout: RwLock<Option<PackLayout>>,
    session: Mutex<BusSession<T>>,
}

impl<T: BusTransport> PackMonitor<T> {
    /// Validate `config` and take ownership of the transport.
    ///
    /// Refuses to construct with an invalid configuration.
    pub fn new(config: PackConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let protection = ProtectionRegisters::encode(&config.protection)?;
        Ok(Self {
            config,
            protection,
            layout: RwLock::new(None),
            session: Mutex::new(BusSession::new(transport)),
        })
    }

    /// Configuration the monitor was built with.
    pub fn config(&self) -> &PackConfig {
        &self.config
    }

    /// Discover the chain, program it, clear latched faults and probe which
    /// cells are populated.
    ///
    /// Fewer chips or cells than configured are adopted and reported as
    /// discrepancies. Reattaching rebuilds the layout from scratch.
    #[instrument(skip(self), fields(devices_used = self.config.pack.devices_used), err)]
    pub async fn attach(&self) -> Result<AttachReport> {
        let mut layout = self.layout.write().await;
        let mut session = self.session.lock().await;
        *layout = None;

        let expected = self.config.pack.devices_used;
        let discovery = search_pack(&mut *session, expected).await?;
        let found = discovery.found;
        let mut discrepancies = Vec::new();

        if found == expected {
            info!(found, "found all chips");
        } else {
            let discrepancy = Discrepancy::DiscoveryIncomplete { expected, found };
            warn!(%discrepancy, "adopting discovered chain length");
            discrepancies.push(discrepancy);
        }

        if found == 0 {
            error!("no chips answered discovery; pack stays detached");
            return Ok(AttachReport {
                discovery,
                health: Vec::new(),
                layout: None,
                discrepancies,
            });
        }

        program_defaults(&mut *session, self.protection).await?;

        let mut health = Vec::with_capacity(found as usize);
        for chip in 1..=found {
            health.push(inspect_chip(&mut *session, chip).await?);
        }

        let mut cell_counts = self.config.cell_count_table()?;
        let (topology, mismatches) = probe(&mut *session, found, &mut cell_counts).await?;
        discrepancies.extend(mismatches);
        info!(cells = topology.cell_count(), chips = found, "pack attached");

        let adopted = PackLayout {
            topology,
            cell_counts,
        };
        *layout = Some(adopted.clone());

        Ok(AttachReport {
            discovery,
            health,
            layout: Some(adopted),
            discrepancies,
        })
    }

    /// Drop the layout. Returns whether the pack was attached.
    pub async fn detach(&self) -> bool {
        let mut layout = self.layout.write().await;
        let _session = self.session.lock().await;
        let was_attached = layout.take().is_some();
        if was_attached {
            info!("pack detached");
        }
        was_attached
    }

    /// Whether a layout is in place.
    pub async fn is_attached(&self) -> bool {
        self.layout.read().await.is_some()
    }

    /// Current layout, if attached.
    pub async fn layout(&self) -> Option<PackLayout> {
        self.layout.read().await.clone()
    }

    /// Run one acquisition cycle and return the decoded snapshot.
    ///
    /// `Ok(None)` means no data was ready this cycle.
    pub async fn acquire_frame(&self) -> Result<Option<TelemetryFrame>> {
        let layout = self.layout.read().await;
        let layout = layout.as_ref().ok_or(BqError::NotAttached)?;
        let mut session = self.session.lock().await;
        acquisition::acquire(&mut *session, &layout.topology, &layout.cell_counts).await
    }

    /// Run one acquisition cycle and return the encoded frame.
    ///
    /// `Ok(None)` means no data was ready this cycle.
    pub async fn acquire(&self) -> Result<Option<Vec<u8>>> {
        let layout = self.layout.read().await;
        let layout = layout.as_ref().ok_or(BqError::NotAttached)?;
        let mut session = self.session.lock().await;
        match acquisition::acquire(&mut *session, &layout.topology, &layout.cell_counts).await? {
            Some(frame) => Ok(Some(frame.encode(session.checksum())?)),
            None => Ok(None),
        }
    }

    /// Inspect every attached chip, clearing latched faults and alerts.
    pub async fn chip_health(&self) -> Result<Vec<ChipHealth>> {
        let layout = self.layout.read().await;
        let layout = layout.as_ref().ok_or(BqError::NotAttached)?;
        let mut session = self.session.lock().await;

        let mut out = Vec::with_capacity(layout.topology.chip_count() as usize);
        for chip in 1..=layout.topology.chip_count() {
            out.push(inspect_chip(&mut *session, chip).await?);
        }
        Ok(out)
    }
}
