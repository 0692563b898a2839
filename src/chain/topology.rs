//! Topology discovery: which cell channels are populated on each chip.

use tracing::{debug, info, instrument, warn};

use crate::chain::session::BusSession;
use crate::error::{BqError, Discrepancy, Result};
use crate::protocol::registers::{addr, reg};
use crate::transport::BusTransport;

/// Raw channel reading at or below which a channel counts as unpopulated.
pub const CELL_MISSING_THRESHOLD: u16 = 1000;

/// Channels per chip.
pub const CHANNELS_PER_CHIP: usize = 6;

const TABLE_LEN: usize = addr::MAX_CHIPS as usize + 1;

/// Expected cell count per chip position. Index 0 is unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellCountTable([u8; TABLE_LEN]);

impl CellCountTable {
    /// Table with every chip expecting zero cells.
    pub fn new() -> Self {
        Self([0; TABLE_LEN])
    }

    /// Table whose chip `i + 1` expects `counts[i]` cells.
    pub fn from_counts(counts: &[u8]) -> Result<Self> {
        if counts.len() > addr::MAX_CHIPS as usize {
            return Err(BqError::Configuration(format!(
                "{} cell counts given, at most {} chips are supported",
                counts.len(),
                addr::MAX_CHIPS
            )));
        }
        let mut table = Self::new();
        table.0[1..=counts.len()].copy_from_slice(counts);
        Ok(table)
    }

    /// Expected cells on `chip` (0 for unknown chips).
    pub fn get(&self, chip: u8) -> u8 {
        self.0.get(chip as usize).copied().unwrap_or(0)
    }

    /// Overwrite the expectation for `chip`.
    pub fn set(&mut self, chip: u8, cells: u8) {
        if let Some(slot) = self.0.get_mut(chip as usize).filter(|_| chip != 0) {
            *slot = cells;
        }
    }

    /// Expectations for chips `1..=chip_count`.
    pub fn active(&self, chip_count: u8) -> &[u8] {
        let end = (chip_count as usize).min(TABLE_LEN - 1);
        &self.0[1..=end]
    }
}

impl Default for CellCountTable {
    fn default() -> Self {
        Self::new()
    }
}

/// One populated voltage-sense line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellChannel {
    /// Chip address.
    pub chip: u8,
    /// VCELLn register of the channel.
    pub register: u8,
}

impl CellChannel {
    /// 1-based channel number on the chip.
    pub fn channel(&self) -> u8 {
        (self.register - reg::VCELL1) / 2 + 1
    }
}

/// Populated channels of the whole chain in sampling order: chip ascending,
/// then channel ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    chip_count: u8,
    channels: Vec<CellChannel>,
}

impl Topology {
    /// Chips probed.
    pub fn chip_count(&self) -> u8 {
        self.chip_count
    }

    /// Populated channels.
    pub fn channels(&self) -> &[CellChannel] {
        &self.channels
    }

    /// Total populated cells.
    pub fn cell_count(&self) -> usize {
        self.channels.len()
    }

    /// Populated channels on one chip.
    pub fn cells_on(&self, chip: u8) -> usize {
        self.channels.iter().filter(|c| c.chip == chip).count()
    }
}

/// Probe every channel of chips `1..=chip_count`.
///
/// A channel reading above [`CELL_MISSING_THRESHOLD`] is populated. Where a
/// chip's populated count disagrees with `table`, the table entry is corrected
/// and a [`Discrepancy::TopologyMismatch`] is returned alongside the topology.
#[instrument(skip(session, table), err)]
pub async fn probe<T: BusTransport>(
    session: &mut BusSession<T>,
    chip_count: u8,
    table: &mut CellCountTable,
) -> Result<(Topology, Vec<Discrepancy>)> {
    let mut channels = Vec::new();
    let mut discrepancies = Vec::new();

    for chip in 1..=chip_count {
        let mut found = 0u8;
        for register in reg::VCELLS {
            let raw = session.read_register(chip, register, 2).await?;
            debug!(chip, register, raw, "channel probe");
            if raw > CELL_MISSING_THRESHOLD {
                channels.push(CellChannel { chip, register });
                found += 1;
            }
        }

        let expected = table.get(chip);
        if expected != found {
            let discrepancy = Discrepancy::TopologyMismatch {
                chip,
                expected,
                found,
            };
            warn!(%discrepancy, "correcting cell count");
            table.set(chip, found);
            discrepancies.push(discrepancy);
        }
    }

    info!(cells = channels.len(), chips = chip_count, "topology probed");
    Ok((
        Topology {
            chip_count,
            channels,
        },
        discrepancies,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SimulatedChain, SimulatedChip};

    fn addressed(raw: [u16; 6], address: u8) -> SimulatedChip {
        SimulatedChip::new()
            .with_stale_address(address)
            .with_raw_cells(raw)
    }

    #[tokio::test]
    async fn two_populated_channels_correct_the_table() {
        let chain = SimulatedChain::new(vec![addressed([3000, 2500, 900, 12, 0, 1000], 1)]);
        let mut session = BusSession::new(chain);
        let mut table = CellCountTable::from_counts(&[4]).unwrap();

        let (topology, discrepancies) = probe(&mut session, 1, &mut table).await.unwrap();

        assert_eq!(
            topology.channels(),
            &[
                CellChannel {
                    chip: 1,
                    register: reg::VCELL1
                },
                CellChannel {
                    chip: 1,
                    register: reg::VCELL2
                },
            ]
        );
        assert_eq!(table.get(1), 2);
        assert_eq!(
            discrepancies,
            vec![Discrepancy::TopologyMismatch {
                chip: 1,
                expected: 4,
                found: 2
            }]
        );
    }

    #[tokio::test]
    async fn channels_are_ordered_chip_then_channel() {
        let chain = SimulatedChain::new(vec![
            addressed([0, 3600, 0, 3600, 0, 0], 1),
            addressed([3600, 0, 0, 0, 0, 3600], 2),
        ]);
        let mut session = BusSession::new(chain);
        let mut table = CellCountTable::from_counts(&[2, 2]).unwrap();

        let (topology, discrepancies) = probe(&mut session, 2, &mut table).await.unwrap();
        assert!(discrepancies.is_empty());

        let order: Vec<(u8, u8)> = topology
            .channels()
            .iter()
            .map(|c| (c.chip, c.channel()))
            .collect();
        assert_eq!(order, vec![(1, 2), (1, 4), (2, 1), (2, 6)]);
        assert_eq!(topology.cells_on(2), 2);
    }

    #[tokio::test]
    async fn checksum_failure_aborts_the_probe() {
        let chain = SimulatedChain::new(vec![addressed([3600; 6], 1)]);
        let mut session = BusSession::new(chain.clone());
        let mut table = CellCountTable::from_counts(&[6]).unwrap();

        chain.corrupt_next_read();
        assert!(probe(&mut session, 1, &mut table).await.is_err());
    }

    #[test]
    fn table_index_zero_is_unused() {
        let mut table = CellCountTable::from_counts(&[4, 4, 4, 3]).unwrap();
        table.set(0, 6);
        assert_eq!(table.get(0), 0);
        assert_eq!(table.active(4), &[4, 4, 4, 3]);
        assert_eq!(table.get(33), 0);
        assert!(CellCountTable::from_counts(&[3; 33]).is_err());
    }
}
