//! Register access layer.
//!
//! A `BusSession` owns everything one attached chain mutates while talking to
//! the bus: the transport, the pending batch and the checksum table. There is
//! exactly one per attached chain; the monitor serializes access to it.

use tracing::debug;

use crate::error::Result;
use crate::protocol::batch::Batch;
use crate::protocol::crc::Checksum;
use crate::transport::BusTransport;

/// Exclusive register-level access to a chain.
pub struct BusSession<T: BusTransport> {
    transport: T,
    batch: Batch,
    checksum: Checksum,
}

impl<T: BusTransport> BusSession<T> {
    /// Wrap a transport. The checksum table is built here, once.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            batch: Batch::new(),
            checksum: Checksum::new(),
        }
    }

    /// Start a new batch, discarding anything queued.
    pub fn begin(&mut self) {
        self.batch.begin();
    }

    /// Queue a write in the current batch.
    pub fn write_register(&mut self, address: u8, register: u8, data: u8) -> Result<()> {
        self.batch
            .append_write(&self.checksum, address, register, data)
    }

    /// Submit queued writes.
    pub async fn flush(&mut self) -> Result<()> {
        self.batch.flush(&mut self.transport).await
    }

    /// Flush queued writes together with a read of `width` bytes and return the
    /// verified value.
    pub async fn flush_and_read(&mut self, address: u8, register: u8, width: u8) -> Result<u16> {
        let value = self
            .batch
            .append_read(&mut self.transport, &self.checksum, address, register, width)
            .await?;
        debug!(
            chip = address,
            register = format_args!("0x{register:02x}"),
            value = format_args!("0x{value:x}"),
            "read register"
        );
        Ok(value)
    }

    /// Read one register (`width` 1) or register pair (`width` 2) in a batch
    /// of its own.
    ///
    /// Writes still queued are discarded, not sent. Use
    /// [`flush_and_read`](Self::flush_and_read) to carry them with the read.
    pub async fn read_register(&mut self, address: u8, register: u8, width: u8) -> Result<u16> {
        self.batch.begin();
        self.flush_and_read(address, register, width).await
    }

    /// Single-byte read.
    pub async fn read_byte(&mut self, address: u8, register: u8) -> Result<u8> {
        Ok(self.read_register(address, register, 1).await? as u8)
    }

    /// Checksum table shared with frame encoding.
    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    /// Operations queued but not yet submitted.
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

}

impl<T: BusTransport> std::fmt::Debug for BusSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSession")
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::registers::{addr, reg};
    use crate::transport::mock::BusRecord;
    use crate::transport::{SimulatedChain, SimulatedChip};

    #[tokio::test]
    async fn writes_ride_along_with_the_next_read() {
        let chain = SimulatedChain::new(vec![SimulatedChip::with_cells_mv(&[3600])]);
        let mut session = BusSession::new(chain.clone());

        session.begin();
        session
            .write_register(addr::DISCOVERY, reg::ADDRESS_CONTROL, 1)
            .unwrap();
        assert_eq!(session.pending(), 1);
        assert!(chain.transfers().is_empty());

        let address = session
            .flush_and_read(1, reg::ADDRESS_CONTROL, 1)
            .await
            .unwrap();
        assert_eq!(address, 0x81);
        assert_eq!(session.pending(), 0);
        assert_eq!(
            chain.transfers(),
            vec![vec![
                BusRecord::Write {
                    address: 0,
                    register: reg::ADDRESS_CONTROL,
                    data: 1
                },
                BusRecord::Read {
                    address: 1,
                    register: reg::ADDRESS_CONTROL,
                    count: 1
                },
            ]]
        );
    }

    #[tokio::test]
    async fn plain_read_drops_queued_writes() {
        let chain = SimulatedChain::new(vec![SimulatedChip::new().with_stale_address(1)]);
        let mut session = BusSession::new(chain.clone());

        session.begin();
        session.write_register(1, reg::CB_CTRL, 0x3F).unwrap();
        let status = session.read_register(1, reg::DEVICE_STATUS, 1).await.unwrap();

        assert_eq!(status & 0x80, 0x80);
        assert_eq!(session.pending(), 0);
        assert_eq!(
            chain.transfers(),
            vec![vec![BusRecord::Read {
                address: 1,
                register: reg::DEVICE_STATUS,
                count: 1
            }]]
        );
        assert_eq!(chain.chip(0).unwrap().register(reg::CB_CTRL), 0);
    }

    #[tokio::test]
    async fn two_byte_reads_are_big_endian() {
        let chip = SimulatedChip::new()
            .with_stale_address(1)
            .with_raw_cells([2000, 2100, 2200, 0, 0, 0]);
        let mut session = BusSession::new(SimulatedChain::new(vec![chip]));

        assert_eq!(session.read_register(1, reg::VCELL1, 2).await.unwrap(), 2000);
        assert_eq!(session.read_register(1, reg::VCELL3, 2).await.unwrap(), 2200);
        assert_eq!(session.read_byte(1, reg::VCELL1).await.unwrap(), 0x07);
    }

    #[tokio::test]
    async fn corrupted_response_is_rejected() {
        let chain = SimulatedChain::new(vec![SimulatedChip::new().with_stale_address(1)]);
        let mut session = BusSession::new(chain.clone());

        chain.corrupt_next_read();
        let err = session
            .read_register(1, reg::TEMPERATURE1, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::BqError::ChecksumMismatch { address: 1, .. }));

        assert!(session.read_register(1, reg::TEMPERATURE1, 2).await.is_ok());
    }
}
