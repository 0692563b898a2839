//! Bus transport seam.
//!
//! The transport physically clocks a batch onto the SPI bus. It receives the
//! whole outbound and inbound buffers plus the list of segments carved out of
//! them, and must deselect the chain between consecutive segments so every
//! register operation is framed by its own chip-select pulse.

use anyhow::Result;
use async_trait::async_trait;

pub mod mock;

pub use mock::{SimulatedChain, SimulatedChip};

/// Whether a segment expects response bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Outbound only; inbound bytes are ignored.
    Write,
    /// Full duplex; inbound bytes carry register data and checksum.
    Read,
}

/// One register operation inside a batch.
///
/// `offset..offset + len` addresses the same span in the outbound and inbound
/// buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// First byte of the segment in both buffers.
    pub offset: usize,
    /// Bytes clocked for this segment.
    pub len: usize,
    /// Whether the inbound bytes matter.
    pub direction: Direction,
}

impl Segment {
    /// Byte range of the segment.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Synchronous full-duplex exchange over the chain's bus.
///
/// Implementations must complete (or fail) the whole batch before returning.
/// The caller holds exclusive access to the bus for the duration.
#[async_trait]
pub trait BusTransport: Send {
    /// Clock every segment out in order, filling `rx` for read segments.
    async fn transfer(&mut self, tx: &[u8], rx: &mut [u8], segments: &[Segment]) -> Result<()>;
}

#[async_trait]
impl<T: BusTransport + ?Sized> BusTransport for Box<T> {
    async fn transfer(&mut self, tx: &[u8], rx: &mut [u8], segments: &[Segment]) -> Result<()> {
        (**self).transfer(tx, rx, segments).await
    }
}
