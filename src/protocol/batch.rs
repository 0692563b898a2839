//! Transaction batch builder.
//!
//! A batch queues up to [`MAX_OPERATIONS`] register operations in fixed
//! [`BUFFER_SIZE`]-byte outbound and inbound buffers and submits them to the
//! transport as one exchange. Writes only queue. A read is the terminating
//! operation: appending it submits everything queued so far plus the read, and
//! the decoded value is returned once its checksum verifies.
//!
//! Every submission leaves the batch empty, ready for the next operation.

use tracing::trace;

use crate::error::{BqError, Result};
use crate::protocol::crc::Checksum;
use crate::transport::{BusTransport, Direction, Segment};

/// Most operations one exchange may carry.
pub const MAX_OPERATIONS: usize = 10;

/// Size of each of the outbound and inbound buffers.
pub const BUFFER_SIZE: usize = 50;

/// Bytes clocked for a write: command, register, data, checksum.
pub const WRITE_LEN: usize = 4;

/// Bytes clocked for a read of `count` bytes.
pub const fn read_len(count: usize) -> usize {
    4 + count
}

/// Pending bus exchange.
pub struct Batch {
    tx: [u8; BUFFER_SIZE],
    rx: [u8; BUFFER_SIZE],
    segments: Vec<Segment>,
    cursor: usize,
}

impl Batch {
    /// Empty batch.
    pub fn new() -> Self {
        Self {
            tx: [0; BUFFER_SIZE],
            rx: [0; BUFFER_SIZE],
            segments: Vec::with_capacity(MAX_OPERATIONS),
            cursor: 0,
        }
    }

    /// Drop any queued operations and clear the inbound buffer.
    pub fn begin(&mut self) {
        self.segments.clear();
        self.rx = [0; BUFFER_SIZE];
        self.cursor = 0;
    }

    /// Operations queued.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Bytes used in each buffer.
    pub fn bytes_used(&self) -> usize {
        self.cursor
    }

    /// Queued outbound bytes.
    pub fn outbound(&self) -> &[u8] {
        &self.tx[..self.cursor]
    }

    /// Queue a register write.
    pub fn append_write(
        &mut self,
        checksum: &Checksum,
        address: u8,
        register: u8,
        data: u8,
    ) -> Result<()> {
        self.reserve(WRITE_LEN)?;

        let start = self.cursor;
        self.tx[start] = address << 1 | 1;
        self.tx[start + 1] = register;
        self.tx[start + 2] = data;
        self.tx[start + 3] = checksum.compute(&self.tx[start..start + 3], 0);
        self.push(WRITE_LEN, Direction::Write);

        trace!(chip = address, register, data, queued = self.len(), "queued write");
        Ok(())
    }

    /// Submit the queued writes without a trailing read.
    ///
    /// An empty batch is not submitted.
    pub async fn flush<T>(&mut self, transport: &mut T) -> Result<()>
    where
        T: BusTransport + ?Sized,
    {
        if self.is_empty() {
            return Ok(());
        }
        let result = self.submit(transport).await;
        self.begin();
        result
    }

    /// Append a read of `count` bytes and submit the whole batch.
    ///
    /// Queued writes go out in the same exchange, ahead of the read. The value
    /// is decoded big-endian once the response checksum, computed over the
    /// command bytes and then the returned bytes, matches the trailing byte.
    pub async fn append_read<T>(
        &mut self,
        transport: &mut T,
        checksum: &Checksum,
        address: u8,
        register: u8,
        count: u8,
    ) -> Result<u16>
    where
        T: BusTransport + ?Sized,
    {
        if count != 1 && count != 2 {
            return Err(BqError::InvalidArgument(format!(
                "read of {count} bytes from chip {address} register 0x{register:02x}; chips expose 1 or 2"
            )));
        }
        let width = count as usize;
        let len = read_len(width);
        self.reserve(len)?;

        let start = self.cursor;
        self.tx[start] = address << 1;
        self.tx[start + 1] = register;
        self.tx[start + 2] = count;
        self.tx[start + 3..start + len].fill(0);
        self.push(len, Direction::Read);

        let result = match self.submit(transport).await {
            Ok(()) => self.decode_read(checksum, start, width),
            Err(e) => Err(e),
        };
        self.begin();
        result
    }

    fn decode_read(&self, checksum: &Checksum, start: usize, width: usize) -> Result<u16> {
        let command = &self.tx[start..start + 3];
        let response = &self.rx[start + 3..start + 3 + width];
        let received = self.rx[start + 3 + width];

        let computed = checksum.compute(response, checksum.compute(command, 0));
        if computed != received {
            return Err(BqError::ChecksumMismatch {
                address: command[0] >> 1,
                register: command[1],
                computed,
                received,
            });
        }

        Ok(response
            .iter()
            .fold(0u16, |value, byte| value << 8 | *byte as u16))
    }

    fn reserve(&self, len: usize) -> Result<()> {
        if self.segments.len() >= MAX_OPERATIONS || self.cursor + len > BUFFER_SIZE {
            return Err(BqError::Overflow {
                operations: self.segments.len(),
                bytes: self.cursor,
            });
        }
        Ok(())
    }

    fn push(&mut self, len: usize, direction: Direction) {
        self.segments.push(Segment {
            offset: self.cursor,
            len,
            direction,
        });
        self.cursor += len;
    }

    async fn submit<T>(&mut self, transport: &mut T) -> Result<()>
    where
        T: BusTransport + ?Sized,
    {
        trace!(
            operations = self.segments.len(),
            bytes = self.cursor,
            tx = ?&self.tx[..self.cursor],
            "submitting batch"
        );
        transport
            .transfer(
                &self.tx[..self.cursor],
                &mut self.rx[..self.cursor],
                &self.segments,
            )
            .await
            .map_err(BqError::Transport)
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("operations", &self.segments.len())
            .field("bytes", &self.cursor)
            .finish()
    }
}
