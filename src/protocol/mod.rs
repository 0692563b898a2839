//! Wire protocol of the bq76pl536 chain: checksum, register map and batching.

pub mod batch;
pub mod crc;
pub mod registers;

pub use batch::{Batch, BUFFER_SIZE, MAX_OPERATIONS};
pub use crc::Checksum;
