//! CRC-8 checksum protecting every bus exchange and the telemetry frame.
//!
//! Polynomial x⁸+x²+x¹+x⁰ (generator 0x07), MSB first, no reflection, no final
//! XOR. This is the `CRC-8/SMBUS` parameter set, so the table-driven engine
//! from the `crc` crate is used directly. The remainder can be seeded, which lets
//! a read's checksum span the command bytes in the outbound buffer and the
//! response bytes in the inbound buffer without copying them together.

use crc::{Crc, CRC_8_SMBUS};

/// Table-driven CRC-8 engine.
///
/// Construction populates the 256-entry lookup table; build one per attached
/// chain and share it by reference.
pub struct Checksum {
    crc: Crc<u8>,
}

impl Checksum {
    /// Build the engine and its lookup table.
    pub const fn new() -> Self {
        Self {
            crc: Crc::<u8>::new(&CRC_8_SMBUS),
        }
    }

    /// Checksum `bytes`, starting from remainder `initial`.
    ///
    /// Pass 0 for the first segment and the previous result to extend a
    /// checksum across a second segment:
    /// `compute(b, compute(a, 0)) == compute(a ++ b, 0)`.
    pub fn compute(&self, bytes: &[u8], initial: u8) -> u8 {
        let mut digest = self.crc.digest_with_initial(initial);
        digest.update(bytes);
        digest.finalize()
    }

    /// Lookup-table entry for `index`, i.e. the checksum of that single byte.
    pub fn table_entry(&self, index: u8) -> u8 {
        self.compute(&[index], 0)
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checksum").field("poly", &0x07u8).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit-at-a-time reference for the same polynomial.
    fn reference(data: &[u8], initial: u8) -> u8 {
        let mut crc = initial;
        for byte in data {
            crc ^= byte;
            for _ in 0..8 {
                if crc & 0x80 != 0 {
                    crc = (crc << 1) ^ 0x07;
                } else {
                    crc <<= 1;
                }
            }
        }
        crc
    }

    #[test]
    fn check_value() {
        let checksum = Checksum::new();
        assert_eq!(checksum.compute(b"123456789", 0), 0xF4);
    }

    #[test]
    fn table_starts_with_known_entries() {
        let checksum = Checksum::new();
        let head: Vec<u8> = (0u8..4).map(|i| checksum.table_entry(i)).collect();
        assert_eq!(head, vec![0x00, 0x07, 0x0E, 0x09]);
    }

    #[test]
    fn matches_bitwise_reference() {
        let checksum = Checksum::new();
        let frames: [&[u8]; 4] = [
            &[],
            &[0x03, 0x3c, 0xa5],
            &[0x02, 0x03, 0x02, 0x07, 0xd0],
            &[0xff; 50],
        ];
        for frame in frames {
            assert_eq!(checksum.compute(frame, 0), reference(frame, 0));
        }
    }

    #[test]
    fn chained_equals_single_pass() {
        let checksum = Checksum::new();
        let command = [0x02, 0x11, 0x02];
        let response = [0x08, 0x7f];

        let joined: Vec<u8> = command.iter().chain(response.iter()).copied().collect();
        let chained = checksum.compute(&response, checksum.compute(&command, 0));
        assert_eq!(chained, checksum.compute(&joined, 0));
    }

    #[test]
    fn deterministic() {
        let checksum = Checksum::new();
        let bytes = [0x7fu8, 0x3b, 0x81];
        assert_eq!(checksum.compute(&bytes, 0), checksum.compute(&bytes, 0));
        assert_eq!(Checksum::new().compute(&bytes, 0), checksum.compute(&bytes, 0));
    }
}
