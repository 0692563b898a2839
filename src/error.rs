//! Error types for the pack monitor.
//!
//! `BqError` is the single error type returned by every fallible operation in the
//! crate. Using the `thiserror` crate, it separates the failure modes a caller
//! must react to from the degraded-but-usable conditions found while attaching.
//!
//! ## Error Hierarchy
//!
//! - **`Transport`**: the bus exchange itself failed. The current cycle aborts.
//! - **`ChecksumMismatch`**: a chip answered but the trailing CRC-8 disagrees with
//!   the bytes we clocked in. The read is abandoned and no value is returned.
//! - **`Overflow`**: a batch would exceed its operation or byte budget. This is a
//!   programming error in the caller's batching.
//! - **`InvalidArgument`**: a request the chip cannot express (e.g. a 3-byte read).
//! - **`Configuration`** / **`Config`**: semantic and parse errors in the pack
//!   configuration. Initialization refuses to proceed.
//! - **`NotAttached`**: acquisition was requested before the chain was attached.
//! - **`Frame`**: a telemetry frame handed to the decoder does not parse.
//!
//! Conditions that only degrade operation (fewer chips than configured, a chip
//! with fewer cells than configured) are not errors. They are reported as
//! [`Discrepancy`] values and logged.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, BqError>;

/// Primary error type for bus, protocol and configuration failures.
#[derive(Error, Debug)]
pub enum BqError {
    /// The transport could not complete the bus exchange.
    #[error("Bus transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// Received checksum disagrees with the one computed over the exchange.
    #[error(
        "Checksum mismatch reading chip {address} register 0x{register:02x}: computed 0x{computed:02x}, received 0x{received:02x}"
    )]
    ChecksumMismatch {
        /// Chip address the read was sent to.
        address: u8,
        /// Register that was read.
        register: u8,
        /// CRC-8 computed over command and response bytes.
        computed: u8,
        /// CRC-8 byte returned by the chip.
        received: u8,
    },

    /// The batch has no room left for the requested operation.
    #[error("Transaction batch overflow: {operations} operations, {bytes} bytes queued")]
    Overflow {
        /// Operations already queued.
        operations: usize,
        /// Bytes already used in the outbound buffer.
        bytes: usize,
    },

    /// The request cannot be expressed on the bus.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration values are present but unusable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Acquisition requested while no chain is attached.
    #[error("Pack is not attached")]
    NotAttached,

    /// A telemetry frame is truncated, inconsistent or fails its checksum.
    #[error("Malformed telemetry frame: {0}")]
    Frame(String),
}

impl BqError {
    /// Whether the error aborts the operation in progress.
    ///
    /// Only bus-level failures are fatal to a cycle; everything else is a
    /// caller or configuration mistake surfaced before any bus traffic.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BqError::Transport(_) | BqError::ChecksumMismatch { .. }
        )
    }
}

impl From<figment::Error> for BqError {
    fn from(value: figment::Error) -> Self {
        BqError::Config(Box::new(value))
    }
}

/// A recoverable disagreement between the configured pack and the hardware.
///
/// Discrepancies never abort attachment. The monitor adopts what it found on
/// the bus and records what it corrected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Discrepancy {
    /// Fewer chips verified during discovery than the configuration expects.
    #[error("Expected {expected} chips, found {found}")]
    DiscoveryIncomplete {
        /// Configured chain length.
        expected: u8,
        /// Chips that verified their address.
        found: u8,
    },

    /// A chip reports a different number of populated cells than configured.
    #[error("Chip {chip} expected {expected} cells, found {found}")]
    TopologyMismatch {
        /// Chip address.
        chip: u8,
        /// Configured cell count before correction.
        expected: u8,
        /// Cells detected on the bus.
        found: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_errors_are_fatal() {
        let transport = BqError::Transport(anyhow::anyhow!("spi timeout"));
        assert!(transport.is_fatal());

        let crc = BqError::ChecksumMismatch {
            address: 1,
            register: 0x00,
            computed: 0x12,
            received: 0x34,
        };
        assert!(crc.is_fatal());
    }

    #[test]
    fn caller_errors_are_not_fatal() {
        assert!(!BqError::Overflow {
            operations: 10,
            bytes: 40
        }
        .is_fatal());
        assert!(!BqError::InvalidArgument("width 3".into()).is_fatal());
        assert!(!BqError::NotAttached.is_fatal());
    }

    #[test]
    fn checksum_message_names_chip_and_register() {
        let err = BqError::ChecksumMismatch {
            address: 3,
            register: 0x21,
            computed: 0xab,
            received: 0x00,
        };
        let msg = err.to_string();
        assert!(msg.contains("chip 3"));
        assert!(msg.contains("0x21"));
        assert!(msg.contains("0xab"));
    }

    #[test]
    fn discrepancy_display() {
        let d = Discrepancy::TopologyMismatch {
            chip: 2,
            expected: 4,
            found: 3,
        };
        assert_eq!(d.to_string(), "Chip 2 expected 4 cells, found 3");

        let d = Discrepancy::DiscoveryIncomplete {
            expected: 4,
            found: 2,
        };
        assert_eq!(d.to_string(), "Expected 4 chips, found 2");
    }
}
