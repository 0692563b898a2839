//! Chain-level operations built on the register access layer.

pub mod discovery;
pub mod health;
pub mod session;
pub mod topology;

pub use discovery::{search_pack, DiscoveryOutcome, DiscoveryStop};
pub use health::{inspect_chip, program_defaults, ChipHealth, ProtectionRegisters};
pub use session::BusSession;
pub use topology::{probe, CellChannel, CellCountTable, Topology, CELL_MISSING_THRESHOLD};
