//! Chain discovery and addressing.
//!
//! Chips power up unaddressed and listen on the discovery address. Each pass
//! resets the chips the bus can reach (every addressed chip plus the first
//! unaddressed one), then hands out addresses `1..=look_for` in chain order
//! and reads each one back. Passes grow by one chip until the configured chain
//! length verifies, so chips left with stale addresses by a previous session
//! are pulled back into a clean numbering.
//!
//! A verification failure is not an error. Discovery stops and reports how many
//! chips confirmed, along with why it stopped.

use tracing::{debug, error, info, instrument, warn};

use crate::chain::session::BusSession;
use crate::error::{BqError, Result};
use crate::protocol::registers::{addr, cmd, reg};
use crate::transport::BusTransport;

/// Why discovery stopped short of the configured chain length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryStop {
    /// A chip answered with the wrong address-control value.
    VerifyMismatch {
        /// Address that was being verified.
        address: u8,
        /// Value read back.
        received: u8,
    },
    /// Nothing valid answered at the address (checksum did not verify).
    NoResponse {
        /// Address that was being verified.
        address: u8,
    },
    /// The bus exchange itself failed.
    TransportFault {
        /// Address that was being verified.
        address: u8,
        /// Transport error text.
        reason: String,
    },
}

impl std::fmt::Display for DiscoveryStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryStop::VerifyMismatch { address, received } => write!(
                f,
                "chip {address} read back 0x{received:02x}, expected 0x{:02x}",
                address | cmd::ADDR_RQST
            ),
            DiscoveryStop::NoResponse { address } => write!(f, "no response at address {address}"),
            DiscoveryStop::TransportFault { address, reason } => {
                write!(f, "transport fault verifying address {address}: {reason}")
            }
        }
    }
}

/// Result of a discovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    /// Chain length requested.
    pub expected: u8,
    /// Chips whose address verified, numbered `1..=found`.
    pub found: u8,
    /// Set when discovery ended before `expected` chips verified.
    pub stop: Option<DiscoveryStop>,
}

impl DiscoveryOutcome {
    /// Whether every expected chip verified.
    pub fn is_complete(&self) -> bool {
        self.stop.is_none() && self.found == self.expected
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Reset,
    ProbeAddress(u8),
    Verify(u8),
    Done(u8),
    Failed(u8, DiscoveryStop),
}

/// Address up to `devices_used` chips and report how many verified.
///
/// Returns `Err` only for requests that cannot be run at all (a chain length
/// outside `1..=32`) or batch misuse; bus trouble ends discovery with a
/// [`DiscoveryStop`].
#[instrument(skip(session), err)]
pub async fn search_pack<T: BusTransport>(
    session: &mut BusSession<T>,
    devices_used: u8,
) -> Result<DiscoveryOutcome> {
    if devices_used == 0 || devices_used > addr::MAX_CHIPS {
        return Err(BqError::InvalidArgument(format!(
            "chain length {devices_used} outside 1..={}",
            addr::MAX_CHIPS
        )));
    }

    let mut look_for = 0u8;
    let mut state = State::Reset;
    session.begin();

    loop {
        state = match state {
            State::Reset => {
                session.write_register(addr::BROADCAST, reg::RESET, cmd::RESET_COMMAND)?;
                look_for += 1;
                debug!(look_for, "reset pass");
                State::ProbeAddress(1)
            }
            State::ProbeAddress(n) => {
                session.write_register(addr::DISCOVERY, reg::ADDRESS_CONTROL, n)?;
                State::Verify(n)
            }
            State::Verify(n) => match session.flush_and_read(n, reg::ADDRESS_CONTROL, 1).await {
                Ok(value) if value == (n | cmd::ADDR_RQST) as u16 => {
                    if n < look_for {
                        State::ProbeAddress(n + 1)
                    } else if n < devices_used {
                        State::Reset
                    } else {
                        State::Done(n)
                    }
                }
                Ok(value) => State::Failed(
                    n - 1,
                    DiscoveryStop::VerifyMismatch {
                        address: n,
                        received: value as u8,
                    },
                ),
                Err(BqError::ChecksumMismatch { .. }) => {
                    State::Failed(n - 1, DiscoveryStop::NoResponse { address: n })
                }
                Err(BqError::Transport(e)) => State::Failed(
                    n - 1,
                    DiscoveryStop::TransportFault {
                        address: n,
                        reason: format!("{e:#}"),
                    },
                ),
                Err(e) => return Err(e),
            },
            State::Done(found) => {
                info!(found, "discovery complete");
                return Ok(DiscoveryOutcome {
                    expected: devices_used,
                    found,
                    stop: None,
                });
            }
            State::Failed(found, stop) => {
                match &stop {
                    DiscoveryStop::TransportFault { .. } => error!(found, %stop, "discovery aborted"),
                    _ => warn!(found, %stop, "discovery stopped"),
                }
                return Ok(DiscoveryOutcome {
                    expected: devices_used,
                    found,
                    stop: Some(stop),
                });
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::BusRecord;
    use crate::transport::{SimulatedChain, SimulatedChip};

    fn chain_of(k: usize) -> SimulatedChain {
        SimulatedChain::new((0..k).map(|_| SimulatedChip::new()).collect())
    }

    #[tokio::test]
    async fn full_chain_is_addressed_in_order() {
        let chain = chain_of(4);
        let mut session = BusSession::new(chain.clone());

        let outcome = search_pack(&mut session, 4).await.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.found, 4);
        for i in 0..4 {
            assert_eq!(chain.chip(i).unwrap().address(), i as u8 + 1);
        }
    }

    #[tokio::test]
    async fn short_chain_reports_what_answered() {
        for k in 1..=3 {
            let chain = chain_of(k);
            let mut session = BusSession::new(chain);

            let outcome = search_pack(&mut session, 4).await.unwrap();
            assert_eq!(outcome.found, k as u8);
            assert_eq!(
                outcome.stop,
                Some(DiscoveryStop::NoResponse {
                    address: k as u8 + 1
                })
            );
            assert!(!outcome.is_complete());
        }
    }

    #[tokio::test]
    async fn stale_addresses_are_renumbered() {
        let chain = SimulatedChain::new(vec![
            SimulatedChip::new(),
            SimulatedChip::new().with_stale_address(9),
            SimulatedChip::new().with_stale_address(2),
        ]);
        let mut session = BusSession::new(chain.clone());

        let outcome = search_pack(&mut session, 3).await.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(chain.chip(1).unwrap().address(), 2);
        assert_eq!(chain.chip(2).unwrap().address(), 3);
    }

    #[tokio::test]
    async fn first_pass_is_one_exchange() {
        let chain = chain_of(1);
        let mut session = BusSession::new(chain.clone());
        search_pack(&mut session, 1).await.unwrap();

        let transfers = chain.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(
            transfers[0],
            vec![
                BusRecord::Write {
                    address: addr::BROADCAST,
                    register: reg::RESET,
                    data: cmd::RESET_COMMAND
                },
                BusRecord::Write {
                    address: addr::DISCOVERY,
                    register: reg::ADDRESS_CONTROL,
                    data: 1
                },
                BusRecord::Read {
                    address: 1,
                    register: reg::ADDRESS_CONTROL,
                    count: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn transport_fault_is_reported_not_raised() {
        let chain = chain_of(2);
        let mut session = BusSession::new(chain.clone());
        chain.trigger_failure();

        let outcome = search_pack(&mut session, 2).await.unwrap();
        assert_eq!(outcome.found, 0);
        assert!(matches!(
            outcome.stop,
            Some(DiscoveryStop::TransportFault { address: 1, .. })
        ));
    }

    #[tokio::test]
    async fn chain_length_must_be_addressable() {
        let mut session = BusSession::new(chain_of(1));
        assert!(matches!(
            search_pack(&mut session, 0).await,
            Err(BqError::InvalidArgument(_))
        ));
        assert!(search_pack(&mut session, 33).await.is_err());
    }
}
