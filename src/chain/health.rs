//! Chain programming and per-chip fault/alert inspection.

use tracing::{info, instrument, warn};

use crate::chain::session::BusSession;
use crate::config::ProtectionConfig;
use crate::error::Result;
use crate::protocol::registers::{
    addr, cmd, encode_delay_ms, encode_overvoltage, encode_undervoltage, reg, AdcControl,
    AlertStatus, DeviceStatus, FaultStatus, IoControl,
};
use crate::transport::BusTransport;

/// Encoded protection register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionRegisters {
    /// CONFIG_COV
    pub overvoltage: u8,
    /// CONFIG_UV
    pub undervoltage: u8,
    /// CONFIG_COVT
    pub overvoltage_delay: u8,
}

impl ProtectionRegisters {
    /// Encode configured thresholds, rejecting values the chip cannot hold.
    pub fn encode(config: &ProtectionConfig) -> Result<Self> {
        Ok(Self {
            overvoltage: encode_overvoltage(config.overvoltage_mv)?,
            undervoltage: encode_undervoltage(config.undervoltage_mv)?,
            overvoltage_delay: encode_delay_ms(config.overvoltage_delay_ms)?,
        })
    }
}

/// Broadcast the operating configuration to every chip in one exchange.
///
/// Enables all six cell channels and both thermistors, starts a conversion so
/// channel readings are fresh for the topology probe, and writes the protection
/// registers, each behind its own SHDW_CTRL unlock.
#[instrument(skip(session), err)]
pub async fn program_defaults<T: BusTransport>(
    session: &mut BusSession<T>,
    protection: ProtectionRegisters,
) -> Result<()> {
    let adc = AdcControl::CELL_SEL_6 | AdcControl::TS1 | AdcControl::TS2;
    let io = IoControl::TS1 | IoControl::TS2;

    session.begin();
    session.write_register(addr::BROADCAST, reg::ADC_CONTROL, adc.bits())?;
    session.write_register(addr::BROADCAST, reg::IO_CONTROL, io.bits())?;
    session.write_register(addr::BROADCAST, reg::ADC_CONVERT, cmd::ADC_CONV)?;
    for (register, value) in [
        (reg::CONFIG_COV, protection.overvoltage),
        (reg::CONFIG_UV, protection.undervoltage),
        (reg::CONFIG_COVT, protection.overvoltage_delay),
    ] {
        session.write_register(addr::BROADCAST, reg::SHDW_CTRL, cmd::SHADOW_ENABLE)?;
        session.write_register(addr::BROADCAST, register, value)?;
    }
    session.flush().await
}

/// What one chip reported during inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipHealth {
    /// Chip address.
    pub address: u8,
    /// DEVICE_STATUS at inspection time.
    pub status: DeviceStatus,
    /// FAULT_STATUS, read and cleared when the FAULT bit was set.
    pub fault: Option<FaultStatus>,
    /// ALERT_STATUS, read and cleared when the ALERT bit was set.
    pub alert: Option<AlertStatus>,
    /// COV_FAULT, read on an over-voltage fault.
    pub cov_fault: Option<u8>,
    /// CONFIG_COV, read on an over-voltage fault.
    pub cov_threshold: Option<u8>,
    /// ADDRESS_CONTROL, read on an alert with AR clear.
    pub address_control: Option<u8>,
}

impl ChipHealth {
    /// Whether the chip has accepted its address.
    pub fn is_addressed(&self) -> bool {
        self.status.contains(DeviceStatus::ADDR_RQST)
    }

    /// Whether a fault or alert was latched.
    pub fn needs_attention(&self) -> bool {
        self.fault.is_some_and(|f| !f.is_empty()) || self.alert.is_some_and(|a| !a.is_empty())
    }

    /// Human-readable names of every latched condition.
    pub fn conditions(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if let Some(fault) = self.fault {
            for (flag, name) in [
                (FaultStatus::POR, "power-on reset"),
                (FaultStatus::COV, "cell over-voltage"),
                (FaultStatus::CUV, "cell under-voltage"),
                (FaultStatus::CRC, "crc error"),
                (FaultStatus::FORCE, "forced fault"),
                (FaultStatus::I_FAULT, "internal fault"),
            ] {
                if fault.contains(flag) {
                    out.push(name);
                }
            }
        }
        if let Some(alert) = self.alert {
            for (flag, name) in [
                (AlertStatus::OT1, "over-temperature 1"),
                (AlertStatus::OT2, "over-temperature 2"),
                (AlertStatus::SLEEP, "sleep"),
                (AlertStatus::TSD, "thermal shutdown"),
                (AlertStatus::FORCE, "forced alert"),
                (AlertStatus::ECC_ERR, "eprom ecc error"),
                (AlertStatus::PARITY, "group 3 parity"),
                (AlertStatus::AR, "address not set"),
            ] {
                if alert.contains(flag) {
                    out.push(name);
                }
            }
        }
        out
    }
}

/// Read a chip's status and clear any latched fault or alert.
///
/// Latched bits are cleared by writing the read value back and then zero.
/// Only observes and clears; nothing here feeds the telemetry frame.
#[instrument(skip(session), err)]
pub async fn inspect_chip<T: BusTransport>(
    session: &mut BusSession<T>,
    address: u8,
) -> Result<ChipHealth> {
    session.begin();
    let status = DeviceStatus::from_bits_retain(session.read_byte(address, reg::DEVICE_STATUS).await?);
    info!(chip = address, status = format_args!("0x{:02x}", status.bits()), "chip status");

    let mut health = ChipHealth {
        address,
        status,
        fault: None,
        alert: None,
        cov_fault: None,
        cov_threshold: None,
        address_control: None,
    };

    if !status.contains(DeviceStatus::ADDR_RQST) {
        warn!(chip = address, "address not assigned");
    }

    if status.contains(DeviceStatus::FAULT) {
        let fault = FaultStatus::from_bits_retain(clear_latched(session, address, reg::FAULT_STATUS).await?);
        if fault.contains(FaultStatus::POR) {
            info!(chip = address, "power on");
        }
        if fault.contains(FaultStatus::COV) {
            let cov = session.read_byte(address, reg::COV_FAULT).await?;
            let threshold = session.read_byte(address, reg::CONFIG_COV).await?;
            warn!(chip = address, cov_fault = cov, config_cov = threshold, "cell over voltage");
            health.cov_fault = Some(cov);
            health.cov_threshold = Some(threshold);
        }
        health.fault = Some(fault);
    }

    if status.contains(DeviceStatus::ALERT) {
        let alert = AlertStatus::from_bits_retain(clear_latched(session, address, reg::ALERT_STATUS).await?);
        if !alert.contains(AlertStatus::AR) {
            let address_control = session.read_byte(address, reg::ADDRESS_CONTROL).await?;
            info!(chip = address, address_control, "address register");
            health.address_control = Some(address_control);
        }
        health.alert = Some(alert);
    }

    Ok(health)
}

async fn clear_latched<T: BusTransport>(
    session: &mut BusSession<T>,
    address: u8,
    register: u8,
) -> Result<u8> {
    let value = session.read_byte(address, register).await?;
    session.write_register(address, register, value)?;
    session.write_register(address, register, 0)?;
    session.flush().await?;
    info!(chip = address, register, value = format_args!("0x{value:02x}"), "cleared latched status");
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::BusRecord;
    use crate::transport::{SimulatedChain, SimulatedChip};
    use tracing_test::traced_test;

    fn protection() -> ProtectionRegisters {
        ProtectionRegisters::encode(&ProtectionConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn defaults_go_out_as_one_broadcast_batch() {
        let chain = SimulatedChain::new(vec![SimulatedChip::new().with_stale_address(1)]);
        let mut session = BusSession::new(chain.clone());

        program_defaults(&mut session, protection()).await.unwrap();

        let transfers = chain.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].len(), 9);
        assert!(transfers[0]
            .iter()
            .all(|op| matches!(op, BusRecord::Write { address: addr::BROADCAST, .. })));

        let chip = chain.chip(0).unwrap();
        assert_eq!(chip.register(reg::ADC_CONTROL), 0x35);
        assert_eq!(chip.register(reg::IO_CONTROL), 0x03);
        assert_eq!(chip.register(reg::CONFIG_COV), 0x1E);
        assert_eq!(chip.register(reg::CONFIG_UV), 0x17);
        assert_eq!(chip.register(reg::CONFIG_COVT), 0x81);
    }

    #[tokio::test]
    #[traced_test]
    async fn fault_is_read_and_cleared() {
        let chain = SimulatedChain::new(vec![SimulatedChip::new()
            .with_stale_address(1)
            .with_fault((FaultStatus::POR | FaultStatus::COV).bits())
            .with_cell_faults(0x04, 0)]);
        let mut session = BusSession::new(chain.clone());

        let health = inspect_chip(&mut session, 1).await.unwrap();

        assert!(health.is_addressed());
        assert_eq!(health.fault, Some(FaultStatus::POR | FaultStatus::COV));
        assert_eq!(health.cov_fault, Some(0x04));
        assert!(health.conditions().contains(&"cell over-voltage"));
        assert_eq!(chain.chip(0).unwrap().register(reg::FAULT_STATUS), 0);
        assert!(logs_contain("cell over voltage"));
    }

    #[tokio::test]
    async fn alert_without_ar_reads_the_address_register() {
        let chain = SimulatedChain::new(vec![SimulatedChip::new()
            .with_stale_address(3)
            .with_alert(AlertStatus::OT1.bits())]);
        let mut session = BusSession::new(chain.clone());

        let health = inspect_chip(&mut session, 3).await.unwrap();

        assert_eq!(health.alert, Some(AlertStatus::OT1));
        assert_eq!(health.address_control, Some(0x83));
        assert!(health.fault.is_none());
        assert_eq!(chain.chip(0).unwrap().register(reg::ALERT_STATUS), 0);
    }

    #[tokio::test]
    async fn quiet_chip_needs_no_attention() {
        let chain = SimulatedChain::new(vec![SimulatedChip::new().with_stale_address(1)]);
        let mut session = BusSession::new(chain.clone());

        let health = inspect_chip(&mut session, 1).await.unwrap();
        assert!(!health.needs_attention());
        assert!(health.conditions().is_empty());
        assert_eq!(chain.transfers().len(), 1);
    }
}
