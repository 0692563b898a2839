//! Register map and bit definitions for the bq76pl536.

use bitflags::bitflags;

use crate::error::{BqError, Result};

/// Special bus addresses.
pub mod addr {
    /// Address an unaddressed chip answers to during discovery.
    pub const DISCOVERY: u8 = 0x00;
    /// Every chip on the chain accepts writes to this address.
    pub const BROADCAST: u8 = 0x3F;
    /// Highest chain length the protocol supports.
    pub const MAX_CHIPS: u8 = 32;
}

/// Register offsets.
pub mod reg {
    /// Status register (R)
    pub const DEVICE_STATUS: u8 = 0x00;
    /// GPAI measurement (R, 2 bytes)
    pub const GPAI: u8 = 0x01;
    /// Cell 1 voltage (R, 2 bytes)
    pub const VCELL1: u8 = 0x03;
    /// Cell 2 voltage (R, 2 bytes)
    pub const VCELL2: u8 = 0x05;
    /// Cell 3 voltage (R, 2 bytes)
    pub const VCELL3: u8 = 0x07;
    /// Cell 4 voltage (R, 2 bytes)
    pub const VCELL4: u8 = 0x09;
    /// Cell 5 voltage (R, 2 bytes)
    pub const VCELL5: u8 = 0x0B;
    /// Cell 6 voltage (R, 2 bytes)
    pub const VCELL6: u8 = 0x0D;
    /// TS1+ to TS1- differential voltage (R, 2 bytes)
    pub const TEMPERATURE1: u8 = 0x0F;
    /// TS2+ to TS2- differential voltage (R, 2 bytes)
    pub const TEMPERATURE2: u8 = 0x11;
    /// Source of the ALERT signal (R/W)
    pub const ALERT_STATUS: u8 = 0x20;
    /// Source of the FAULT signal (R/W)
    pub const FAULT_STATUS: u8 = 0x21;
    /// Per-cell over-voltage fault state (R)
    pub const COV_FAULT: u8 = 0x22;
    /// Per-cell under-voltage fault state (R)
    pub const CUV_FAULT: u8 = 0x23;
    /// Parity result A (R)
    pub const PRESULT_A: u8 = 0x24;
    /// Parity result B (R)
    pub const PRESULT_B: u8 = 0x25;
    /// ADC measurement control (R/W)
    pub const ADC_CONTROL: u8 = 0x30;
    /// I/O pin control (R/W)
    pub const IO_CONTROL: u8 = 0x31;
    /// Cell balance control (R/W)
    pub const CB_CTRL: u8 = 0x32;
    /// Cell balance timeout (R/W)
    pub const CB_TIME: u8 = 0x33;
    /// ADC conversion start (R/W)
    pub const ADC_CONVERT: u8 = 0x34;
    /// Write access gate for the EPROM-backed group 3 registers
    pub const SHDW_CTRL: u8 = 0x3A;
    /// Address register (R/W)
    pub const ADDRESS_CONTROL: u8 = 0x3B;
    /// Reset control (W)
    pub const RESET: u8 = 0x3C;
    /// Test mode select (R/W)
    pub const TEST_SELECT: u8 = 0x3D;
    /// EPROM write enable (R/W)
    pub const E_EN: u8 = 0x3F;
    /// Default function configuration (EPROM)
    pub const FUNCTION_CONFIG: u8 = 0x40;
    /// I/O pin configuration (EPROM)
    pub const IO_CONFIG: u8 = 0x41;
    /// Over-voltage set point (EPROM)
    pub const CONFIG_COV: u8 = 0x42;
    /// Over-voltage time-delay filter (EPROM)
    pub const CONFIG_COVT: u8 = 0x43;
    /// Under-voltage set point (EPROM)
    pub const CONFIG_UV: u8 = 0x44;
    /// Under-voltage time-delay filter (EPROM)
    pub const CONFIG_CUVT: u8 = 0x45;
    /// Over-temperature thresholds (EPROM)
    pub const CONFIG_OT: u8 = 0x46;
    /// Over-temperature time-delay filter (EPROM)
    pub const CONFIG_OTT: u8 = 0x47;

    /// The six cell-voltage channels in chip order.
    pub const VCELLS: [u8; 6] = [VCELL1, VCELL2, VCELL3, VCELL4, VCELL5, VCELL6];
}

/// Command values written to control registers.
pub mod cmd {
    /// Value written to RESET to reset the addressable chips.
    pub const RESET_COMMAND: u8 = 0xA5;
    /// ADC_CONVERT: start a conversion.
    pub const ADC_CONV: u8 = 0x01;
    /// SHDW_CTRL: unlock the next group 3 write.
    pub const SHADOW_ENABLE: u8 = 0x35;
    /// ADDRESS_CONTROL: set once the chip has accepted an address.
    pub const ADDR_RQST: u8 = 0x80;
}

bitflags! {
    /// DEVICE_STATUS (0x00).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        /// Address has been assigned.
        const ADDR_RQST = 0x80;
        /// Details in FAULT_STATUS.
        const FAULT = 0x40;
        /// Details in ALERT_STATUS.
        const ALERT = 0x20;
        /// Single-bit EPROM error corrected.
        const ECC_COR = 0x08;
        /// Under-voltage lockout.
        const UVLO = 0x04;
        /// Cell balance timer running.
        const CBT = 0x02;
        /// Conversion data ready.
        const DRDY = 0x01;
    }
}

bitflags! {
    /// FAULT_STATUS (0x21).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultStatus: u8 {
        /// Internal register consistency check failed.
        const I_FAULT = 0x20;
        /// Fault forced by the host.
        const FORCE = 0x10;
        /// Power-on reset.
        const POR = 0x08;
        /// CRC error on a received exchange.
        const CRC = 0x04;
        /// Cell under-voltage.
        const CUV = 0x02;
        /// Cell over-voltage.
        const COV = 0x01;
    }
}

bitflags! {
    /// ALERT_STATUS (0x20).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AlertStatus: u8 {
        /// Address not set.
        const AR = 0x80;
        /// Group 3 protected registers invalid.
        const PARITY = 0x40;
        /// OTP-EPROM registers invalid.
        const ECC_ERR = 0x20;
        /// Alert forced by the host.
        const FORCE = 0x10;
        /// Thermal shutdown.
        const TSD = 0x08;
        /// Sleep was activated.
        const SLEEP = 0x04;
        /// Over-temperature on sensor 2.
        const OT2 = 0x02;
        /// Over-temperature on sensor 1.
        const OT1 = 0x01;
    }
}

bitflags! {
    /// ADC_CONTROL (0x30).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AdcControl: u8 {
        /// Keep the ADC powered between conversions.
        const ADC_ON = 0x40;
        /// Convert thermistor 2.
        const TS2 = 0x20;
        /// Convert thermistor 1.
        const TS1 = 0x10;
        /// Convert the general-purpose analog input.
        const GPAI = 0x08;
        /// Cell select field, low three bits; 0x05 selects cells 1-6.
        const CELL_SEL_6 = 0x05;
    }
}

bitflags! {
    /// IO_CONTROL (0x31).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoControl: u8 {
        /// Connect the AUX output to REG50.
        const AUX = 0x80;
        /// GPIO output level.
        const GPIO_OUT = 0x40;
        /// GPIO input level (read only).
        const GPIO_IN = 0x20;
        /// Enter sleep mode.
        const SLEEP = 0x04;
        /// Connect thermistor 2 to REG50.
        const TS2 = 0x02;
        /// Connect thermistor 1 to REG50.
        const TS1 = 0x01;
    }
}

/// CONFIG_COVT/CONFIG_CUVT: set for milliseconds, clear for microseconds.
pub const DELAY_MS_UNITS: u8 = 0x80;

/// Encode an over-voltage threshold for CONFIG_COV.
pub fn encode_overvoltage(millivolts: u16) -> Result<u8> {
    if !(2000..=5150).contains(&millivolts) || millivolts % 50 != 0 {
        return Err(BqError::Configuration(format!(
            "over-voltage threshold {millivolts} mV must be 2000-5150 mV in 50 mV steps"
        )));
    }
    Ok(((millivolts - 2000) / 50) as u8)
}

/// Encode an under-voltage threshold for CONFIG_UV.
pub fn encode_undervoltage(millivolts: u16) -> Result<u8> {
    if !(700..=3800).contains(&millivolts) || millivolts % 100 != 0 {
        return Err(BqError::Configuration(format!(
            "under-voltage threshold {millivolts} mV must be 700-3800 mV in 100 mV steps"
        )));
    }
    Ok(((millivolts - 700) / 100) as u8)
}

/// Encode a protection filter delay in milliseconds for CONFIG_COVT/CUVT.
pub fn encode_delay_ms(millis: u16) -> Result<u8> {
    if millis > 3100 || millis % 100 != 0 {
        return Err(BqError::Configuration(format!(
            "protection delay {millis} ms must be 0-3100 ms in 100 ms steps"
        )));
    }
    Ok(DELAY_MS_UNITS | (millis / 100) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_encodings_match_datasheet_table() {
        assert_eq!(encode_overvoltage(2000).unwrap(), 0x00);
        assert_eq!(encode_overvoltage(3500).unwrap(), 0x1E);
        assert_eq!(encode_overvoltage(4200).unwrap(), 0x2C);
        assert_eq!(encode_overvoltage(5150).unwrap(), 0x3F);

        assert_eq!(encode_undervoltage(700).unwrap(), 0x00);
        assert_eq!(encode_undervoltage(3000).unwrap(), 0x17);

        assert_eq!(encode_delay_ms(100).unwrap(), 0x81);
        assert_eq!(encode_delay_ms(0).unwrap(), 0x80);
    }

    #[test]
    fn thresholds_outside_the_encodable_range_are_rejected() {
        assert!(encode_overvoltage(1950).is_err());
        assert!(encode_overvoltage(3525).is_err());
        assert!(encode_undervoltage(3900).is_err());
        assert!(encode_undervoltage(3050).is_err());
        assert!(encode_delay_ms(3200).is_err());
        assert!(encode_delay_ms(150).is_err());
    }

    #[test]
    fn status_bits_decode() {
        let status = DeviceStatus::from_bits_retain(0xE1);
        assert!(status.contains(DeviceStatus::ADDR_RQST | DeviceStatus::DRDY));
        assert!(status.contains(DeviceStatus::FAULT));
        assert!(status.contains(DeviceStatus::ALERT));

        let fault = FaultStatus::from_bits_retain(0x09);
        assert!(fault.contains(FaultStatus::POR));
        assert!(fault.contains(FaultStatus::COV));
        assert!(!fault.contains(FaultStatus::CRC));
    }

    #[test]
    fn default_control_values() {
        let adc = AdcControl::CELL_SEL_6 | AdcControl::TS1 | AdcControl::TS2;
        assert_eq!(adc.bits(), 0x35);
        assert_eq!((IoControl::TS1 | IoControl::TS2).bits(), 0x03);
    }

    #[test]
    fn vcell_channels_are_two_apart() {
        for pair in reg::VCELLS.windows(2) {
            assert_eq!(pair[1] - pair[0], 2);
        }
    }
}
