//! Telemetry acquisition and frame encoding.
//!
//! One cycle starts a conversion on every chip, waits for chip 1 to report
//! data ready, then reads every populated cell channel and each chip's
//! thermistors and status registers into a [`TelemetryFrame`].
//!
//! Wire layout of an encoded frame:
//!
//! ```text
//! [cell_count] [voltage; cell_count] [chip_count]
//! per chip: [expected_cells] [temp1 i8] [temp2 i8] [device_status]
//!           [fault_status] [alert_status] [undervoltage_fault] [overvoltage_fault]
//! [crc8 over everything above]
//! ```

use tracing::{debug, info, instrument};

use crate::chain::session::BusSession;
use crate::chain::topology::{CellCountTable, Topology};
use crate::error::{BqError, Result};
use crate::protocol::crc::Checksum;
use crate::protocol::registers::{addr, cmd, reg, DeviceStatus};
use crate::transport::BusTransport;

/// Status reads of chip 1 before a cycle gives up waiting for data.
pub const READY_POLL_ATTEMPTS: usize = 6;

/// Bytes each chip contributes to a frame.
pub const CHIP_RECORD_LEN: usize = 8;

/// Volts represented by one unit of a voltage byte.
pub const VOLTS_PER_UNIT: f64 = 0.02;

/// Scale a raw cell reading to one byte spanning 0 to 5.10 V.
///
/// Readings above 5.10 V saturate at 255.
pub fn scale_voltage(raw: u16) -> u8 {
    ((raw as u32 * 6250) / 327_660).min(u8::MAX as u32) as u8
}

/// Convert a raw thermistor reading to whole degrees Celsius.
///
/// Division truncates toward zero; results outside `i8` saturate.
pub fn convert_temperature(raw: u16) -> i8 {
    ((raw as i32 - 2048) / 120).clamp(i8::MIN as i32, i8::MAX as i32) as i8
}

/// Per-chip section of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipTelemetry {
    /// Cells the chip is expected to carry (after topology correction).
    pub expected_cells: u8,
    /// TS1 temperature in °C.
    pub temperature1: i8,
    /// TS2 temperature in °C.
    pub temperature2: i8,
    /// DEVICE_STATUS.
    pub device_status: u8,
    /// FAULT_STATUS.
    pub fault_status: u8,
    /// ALERT_STATUS.
    pub alert_status: u8,
    /// CUV_FAULT.
    pub undervoltage_fault: u8,
    /// COV_FAULT.
    pub overvoltage_fault: u8,
}

impl ChipTelemetry {
    fn to_bytes(self) -> [u8; CHIP_RECORD_LEN] {
        [
            self.expected_cells,
            self.temperature1 as u8,
            self.temperature2 as u8,
            self.device_status,
            self.fault_status,
            self.alert_status,
            self.undervoltage_fault,
            self.overvoltage_fault,
        ]
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            expected_cells: bytes[0],
            temperature1: bytes[1] as i8,
            temperature2: bytes[2] as i8,
            device_status: bytes[3],
            fault_status: bytes[4],
            alert_status: bytes[5],
            undervoltage_fault: bytes[6],
            overvoltage_fault: bytes[7],
        }
    }

    /// DEVICE_STATUS decoded.
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.device_status)
    }
}

/// One acquisition snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryFrame {
    /// Scaled cell voltages in topology order.
    pub voltages: Vec<u8>,
    /// Chips in address order.
    pub chips: Vec<ChipTelemetry>,
}

impl TelemetryFrame {
    /// Encoded size in bytes, checksum included.
    pub fn encoded_len(&self) -> usize {
        1 + self.voltages.len() + 1 + self.chips.len() * CHIP_RECORD_LEN + 1
    }

    /// Serialize to the wire layout with a trailing checksum.
    pub fn encode(&self, checksum: &Checksum) -> Result<Vec<u8>> {
        let cell_count = u8::try_from(self.voltages.len())
            .map_err(|_| BqError::Frame(format!("{} cells do not fit a count byte", self.voltages.len())))?;
        let chip_count = u8::try_from(self.chips.len())
            .map_err(|_| BqError::Frame(format!("{} chips do not fit a count byte", self.chips.len())))?;

        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(cell_count);
        out.extend_from_slice(&self.voltages);
        out.push(chip_count);
        for chip in &self.chips {
            out.extend_from_slice(&chip.to_bytes());
        }
        out.push(checksum.compute(&out, 0));
        Ok(out)
    }

    /// Parse and verify an encoded frame.
    pub fn decode(bytes: &[u8], checksum: &Checksum) -> Result<Self> {
        let (body, crc) = match bytes.split_last() {
            Some((crc, body)) if !body.is_empty() => (body, *crc),
            _ => return Err(BqError::Frame("frame is empty".into())),
        };
        let computed = checksum.compute(body, 0);
        if computed != crc {
            return Err(BqError::Frame(format!(
                "checksum 0x{crc:02x} does not match computed 0x{computed:02x}"
            )));
        }

        let cell_count = body[0] as usize;
        let voltages = body
            .get(1..1 + cell_count)
            .ok_or_else(|| BqError::Frame(format!("truncated in {cell_count} voltages")))?
            .to_vec();
        let chip_count = *body
            .get(1 + cell_count)
            .ok_or_else(|| BqError::Frame("missing chip count".into()))? as usize;

        let records = &body[2 + cell_count..];
        if records.len() != chip_count * CHIP_RECORD_LEN {
            return Err(BqError::Frame(format!(
                "{} bytes of chip records for {chip_count} chips",
                records.len()
            )));
        }
        let chips = records
            .chunks_exact(CHIP_RECORD_LEN)
            .map(ChipTelemetry::from_bytes)
            .collect();

        Ok(Self { voltages, chips })
    }

    /// Cell voltages in volts.
    pub fn cell_volts(&self) -> impl Iterator<Item = f64> + '_ {
        self.voltages.iter().map(|v| *v as f64 * VOLTS_PER_UNIT)
    }

    /// Total pack voltage in volts.
    pub fn pack_volts(&self) -> f64 {
        self.cell_volts().sum()
    }
}

/// Run one acquisition cycle.
///
/// Returns `Ok(None)` when chip 1 has not reported data ready after
/// [`READY_POLL_ATTEMPTS`] status reads. Bus and checksum failures abort the
/// cycle with an error.
#[instrument(skip_all, fields(cells = topology.cell_count(), chips = topology.chip_count()), err)]
pub async fn acquire<T: BusTransport>(
    session: &mut BusSession<T>,
    topology: &Topology,
    expected_cells: &CellCountTable,
) -> Result<Option<TelemetryFrame>> {
    session.begin();
    session.write_register(addr::BROADCAST, reg::ADC_CONVERT, cmd::ADC_CONV)?;
    session.flush().await?;

    let mut ready = false;
    for attempt in 1..=READY_POLL_ATTEMPTS {
        let status = DeviceStatus::from_bits_retain(session.read_byte(1, reg::DEVICE_STATUS).await?);
        debug!(attempt, status = status.bits(), "waiting for conversion");
        if status.contains(DeviceStatus::DRDY) {
            ready = true;
            break;
        }
    }
    if !ready {
        info!(attempts = READY_POLL_ATTEMPTS, "conversion not ready, giving up");
        return Ok(None);
    }

    let mut voltages = Vec::with_capacity(topology.cell_count());
    for channel in topology.channels() {
        let raw = session.read_register(channel.chip, channel.register, 2).await?;
        voltages.push(scale_voltage(raw));
    }

    let mut chips = Vec::with_capacity(topology.chip_count() as usize);
    for chip in 1..=topology.chip_count() {
        let ts1 = session.read_register(chip, reg::TEMPERATURE1, 2).await?;
        let ts2 = session.read_register(chip, reg::TEMPERATURE2, 2).await?;
        debug!(chip, ts1, ts2, "raw temperature");

        chips.push(ChipTelemetry {
            expected_cells: expected_cells.get(chip),
            temperature1: convert_temperature(ts1),
            temperature2: convert_temperature(ts2),
            device_status: session.read_byte(chip, reg::DEVICE_STATUS).await?,
            fault_status: session.read_byte(chip, reg::FAULT_STATUS).await?,
            alert_status: session.read_byte(chip, reg::ALERT_STATUS).await?,
            undervoltage_fault: session.read_byte(chip, reg::CUV_FAULT).await?,
            overvoltage_fault: session.read_byte(chip, reg::COV_FAULT).await?,
        });
    }

    Ok(Some(TelemetryFrame { voltages, chips }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> TelemetryFrame {
        TelemetryFrame {
            voltages: vec![185, 184, 186],
            chips: vec![ChipTelemetry {
                expected_cells: 3,
                temperature1: 25,
                temperature2: -4,
                device_status: 0x81,
                fault_status: 0,
                alert_status: 0,
                undervoltage_fault: 0,
                overvoltage_fault: 0,
            }],
        }
    }

    #[test]
    fn voltage_scaling() {
        assert_eq!(scale_voltage(2000), 38);
        assert_eq!(scale_voltage(2100), 40);
        assert_eq!(scale_voltage(2200), 41);
        assert_eq!(scale_voltage(0), 0);
        assert_eq!(scale_voltage(13_368), 254);
        assert_eq!(scale_voltage(u16::MAX), 255);
    }

    #[test]
    fn temperature_conversion_truncates_toward_zero() {
        assert_eq!(convert_temperature(2048), 0);
        assert_eq!(convert_temperature(2048 + 25 * 120), 25);
        assert_eq!(convert_temperature(2048 + 119), 0);
        assert_eq!(convert_temperature(2048 - 119), 0);
        assert_eq!(convert_temperature(2048 - 240), -2);
        assert_eq!(convert_temperature(0), -17);
        assert_eq!(convert_temperature(u16::MAX), 127);
    }

    #[test]
    fn encoded_layout() {
        let checksum = Checksum::new();
        let frame = sample_frame();
        let bytes = frame.encode(&checksum).unwrap();

        assert_eq!(bytes.len(), frame.encoded_len());
        assert_eq!(bytes.len(), 1 + 3 + 1 + 8 + 1);
        assert_eq!(&bytes[..5], &[3, 185, 184, 186, 1]);
        assert_eq!(bytes[5], 3);
        assert_eq!(bytes[7], (-4i8) as u8);
        assert_eq!(*bytes.last().unwrap(), checksum.compute(&bytes[..13], 0));
    }

    #[test]
    fn decode_recovers_the_frame() {
        let checksum = Checksum::new();
        let frame = sample_frame();
        let bytes = frame.encode(&checksum).unwrap();

        let decoded = TelemetryFrame::decode(&bytes, &checksum).unwrap();
        assert_eq!(decoded, frame);
        assert!((decoded.pack_volts() - 11.1).abs() < 1e-9);
    }

    #[test]
    fn decode_rejects_damaged_frames() {
        let checksum = Checksum::new();
        let mut bytes = sample_frame().encode(&checksum).unwrap();

        assert!(TelemetryFrame::decode(&[], &checksum).is_err());
        assert!(TelemetryFrame::decode(&bytes[..bytes.len() - 1], &checksum).is_err());

        bytes[2] ^= 0x10;
        let err = TelemetryFrame::decode(&bytes, &checksum).unwrap_err();
        assert!(matches!(err, BqError::Frame(_)));
    }

    #[test]
    fn decode_rejects_inconsistent_counts() {
        let checksum = Checksum::new();
        let mut body = vec![2, 100, 101, 2];
        body.extend_from_slice(&[0; CHIP_RECORD_LEN]);
        body.push(checksum.compute(&body, 0));

        assert!(TelemetryFrame::decode(&body, &checksum).is_err());
    }

    #[test]
    fn empty_pack_encodes_counts_and_checksum() {
        let checksum = Checksum::new();
        let bytes = TelemetryFrame::default().encode(&checksum).unwrap();
        assert_eq!(bytes, vec![0, 0, checksum.compute(&[0, 0], 0)]);
    }
}
