// src/io/cbt/command.rs
//
// Host -> device command encoder.
//
// Every constructor validates its parameters before building any bytes. Filter
// and mask values travel big-endian; the EEPROM image itself is little-endian
// (see eeprom.rs).

use super::{CanMode, Expect, BUS_COUNT};
use crate::io::IoError;

// =============================================================================
// Constants
// =============================================================================

/// Command group bytes
pub mod cmd {
    pub const SYSTEM: u8 = 0x01;
    pub const SEND_CAN: u8 = 0x02;
    pub const LOG: u8 = 0x03;
    pub const BT_FILTER: u8 = 0x04;
    pub const BLUETOOTH: u8 = 0x08;
    pub const LCD: u8 = 0x16;
    pub const SLEEP: u8 = 0x4E;
}

/// Subcodes of the `SYSTEM` group
pub mod system {
    pub const INFO: u8 = 0x01;
    pub const DUMP_EEPROM: u8 = 0x02;
    pub const SAVE_EEPROM: u8 = 0x03;
    pub const RESET_EEPROM: u8 = 0x04;
    pub const AUTO_BAUD: u8 = 0x08;
    pub const BIT_RATE: u8 = 0x09;
    pub const CAN_MODE: u8 = 0x0A;
    pub const BUS_STATUS: u8 = 0x10;
    pub const BOOTLOADER: u8 = 0x16;
}

/// Size of one save-EEPROM payload
pub const EEPROM_CHUNK_LEN: usize = 32;
/// Sentinel closing a save-EEPROM command
pub const EEPROM_CHUNK_TRAILER: u8 = 0xA1;
/// Longest text accepted by the LCD command
pub const LCD_MAX_CHARS: usize = 65;

const LOG_DISABLED: u8 = 0x00;
const LOG_ENABLED: u8 = 0x01;
const LOG_MASKED: u8 = 0x02;

// =============================================================================
// Command
// =============================================================================

/// A fully-formed command and the response kind it waits for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    name: &'static str,
    bytes: Vec<u8>,
    expect: Expect,
}

fn check_bus(bus: u8) -> Result<u8, IoError> {
    if bus == 0 || bus as usize > BUS_COUNT {
        return Err(IoError::validation(format!(
            "invalid bus {} (expected 1..={})",
            bus, BUS_COUNT
        )));
    }
    Ok(bus)
}

fn check_u16(value: u32, what: &str) -> Result<[u8; 2], IoError> {
    u16::try_from(value)
        .map(u16::to_be_bytes)
        .map_err(|_| IoError::validation(format!("invalid {} {} (exceeds 16 bits)", what, value)))
}

impl Command {
    fn new(name: &'static str, bytes: Vec<u8>, expect: Expect) -> Command {
        Command { name, bytes, expect }
    }

    /// Arbitrary bytes, e.g. for a pass-through console.
    pub fn raw(bytes: impl Into<Vec<u8>>, expect: Expect) -> Command {
        Command::new("raw", bytes.into(), expect)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn expect(&self) -> Expect {
        self.expect
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    // -------------------------------------------------------------------------
    // System
    // -------------------------------------------------------------------------

    pub fn system_info() -> Command {
        Command::new("system_info", vec![cmd::SYSTEM, system::INFO], Expect::Json)
    }

    pub fn dump_eeprom() -> Command {
        Command::new("dump_eeprom", vec![cmd::SYSTEM, system::DUMP_EEPROM], Expect::Json)
    }

    /// One 32-byte slice of the EEPROM image: `01 03 <index> <32 bytes> A1`.
    pub fn save_eeprom_chunk(index: u8, chunk: &[u8]) -> Result<Command, IoError> {
        if chunk.len() != EEPROM_CHUNK_LEN {
            return Err(IoError::validation(format!(
                "invalid chunk size {} ({} bytes expected)",
                chunk.len(),
                EEPROM_CHUNK_LEN
            )));
        }
        let mut bytes = Vec::with_capacity(EEPROM_CHUNK_LEN + 4);
        bytes.extend_from_slice(&[cmd::SYSTEM, system::SAVE_EEPROM, index]);
        bytes.extend_from_slice(chunk);
        bytes.push(EEPROM_CHUNK_TRAILER);
        Ok(Command::new("save_eeprom", bytes, Expect::Json))
    }

    pub fn reset_eeprom() -> Command {
        Command::new("reset_eeprom", vec![cmd::SYSTEM, system::RESET_EEPROM], Expect::Json)
    }

    /// The device reboots into its bootloader and never answers.
    pub fn restart_bootloader() -> Command {
        Command::new("restart_bootloader", vec![cmd::SYSTEM, system::BOOTLOADER], Expect::Blind)
    }

    pub fn auto_baud_rate(bus: u8) -> Result<Command, IoError> {
        let bus = check_bus(bus)?;
        Ok(Command::new("auto_baud_rate", vec![cmd::SYSTEM, system::AUTO_BAUD, bus], Expect::Json))
    }

    /// Bit rate in device units, 1..=65535, sent big-endian.
    pub fn bit_rate(bus: u8, rate: u32) -> Result<Command, IoError> {
        let bus = check_bus(bus)?;
        if rate == 0 {
            return Err(IoError::validation("invalid bit rate 0"));
        }
        let [hi, lo] = check_u16(rate, "bit rate")?;
        Ok(Command::new("bit_rate", vec![cmd::SYSTEM, system::BIT_RATE, bus, hi, lo], Expect::Json))
    }

    pub fn get_can_mode(bus: u8) -> Result<Command, IoError> {
        let bus = check_bus(bus)?;
        Ok(Command::new("get_can_mode", vec![cmd::SYSTEM, system::CAN_MODE, bus], Expect::Json))
    }

    pub fn set_can_mode(bus: u8, mode: CanMode) -> Result<Command, IoError> {
        let bus = check_bus(bus)?;
        let mode_byte = mode
            .to_byte()
            .ok_or_else(|| IoError::validation("CAN mode Unknown cannot be sent to the device"))?;
        Ok(Command::new(
            "set_can_mode",
            vec![cmd::SYSTEM, system::CAN_MODE, bus, mode_byte],
            Expect::Json,
        ))
    }

    pub fn bus_status(bus: u8) -> Result<Command, IoError> {
        let bus = check_bus(bus)?;
        Ok(Command::new("bus_status", vec![cmd::SYSTEM, system::BUS_STATUS, bus], Expect::Json))
    }

    // -------------------------------------------------------------------------
    // CAN
    // -------------------------------------------------------------------------

    /// Transmit a frame: `02 <bus> <id hi> <id lo> <8 data slots> <len>`.
    ///
    /// A single-byte `id` is placed in the low slot.
    pub fn can_packet(bus: u8, id: &[u8], data: &[u8]) -> Result<Command, IoError> {
        let bus = check_bus(bus)?;
        let (id_hi, id_lo) = match id {
            [lo] => (0, *lo),
            [hi, lo] => (*hi, *lo),
            _ => {
                return Err(IoError::validation(format!(
                    "invalid CAN identifier length {} (1 or 2 bytes)",
                    id.len()
                )))
            }
        };
        if data.len() > 8 {
            return Err(IoError::validation(format!(
                "invalid payload length {} (max 8 bytes)",
                data.len()
            )));
        }

        let mut bytes = vec![0u8; 13];
        bytes[..4].copy_from_slice(&[cmd::SEND_CAN, bus, id_hi, id_lo]);
        bytes[4..4 + data.len()].copy_from_slice(data);
        bytes[12] = data.len() as u8;
        Ok(Command::new("can_packet", bytes, Expect::Blind))
    }

    // -------------------------------------------------------------------------
    // Logging
    // -------------------------------------------------------------------------

    /// Enable or disable forwarding of a bus' traffic to the host.
    ///
    /// Filters are only sent when enabling with a nonzero first filter.
    pub fn bus_log(bus: u8, enabled: bool, filter1: u32, filter2: u32) -> Result<Command, IoError> {
        let bus = check_bus(bus)?;
        let f1 = check_u16(filter1, "filter")?;
        let f2 = check_u16(filter2, "filter")?;

        let mut bytes = vec![cmd::LOG, bus, if enabled { LOG_ENABLED } else { LOG_DISABLED }];
        if enabled && filter1 > 0 {
            bytes.extend_from_slice(&f1);
            bytes.extend_from_slice(&f2);
        }
        Ok(Command::new("bus_log", bytes, Expect::Ok))
    }

    /// Enable logging with filter/mask pairs. A zero second filter or mask
    /// reuses the first one.
    pub fn bus_log_mask(bus: u8, filter1: u32, mask1: u32, filter2: u32, mask2: u32) -> Result<Command, IoError> {
        let bus = check_bus(bus)?;
        let f1 = check_u16(filter1, "filter")?;
        let m1 = check_u16(mask1, "mask")?;
        let f2 = if filter2 > 0 { check_u16(filter2, "filter")? } else { f1 };
        let m2 = if mask2 > 0 { check_u16(mask2, "mask")? } else { m1 };

        let mut bytes = vec![cmd::LOG, bus, LOG_MASKED];
        for pair in [f1, m1, f2, m2] {
            bytes.extend_from_slice(&pair);
        }
        Ok(Command::new("bus_log_mask", bytes, Expect::Ok))
    }

    // -------------------------------------------------------------------------
    // Bluetooth
    // -------------------------------------------------------------------------

    /// Restrict the frames relayed over Bluetooth. Disabling sends zero filters.
    pub fn bluetooth_filter(bus: u8, enabled: bool, filter1: u32, filter2: u32) -> Result<Command, IoError> {
        let bus = check_bus(bus)?;
        let f1 = check_u16(filter1, "filter")?;
        let f2 = check_u16(filter2, "filter")?;
        if enabled && filter1 == 0 && filter2 == 0 {
            return Err(IoError::validation("bluetooth filter enabled without any filter value"));
        }

        let mut bytes = vec![cmd::BT_FILTER, bus, 0, 0, 0, 0];
        if enabled {
            bytes[2..4].copy_from_slice(&f1);
            bytes[4..6].copy_from_slice(&f2);
        }
        Ok(Command::new("bluetooth_filter", bytes, Expect::Blind))
    }

    pub fn bluetooth_reset() -> Command {
        Command::new("bluetooth_reset", vec![cmd::BLUETOOTH, 0x01], Expect::Blind)
    }

    pub fn bluetooth_passthrough(enabled: bool) -> Command {
        let sub = if enabled { 0x02 } else { 0x03 };
        Command::new("bluetooth_passthrough", vec![cmd::BLUETOOTH, sub], Expect::Blind)
    }

    // -------------------------------------------------------------------------
    // Misc
    // -------------------------------------------------------------------------

    pub fn sleep_timer(enabled: bool) -> Command {
        Command::new("sleep_timer", vec![cmd::SLEEP, enabled as u8], Expect::Blind)
    }

    /// Show text on the vehicle display. Text beyond 65 characters is cut;
    /// characters outside Latin-1 are sent as '?'.
    pub fn lcd_message(text: &str) -> Command {
        let mut bytes = Vec::with_capacity(1 + LCD_MAX_CHARS);
        bytes.push(cmd::LCD);
        bytes.extend(
            text.chars()
                .take(LCD_MAX_CHARS)
                .map(|c| u8::try_from(c).unwrap_or(b'?')),
        );
        Command::new("lcd_message", bytes, Expect::Blind)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_packet_layout() {
        let cmd = Command::can_packet(1, &[0x07, 0xE8], &[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(
            cmd.as_bytes(),
            &[0x02, 0x01, 0x07, 0xE8, 0x01, 0x02, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03]
        );
        assert_eq!(cmd.expect(), Expect::Blind);
    }

    #[test]
    fn test_can_packet_fields_recoverable() {
        for bus in 1..=3u8 {
            for len in 0..=8usize {
                let data: Vec<u8> = (0..len as u8).map(|b| b.wrapping_mul(17)).collect();
                let cmd = Command::can_packet(bus, &[0x04, 0x56], &data).unwrap();
                let b = cmd.as_bytes();

                assert_eq!(b.len(), 13);
                assert_eq!(b[1], bus);
                assert_eq!(u16::from_be_bytes([b[2], b[3]]), 0x0456);
                assert_eq!(&b[4..4 + b[12] as usize], data.as_slice());
                assert!(b[4 + len..12].iter().all(|&x| x == 0));
            }
        }
    }

    #[test]
    fn test_can_packet_single_byte_id() {
        let cmd = Command::can_packet(2, &[0x7F], &[]).unwrap();
        assert_eq!(&cmd.as_bytes()[..4], &[0x02, 0x02, 0x00, 0x7F]);
        assert_eq!(cmd.as_bytes()[12], 0);
    }

    #[test]
    fn test_can_packet_rejects_bad_id_and_payload() {
        assert!(Command::can_packet(1, &[], &[]).unwrap_err().is_validation());
        assert!(Command::can_packet(1, &[1, 2, 3], &[]).unwrap_err().is_validation());
        assert!(Command::can_packet(1, &[1, 2], &[0; 9]).unwrap_err().is_validation());
    }

    #[test]
    fn test_bus_out_of_range_rejected_everywhere() {
        for bus in [0u8, 4, 255] {
            let results = [
                Command::auto_baud_rate(bus),
                Command::bit_rate(bus, 500),
                Command::get_can_mode(bus),
                Command::set_can_mode(bus, CanMode::Normal),
                Command::bus_status(bus),
                Command::can_packet(bus, &[0x01, 0x00], &[0x00]),
                Command::bus_log(bus, false, 0, 0),
                Command::bus_log_mask(bus, 1, 1, 0, 0),
                Command::bluetooth_filter(bus, false, 0, 0),
            ];
            for result in results {
                assert!(result.unwrap_err().is_validation(), "bus {} accepted", bus);
            }
        }
    }

    #[test]
    fn test_bus_log_layout() {
        let enabled = Command::bus_log(1, true, 0x0100, 0).unwrap();
        assert_eq!(enabled.as_bytes(), &[0x03, 0x01, 0x01, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(enabled.expect(), Expect::Ok);

        let disabled = Command::bus_log(1, false, 0, 0).unwrap();
        assert_eq!(disabled.as_bytes(), &[0x03, 0x01, 0x00]);

        // Filters ignored when disabling or when the first one is zero
        assert_eq!(Command::bus_log(2, false, 0x0123, 0x0456).unwrap().as_bytes(), &[0x03, 0x02, 0x00]);
        assert_eq!(Command::bus_log(2, true, 0, 0x0456).unwrap().as_bytes(), &[0x03, 0x02, 0x01]);

        assert!(Command::bus_log(1, true, 0x1_0000, 0).unwrap_err().is_validation());
    }

    #[test]
    fn test_bus_log_mask_layout() {
        let cmd = Command::bus_log_mask(3, 0x0123, 0x07FF, 0x0456, 0x0700).unwrap();
        assert_eq!(
            cmd.as_bytes(),
            &[0x03, 0x03, 0x02, 0x01, 0x23, 0x07, 0xFF, 0x04, 0x56, 0x07, 0x00]
        );

        let reused = Command::bus_log_mask(1, 0x0123, 0x07FF, 0, 0).unwrap();
        assert_eq!(
            reused.as_bytes(),
            &[0x03, 0x01, 0x02, 0x01, 0x23, 0x07, 0xFF, 0x01, 0x23, 0x07, 0xFF]
        );

        assert!(Command::bus_log_mask(1, 1, 0x2_0000, 0, 0).unwrap_err().is_validation());
    }

    #[test]
    fn test_system_commands() {
        assert_eq!(Command::system_info().as_bytes(), &[0x01, 0x01]);
        assert_eq!(Command::dump_eeprom().as_bytes(), &[0x01, 0x02]);
        assert_eq!(Command::reset_eeprom().as_bytes(), &[0x01, 0x04]);
        assert_eq!(Command::restart_bootloader().as_bytes(), &[0x01, 0x16]);
        assert_eq!(Command::restart_bootloader().expect(), Expect::Blind);
        assert_eq!(Command::auto_baud_rate(2).unwrap().as_bytes(), &[0x01, 0x08, 0x02]);
        assert_eq!(Command::bit_rate(1, 500).unwrap().as_bytes(), &[0x01, 0x09, 0x01, 0x01, 0xF4]);
        assert_eq!(Command::get_can_mode(3).unwrap().as_bytes(), &[0x01, 0x0A, 0x03]);
        assert_eq!(
            Command::set_can_mode(3, CanMode::Listen).unwrap().as_bytes(),
            &[0x01, 0x0A, 0x03, 0x03]
        );
        assert_eq!(Command::bus_status(1).unwrap().as_bytes(), &[0x01, 0x10, 0x01]);
    }

    #[test]
    fn test_bit_rate_range() {
        assert!(Command::bit_rate(1, 0).unwrap_err().is_validation());
        assert!(Command::bit_rate(1, 65_536).unwrap_err().is_validation());
        assert_eq!(Command::bit_rate(1, 65_535).unwrap().as_bytes()[3..], [0xFF, 0xFF]);
    }

    #[test]
    fn test_set_unknown_mode_rejected() {
        assert!(Command::set_can_mode(1, CanMode::Unknown).unwrap_err().is_validation());
    }

    #[test]
    fn test_save_eeprom_chunk() {
        let chunk: Vec<u8> = (0..32).collect();
        let cmd = Command::save_eeprom_chunk(7, &chunk).unwrap();
        let b = cmd.as_bytes();

        assert_eq!(b.len(), 36);
        assert_eq!(&b[..3], &[0x01, 0x03, 0x07]);
        assert_eq!(&b[3..35], chunk.as_slice());
        assert_eq!(b[35], 0xA1);

        assert!(Command::save_eeprom_chunk(0, &[0; 31]).unwrap_err().is_validation());
        assert!(Command::save_eeprom_chunk(0, &[0; 33]).unwrap_err().is_validation());
    }

    #[test]
    fn test_bluetooth_commands() {
        assert_eq!(
            Command::bluetooth_filter(2, true, 0x0123, 0).unwrap().as_bytes(),
            &[0x04, 0x02, 0x01, 0x23, 0x00, 0x00]
        );
        assert_eq!(
            Command::bluetooth_filter(2, false, 0x0123, 0x0456).unwrap().as_bytes(),
            &[0x04, 0x02, 0x00, 0x00, 0x00, 0x00]
        );
        assert!(Command::bluetooth_filter(1, true, 0, 0).unwrap_err().is_validation());

        assert_eq!(Command::bluetooth_reset().as_bytes(), &[0x08, 0x01]);
        assert_eq!(Command::bluetooth_passthrough(true).as_bytes(), &[0x08, 0x02]);
        assert_eq!(Command::bluetooth_passthrough(false).as_bytes(), &[0x08, 0x03]);
    }

    #[test]
    fn test_sleep_and_lcd() {
        assert_eq!(Command::sleep_timer(true).as_bytes(), &[0x4E, 0x01]);
        assert_eq!(Command::sleep_timer(false).as_bytes(), &[0x4E, 0x00]);

        assert_eq!(Command::lcd_message("Hi").as_bytes(), &[0x16, b'H', b'i']);
        let long = "x".repeat(80);
        assert_eq!(Command::lcd_message(&long).as_bytes().len(), 1 + LCD_MAX_CHARS);
        assert_eq!(Command::lcd_message("a\u{2603}").as_bytes(), &[0x16, b'a', b'?']);
    }

    #[test]
    fn test_raw_command() {
        let cmd = Command::raw(vec![0x01, 0x01], Expect::Any);
        assert_eq!(cmd.name(), "raw");
        assert_eq!(cmd.expect(), Expect::Any);
        assert_eq!(cmd.into_bytes(), vec![0x01, 0x01]);
    }
}
