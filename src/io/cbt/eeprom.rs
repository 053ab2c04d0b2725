// src/io/cbt/eeprom.rs
//
// Codec for the device's persistent 512-byte configuration image.
//
// Layout (16-bit fields little-endian):
//   0        display enabled (1 = on)
//   1        first boot (1 = set)
//   2        display index
//   3..15    3 x bus config  [bit rate lo][bit rate hi][mode][reserved]
//   15       hardware self-test (1 = on)
//   16..20   reserved
//   20..292  8 x PID record (34 bytes, see `Pid`)
//   292..512 reserved
//
// Reserved bytes are not kept: decoding skips them and encoding writes zeros.
// Flag bytes are kept as read, so an erased image (0xFF) encodes back unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{CanMode, BUS_COUNT};
use crate::io::IoError;

// =============================================================================
// Constants
// =============================================================================

/// Size of the configuration image
pub const SETTINGS_SIZE: usize = 512;
/// Number of PID records in the image
pub const PID_COUNT: usize = 8;
/// Characters in a PID name
pub const PID_NAME_LEN: usize = 8;

const BUS_CONFIG_OFFSET: usize = 3;
const BUS_CONFIG_LEN: usize = 4;
const HW_SELF_TEST_OFFSET: usize = 15;
const PID_OFFSET: usize = 20;
const PID_LEN: usize = 34;

fn hex_field(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode_upper(bytes))
}

// =============================================================================
// Flag
// =============================================================================

/// One-byte boolean field. The firmware treats only 1 as set; other values
/// are preserved so a dumped image can be written back as it was.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flag(pub u8);

impl Flag {
    pub const OFF: Flag = Flag(0);
    pub const ON: Flag = Flag(1);

    pub fn is_set(self) -> bool {
        self.0 == 1
    }
}

impl From<bool> for Flag {
    fn from(on: bool) -> Self {
        if on {
            Flag::ON
        } else {
            Flag::OFF
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.is_set())
    }
}

// =============================================================================
// Bus Config
// =============================================================================

/// Persisted configuration of one CAN bus
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bit rate in device units (125 = 125 kbit/s)
    pub bit_rate: u16,
    pub mode: CanMode,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bit_rate: 125,
            mode: CanMode::Normal,
        }
    }
}

impl BusConfig {
    fn decode(raw: &[u8]) -> BusConfig {
        BusConfig {
            bit_rate: u16::from_le_bytes([raw[0], raw[1]]),
            mode: CanMode::from_byte(raw[2]),
        }
    }

    fn encode(&self, out: &mut [u8]) -> Result<(), IoError> {
        let mode = self
            .mode
            .to_byte()
            .ok_or_else(|| IoError::validation("bus mode Unknown cannot be persisted"))?;
        out[..2].copy_from_slice(&self.bit_rate.to_le_bytes());
        out[2] = mode;
        out[3] = 0;
        Ok(())
    }
}

impl fmt::Display for BusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\n\tMode: {}\n\tBitRate: {}", self.mode, self.bit_rate)
    }
}

// =============================================================================
// PID
// =============================================================================

/// Device-side filter/response definition.
///
/// Record layout (34 bytes): bus id, settings, value (LE), TXD[8], RXF[6],
/// RXD[2], MTH[6], name[8].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pid {
    pub bus_id: u8,
    pub settings: u8,
    pub value: u16,
    pub txd: [u8; 8],
    pub rxf: [u8; 6],
    pub rxd: [u8; 2],
    pub mth: [u8; 6],
    /// Up to 8 Latin-1 characters, one byte each on the device
    pub name: String,
}

impl Pid {
    fn decode(raw: &[u8]) -> Pid {
        let mut pid = Pid {
            bus_id: raw[0],
            settings: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            ..Pid::default()
        };
        pid.txd.copy_from_slice(&raw[4..12]);
        pid.rxf.copy_from_slice(&raw[12..18]);
        pid.rxd.copy_from_slice(&raw[18..20]);
        pid.mth.copy_from_slice(&raw[20..26]);

        let name: String = raw[26..34].iter().map(|&b| char::from(b)).collect();
        pid.name = name.trim_end_matches([' ', '\0']).to_string();
        pid
    }

    fn encode(&self, out: &mut [u8]) -> Result<(), IoError> {
        let name = self.name_bytes()?;

        out[0] = self.bus_id;
        out[1] = self.settings;
        out[2..4].copy_from_slice(&self.value.to_le_bytes());
        out[4..12].copy_from_slice(&self.txd);
        out[12..18].copy_from_slice(&self.rxf);
        out[18..20].copy_from_slice(&self.rxd);
        out[20..26].copy_from_slice(&self.mth);
        out[26..34].copy_from_slice(&name);
        Ok(())
    }

    /// Name as stored on the device: one byte per character, space padded.
    fn name_bytes(&self) -> Result<[u8; PID_NAME_LEN], IoError> {
        let mut out = [b' '; PID_NAME_LEN];
        let mut len = 0;

        for c in self.name.chars() {
            let byte = u8::try_from(c).map_err(|_| {
                IoError::validation(format!("PID name '{}' has a character outside Latin-1", self.name))
            })?;
            if len == PID_NAME_LEN {
                return Err(IoError::validation(format!(
                    "PID name '{}' exceeds {} characters",
                    self.name, PID_NAME_LEN
                )));
            }
            out[len] = byte;
            len += 1;
        }
        Ok(out)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\n\tbusId: {}\n\tsettings: 0b{:08b}\n\tvalue: {}\n\ttxd: {}\n\trxf: {}\n\trxd: {}\n\tmth: {}\n\tname: {}",
            self.bus_id,
            self.settings,
            self.value,
            hex_field(&self.txd),
            hex_field(&self.rxf),
            hex_field(&self.rxd),
            hex_field(&self.mth),
            self.name
        )
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Decoded configuration image
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub display_enabled: Flag,
    pub first_boot: Flag,
    pub display_index: u8,
    pub hw_self_test: Flag,
    pub buses: [BusConfig; BUS_COUNT],
    pub pids: [Pid; PID_COUNT],
}

impl Default for Settings {
    /// Factory state: display off, first boot pending, self-test on, every
    /// bus at 125 in Normal mode, no PIDs.
    fn default() -> Self {
        Self {
            display_enabled: Flag::OFF,
            first_boot: Flag::ON,
            display_index: 0,
            hw_self_test: Flag::ON,
            buses: [BusConfig::default(); BUS_COUNT],
            pids: Default::default(),
        }
    }
}

impl Settings {
    /// Decode a configuration image. Anything other than 512 bytes is rejected.
    pub fn from_bytes(image: &[u8]) -> Result<Settings, IoError> {
        if image.len() != SETTINGS_SIZE {
            return Err(IoError::format(format!(
                "invalid EEPROM size {} (expected {} bytes)",
                image.len(),
                SETTINGS_SIZE
            )));
        }

        let buses = std::array::from_fn(|i| {
            let at = BUS_CONFIG_OFFSET + i * BUS_CONFIG_LEN;
            BusConfig::decode(&image[at..at + BUS_CONFIG_LEN])
        });
        let pids = std::array::from_fn(|i| {
            let at = PID_OFFSET + i * PID_LEN;
            Pid::decode(&image[at..at + PID_LEN])
        });

        Ok(Settings {
            display_enabled: Flag(image[0]),
            first_boot: Flag(image[1]),
            display_index: image[2],
            hw_self_test: Flag(image[HW_SELF_TEST_OFFSET]),
            buses,
            pids,
        })
    }

    /// Encode into a 512-byte image.
    ///
    /// Fails if a bus mode is `Unknown` or a PID name does not fit in 8 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, IoError> {
        let mut image = vec![0u8; SETTINGS_SIZE];
        image[0] = self.display_enabled.0;
        image[1] = self.first_boot.0;
        image[2] = self.display_index;

        for (i, bus) in self.buses.iter().enumerate() {
            let at = BUS_CONFIG_OFFSET + i * BUS_CONFIG_LEN;
            bus.encode(&mut image[at..at + BUS_CONFIG_LEN])?;
        }

        image[HW_SELF_TEST_OFFSET] = self.hw_self_test.0;

        for (i, pid) in self.pids.iter().enumerate() {
            let at = PID_OFFSET + i * PID_LEN;
            pid.encode(&mut image[at..at + PID_LEN])?;
        }

        Ok(image)
    }

    /// Human-readable key/value view, in image order.
    pub fn to_map(&self) -> Vec<(String, String)> {
        let mut map = vec![
            ("displayEnabled".to_string(), self.display_enabled.to_string()),
            ("firstboot".to_string(), self.first_boot.to_string()),
            ("displayIndex".to_string(), self.display_index.to_string()),
            ("hwselftest".to_string(), self.hw_self_test.to_string()),
        ];
        for (i, bus) in self.buses.iter().enumerate() {
            map.push((format!("Bus {} config", i + 1), bus.to_string()));
        }
        for (i, pid) in self.pids.iter().enumerate() {
            map.push((format!("PID {}", i + 1), pid.to_string()));
        }
        map
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.to_map() {
            writeln!(f, "[{}] => {}", key, value)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Image as the device would dump it, with every field populated
    fn sample_image() -> Vec<u8> {
        let mut image = vec![0u8; SETTINGS_SIZE];
        image[0] = 1;
        image[1] = 0;
        image[2] = 2;
        image[3..7].copy_from_slice(&[0xF4, 0x01, 1, 0]); // bus 1: 500, Normal
        image[7..11].copy_from_slice(&[0x7D, 0x00, 3, 0]); // bus 2: 125, Listen
        image[11..15].copy_from_slice(&[0xFA, 0x00, 4, 0]); // bus 3: 250, Loopback
        image[15] = 1;

        let pid = PID_OFFSET + PID_LEN; // second record
        image[pid] = 1;
        image[pid + 1] = 0b1000_0001;
        image[pid + 2..pid + 4].copy_from_slice(&0x07E0u16.to_le_bytes());
        image[pid + 4..pid + 12].copy_from_slice(&[0x02, 0x01, 0x0C, 0, 0, 0, 0, 0]);
        image[pid + 12..pid + 18].copy_from_slice(&[0x07, 0xE8, 0, 0, 0, 0]);
        image[pid + 18..pid + 20].copy_from_slice(&[0x03, 0x02]);
        image[pid + 20..pid + 26].copy_from_slice(&[0x01, 0x04, 0, 0, 0, 0]);
        image[pid + 26..pid + 34].copy_from_slice(b"RPM     ");

        for i in 0..PID_COUNT {
            if i != 1 {
                let at = PID_OFFSET + i * PID_LEN + 26;
                image[at..at + 8].copy_from_slice(b"        ");
            }
        }
        image
    }

    #[test]
    fn test_decode_fields() {
        let settings = Settings::from_bytes(&sample_image()).unwrap();

        assert!(settings.display_enabled.is_set());
        assert!(!settings.first_boot.is_set());
        assert_eq!(settings.display_index, 2);
        assert!(settings.hw_self_test.is_set());
        assert_eq!(settings.buses[0], BusConfig { bit_rate: 500, mode: CanMode::Normal });
        assert_eq!(settings.buses[1], BusConfig { bit_rate: 125, mode: CanMode::Listen });
        assert_eq!(settings.buses[2].mode, CanMode::Loopback);

        let pid = &settings.pids[1];
        assert_eq!(pid.bus_id, 1);
        assert_eq!(pid.settings, 0b1000_0001);
        assert_eq!(pid.value, 0x07E0);
        assert_eq!(pid.rxf, [0x07, 0xE8, 0, 0, 0, 0]);
        assert_eq!(pid.name, "RPM");
        assert_eq!(settings.pids[0].name, "");
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let image = sample_image();
        let settings = Settings::from_bytes(&image).unwrap();
        assert_eq!(settings.to_bytes().unwrap(), image);
    }

    #[test]
    fn test_odd_flag_bytes_survive_round_trip() {
        let mut image = sample_image();
        image[0] = 0xFF;
        image[1] = 0x02;
        image[HW_SELF_TEST_OFFSET] = 0xFF;

        let mut settings = Settings::from_bytes(&image).unwrap();
        assert!(!settings.display_enabled.is_set());
        assert!(!settings.first_boot.is_set());
        assert_eq!(settings.to_bytes().unwrap(), image);

        settings.display_enabled = true.into();
        assert_eq!(settings.to_bytes().unwrap()[0], 1);
        assert_eq!(settings.to_map()[0].1, "true");
    }

    #[test]
    fn test_wrong_size_rejected() {
        for len in [0usize, 511, 513, 1024] {
            let err = Settings::from_bytes(&vec![0u8; len]).unwrap_err();
            assert!(matches!(err, IoError::Format(_)), "length {} accepted", len);
        }
    }

    #[test]
    fn test_reserved_bytes_written_as_zero() {
        let mut image = sample_image();
        image[6] = 0xEE; // bus 1 reserved
        image[17] = 0xEE;
        image[400] = 0xEE;

        let encoded = Settings::from_bytes(&image).unwrap().to_bytes().unwrap();
        assert_eq!(encoded[6], 0);
        assert_eq!(encoded[17], 0);
        assert!(encoded[292..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_name_padding_and_trimming() {
        let mut image = sample_image();
        let at = PID_OFFSET + 26;
        image[at..at + 8].copy_from_slice(b"AB\0\0\0\0\0\0");

        let mut settings = Settings::from_bytes(&image).unwrap();
        assert_eq!(settings.pids[0].name, "AB");

        // Re-encoded with spaces rather than the original NULs
        let encoded = settings.to_bytes().unwrap();
        assert_eq!(&encoded[at..at + 8], b"AB      ");

        settings.pids[0].name = "Caf\u{e9}".to_string();
        let encoded = settings.to_bytes().unwrap();
        assert_eq!(&encoded[at..at + 8], &[b'C', b'a', b'f', 0xE9, b' ', b' ', b' ', b' ']);
        assert_eq!(Settings::from_bytes(&encoded).unwrap().pids[0].name, "Caf\u{e9}");
    }

    #[test]
    fn test_invalid_names_rejected() {
        let mut settings = Settings::default();
        settings.pids[3].name = "TOOLONGNAME".to_string();
        assert!(settings.to_bytes().unwrap_err().is_validation());

        settings.pids[3].name = "\u{2603}".to_string();
        assert!(settings.to_bytes().unwrap_err().is_validation());

        settings.pids[3].name = "EXACTLY8".to_string();
        assert!(settings.to_bytes().is_ok());
    }

    #[test]
    fn test_unknown_mode_decodes_but_does_not_encode() {
        let mut image = sample_image();
        image[5] = 9;

        let settings = Settings::from_bytes(&image).unwrap();
        assert_eq!(settings.buses[0].mode, CanMode::Unknown);
        assert!(settings.to_bytes().unwrap_err().is_validation());
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(!settings.display_enabled.is_set());
        assert!(settings.first_boot.is_set());
        assert!(settings.hw_self_test.is_set());
        assert!(settings.buses.iter().all(|b| b.bit_rate == 125 && b.mode == CanMode::Normal));
        assert!(settings.pids.iter().all(|p| p.name.is_empty() && p.txd == [0; 8]));

        let image = settings.to_bytes().unwrap();
        assert_eq!(&image[..4], &[0, 1, 0, 125]);
        assert_eq!(image[HW_SELF_TEST_OFFSET], 1);
    }

    #[test]
    fn test_map_keys_in_order() {
        let settings = Settings::from_bytes(&sample_image()).unwrap();
        let map = settings.to_map();
        let keys: Vec<&str> = map.iter().map(|(k, _)| k.as_str()).collect();

        assert_eq!(&keys[..5], &["displayEnabled", "firstboot", "displayIndex", "hwselftest", "Bus 1 config"]);
        assert_eq!(keys.len(), 4 + BUS_COUNT + PID_COUNT);
        assert_eq!(keys[keys.len() - 1], "PID 8");

        assert_eq!(map[0].1, "true");
        assert_eq!(map[4].1, "\n\tMode: Normal\n\tBitRate: 500");
        assert!(map[8].1.contains("settings: 0b10000001"));
        assert!(map[8].1.contains("rxf: 0x07E800000000"));
        assert!(map[8].1.ends_with("name: RPM"));
    }

    #[test]
    fn test_serde_json_shape() {
        let json = serde_json::to_value(Settings::default()).unwrap();
        assert_eq!(json["buses"][0]["bit_rate"], 125);
        assert_eq!(json["buses"][0]["mode"], "Normal");
        assert_eq!(json["pids"].as_array().unwrap().len(), PID_COUNT);
    }
}
