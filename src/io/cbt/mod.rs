// src/io/cbt/mod.rs
//
// CAN Bus Triple protocol driver.
//
// Host -> device: compact binary commands (see command.rs).
// Device -> host: one byte stream interleaving four frame kinds:
//   0x03 <15-byte record>      CAN frame notification (unsolicited)
//   '{' ... "}\r\n"            JSON-shaped key/value response
//   0xFF "\r\n" / 0x80         OK / ERROR acknowledgement
//   anything else ... "\r\n"   free-form text line

pub mod command;
pub mod eeprom;
pub mod framer;
pub mod link;

pub use command::Command;
pub use eeprom::{BusConfig, Flag, Pid, Settings};
pub use framer::{Frame, FrameClassifier};
pub use link::CbtLink;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Number of physical CAN buses on the device
pub const BUS_COUNT: usize = 3;

/// Flat key/value content of a JSON-shaped response
pub type JsonReply = BTreeMap<String, String>;

// ============================================================================
// CAN Mode
// ============================================================================

/// MCP2515 operating mode of a bus.
///
/// `Unknown` is a host-side sentinel for unreadable replies; it is never sent
/// to the device nor persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanMode {
    Configuration,
    Normal,
    Sleep,
    Listen,
    Loopback,
    Unknown,
}

impl CanMode {
    /// Decode a device mode byte; unrecognised values map to `Unknown`.
    pub fn from_byte(b: u8) -> CanMode {
        match b {
            0 => CanMode::Configuration,
            1 => CanMode::Normal,
            2 => CanMode::Sleep,
            3 => CanMode::Listen,
            4 => CanMode::Loopback,
            _ => CanMode::Unknown,
        }
    }

    /// Device mode byte, or `None` for `Unknown`.
    pub fn to_byte(self) -> Option<u8> {
        match self {
            CanMode::Configuration => Some(0),
            CanMode::Normal => Some(1),
            CanMode::Sleep => Some(2),
            CanMode::Listen => Some(3),
            CanMode::Loopback => Some(4),
            CanMode::Unknown => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CanMode::Configuration => "Configuration",
            CanMode::Normal => "Normal",
            CanMode::Sleep => "Sleep",
            CanMode::Listen => "Listen",
            CanMode::Loopback => "Loopback",
            CanMode::Unknown => "Unknown",
        }
    }

    /// Parse a mode name as reported by the device (case-insensitive).
    pub fn from_name(name: &str) -> CanMode {
        let name = name.trim();
        [
            CanMode::Configuration,
            CanMode::Normal,
            CanMode::Sleep,
            CanMode::Listen,
            CanMode::Loopback,
        ]
        .into_iter()
        .find(|m| m.name().eq_ignore_ascii_case(name))
        .unwrap_or(CanMode::Unknown)
    }
}

impl fmt::Display for CanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Response Correlation
// ============================================================================

/// Response kind a command waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    /// Write only; no response is correlated
    Blind,
    Json,
    Ok,
    Line,
    /// Whichever of JSON, OK/ERROR or text line arrives first
    Any,
}

impl Expect {
    /// Whether a classified frame resolves a command waiting for `self`.
    pub fn accepts(self, frame: &Frame) -> bool {
        matches!(
            (self, frame),
            (Expect::Json | Expect::Any, Frame::Json(_))
                | (Expect::Ok | Expect::Any, Frame::Ack(_))
                | (Expect::Line | Expect::Any, Frame::Line(_))
        )
    }

    pub fn describe(self) -> &'static str {
        match self {
            Expect::Blind => "write",
            Expect::Json => "json response",
            Expect::Ok => "ok/error acknowledgement",
            Expect::Line => "text line",
            Expect::Any => "any response",
        }
    }
}

/// Response delivered to a pending command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Json(JsonReply),
    /// `true` for OK, `false` for ERROR
    Ack(bool),
    Line(String),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Json(map) => {
                for (key, value) in map {
                    write!(f, "[{}] => {}\r\n", key, value)?;
                }
                Ok(())
            }
            Reply::Ack(true) => f.write_str("OK"),
            Reply::Ack(false) => f.write_str("ERROR"),
            Reply::Line(line) => f.write_str(line),
        }
    }
}
