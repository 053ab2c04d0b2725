// src/io/mod.rs
//
// IO layer for the CAN Bus Triple.
// Provides the byte-channel abstraction, the device protocol (command encoding,
// frame classification, settings image codec) and the link that ties them
// together, plus the shared types emitted to subscribers.

pub mod cbt; // Device protocol and link
pub mod channel; // Byte channel trait and implementations
mod error;

pub use cbt::{CanMode, CbtLink, Command, Expect, JsonReply, Reply, Settings};
pub use channel::{ByteChannel, MemoryChannel, MemoryDevice};
pub use error::IoError;

use chrono::{DateTime, Local};
use serde::Serialize;

// ============================================================================
// Shared Types
// ============================================================================

/// CAN message captured by the device and forwarded over the serial link.
///
/// Built only by the link when a complete notification record has been read.
/// The timestamp is derived from the link-open time plus monotonic elapsed time,
/// not the wall clock at receipt, so long-open links do not pick up clock skew.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CanMessage {
    bus: u8,
    id: u16,
    data: Vec<u8>,
    /// Receive-buffer occupancy of the MCP2515:
    /// bit0 = buffer 1, bit1 = buffer 2 (both may be set)
    status: u8,
    timestamp: DateTime<Local>,
}

impl CanMessage {
    pub(crate) fn new(bus: u8, id: u16, data: Vec<u8>, status: u8, timestamp: DateTime<Local>) -> Self {
        Self {
            bus,
            id,
            data,
            status: status & 0x03,
            timestamp,
        }
    }

    /// Bus index (1..3)
    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn on_buffer1(&self) -> bool {
        self.status & 0x01 != 0
    }

    pub fn on_buffer2(&self) -> bool {
        self.status & 0x02 != 0
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// Identifier formatted as `0x7E8`
    pub fn hex_id(&self) -> String {
        format!("0x{:03X}", self.id)
    }

    /// Payload formatted as `0x0102AB`
    pub fn hex_data(&self) -> String {
        format!("0x{}", hex::encode_upper(&self.data))
    }

    /// Capture time formatted as `HH:MM:SS.mmm`
    pub fn time(&self) -> String {
        self.timestamp.format("%H:%M:%S%.3f").to_string()
    }
}

/// Direction of a traced exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceDirection {
    Tx,
    Rx,
}

/// Events published by the link to its subscribers.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkEvent {
    /// The byte channel was opened (`true`) or closed (`false`)
    StatusChanged(bool),
    /// Unsolicited CAN frame notification, delivered busy or not
    CanMessage(CanMessage),
    /// Debug trace of traffic, emitted only when tracing is enabled
    Trace { direction: TraceDirection, text: String },
}
