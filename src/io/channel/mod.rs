// src/io/channel/mod.rs
//
// Byte channel abstraction used by the link.
//
// The link owns exactly one channel and is the only component that reads or
// writes it. Implementations:
// - serial.rs - serialport-backed channel (115200 8N1, DTR/RTS asserted)
// - memory.rs - in-process channel with a scriptable device side

pub mod memory;
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub mod serial;

pub use memory::{MemoryChannel, MemoryDevice};
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub use serial::{list_ports, SerialChannel, SerialPortInfo};

use std::io;
use std::time::Duration;

/// Duplex byte stream between the host and the device.
///
/// `read` waits at most the configured read timeout and reports "nothing
/// arrived" either as `Ok(0)` or as an `ErrorKind::TimedOut` error; the link
/// treats both the same way.
pub trait ByteChannel: Send {
    /// Device name (e.g. "/dev/ttyACM0", "COM3")
    fn name(&self) -> &str;

    /// Change the device name. Only called while the channel is closed.
    fn set_name(&mut self, name: &str);

    fn open(&mut self) -> io::Result<()>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Block until every written byte has left the host.
    fn flush(&mut self) -> io::Result<()>;

    /// Number of received bytes that can be read without waiting.
    fn bytes_available(&mut self) -> io::Result<usize>;
}

/// Whether a read error only means "no data yet".
pub(crate) fn is_idle_read(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
