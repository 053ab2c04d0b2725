// src/io/channel/serial.rs
//
// Serial port channel for the CAN Bus Triple.
//
// Line settings are fixed by the device: 8 data bits, no parity, one stop bit,
// DTR and RTS asserted. The baud rate defaults to 115200.

use serde::Serialize;
use std::io::{self, Read, Write};
use std::time::Duration;

use super::ByteChannel;

/// Default device baud rate
pub const BAUD_RATE: u32 = 115_200;

/// Serial port channel implementing `ByteChannel`
pub struct SerialChannel {
    name: String,
    baud_rate: u32,
    timeout: Duration,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialChannel {
    pub fn new(name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            name: name.into(),
            baud_rate,
            timeout: Duration::from_millis(20),
            port: None,
        }
    }

    fn port_mut(&mut self) -> io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is closed"))
    }
}

impl ByteChannel for SerialChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn open(&mut self) -> io::Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        let mut port = serialport::new(&self.name, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(self.timeout)
            .open()
            .map_err(io::Error::from)?;

        port.write_data_terminal_ready(true).map_err(io::Error::from)?;
        port.write_request_to_send(true).map_err(io::Error::from)?;
        let _ = port.clear(serialport::ClearBuffer::All);

        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the handle releases the OS port
        self.port = None;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        if let Some(port) = self.port.as_mut() {
            port.set_timeout(timeout).map_err(io::Error::from)?;
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port_mut()?.read(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port_mut()?.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port_mut()?.flush()
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let n = self.port_mut()?.bytes_to_read().map_err(io::Error::from)?;
        Ok(n as usize)
    }
}

/// A serial port the CLI can offer to the user
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    /// "USB", "Bluetooth", "PCI" or "Unknown"
    pub port_type: &'static str,
    pub product: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl From<serialport::SerialPortInfo> for SerialPortInfo {
    fn from(p: serialport::SerialPortInfo) -> Self {
        let mut info = SerialPortInfo {
            port_name: p.port_name,
            port_type: "Unknown",
            product: None,
            vid: None,
            pid: None,
        };
        match p.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                info.port_type = "USB";
                info.product = usb.product;
                info.vid = Some(usb.vid);
                info.pid = Some(usb.pid);
            }
            serialport::SerialPortType::BluetoothPort => info.port_type = "Bluetooth",
            serialport::SerialPortType::PciPort => info.port_type = "PCI",
            serialport::SerialPortType::Unknown => {}
        }
        info
    }
}

/// Serial ports present on this host.
///
/// macOS lists every device twice; only the /dev/cu.* callout side is kept.
pub fn list_ports() -> Result<Vec<SerialPortInfo>, String> {
    let ports = serialport::available_ports().map_err(|e| format!("Failed to enumerate ports: {}", e))?;
    Ok(ports
        .into_iter()
        .filter(|p| !cfg!(target_os = "macos") || !p.port_name.starts_with("/dev/tty."))
        .map(SerialPortInfo::from)
        .collect())
}
