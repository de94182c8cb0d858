use crate::{BusError, PortInfo, Result, SerialLink};
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Short per-read timeout; the bus applies the real packet deadline.
const READ_TIMEOUT: Duration = Duration::from_millis(2);

/// USB2Dynamixel / U2D2 style adapter through the `serialport` crate.
pub struct SerialPortLink {
    _path: String,
    port: Box<dyn SerialPort>,
}

impl SerialLink for SerialPortLink {
    fn open(path: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(path, baudrate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| BusError::Open {
                device: path.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            _path: path.to_string(),
            port,
        })
    }

    fn list() -> Result<Vec<PortInfo>> {
        let mut out = Vec::new();
        for p in serialport::available_ports().map_err(|e| BusError::Io(e.to_string()))? {
            let driver = match p.port_type {
                SerialPortType::UsbPort(_) => "usb-serial",
                _ => "serial",
            };
            out.push(PortInfo {
                name: p.port_name,
                driver: driver.to_string(),
            });
        }
        Ok(out)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

impl Read for SerialPortLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialPortLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}
