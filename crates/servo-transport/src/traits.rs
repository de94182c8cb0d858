use crate::{BusError, PortInfo, Result};
use std::io::{Read, Write};

/// Byte stream to a half-duplex servo bus.
///
/// Reads must return within a few milliseconds when nothing is pending,
/// either with `Ok(0)` or a `TimedOut`/`WouldBlock` error; [`crate::ServoBus`]
/// does its own deadline tracking on top.
pub trait SerialLink: Read + Write {
    /// Open the device at `path` and configure `baudrate`.
    fn open(path: &str, baudrate: u32) -> Result<Self>
    where
        Self: Sized;

    /// Enumerate devices this backend could open.
    fn list() -> Result<Vec<PortInfo>>
    where
        Self: Sized,
    {
        Err(BusError::Unsupported("port enumeration"))
    }

    /// Drop any bytes received but not yet read.
    fn clear_input(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
