//! servo-transport: multi-drop serial bus driver for Dynamixel-compatible servos
//!
//! [`ServoBus`] speaks protocol 1.0 or 2.0 over any [`SerialLink`]. The
//! default build enables a `mock` link that simulates a chain of servos in
//! process, so binaries and tests run on hosts without hardware. Enable the
//! `serial` feature for the `serialport` backend.

mod types;
pub use types::{BusConfig, PortInfo, ProtocolVersion};

mod error;
pub use error::{BusError, CommResult, Result, TorqueAllError};

pub mod packet;

mod traits;
pub use traits::SerialLink;

mod bus;
pub use bus::ServoBus;

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockHandle, MockLink};

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::SerialPortLink;
