//! robot-config: loaders for the controller's configuration files
//!
//! Every loader returns `anyhow::Result` with the file path in the error
//! context. Anything loaded here is treated as validated by the rest of the
//! system.

mod network;
pub use network::{load_network, NetworkConfig, TcpConfig};

mod bus;
pub use bus::{load_bus, BehaviorConfig, BusFile, ControlTable, PortSection};

mod calibration;
pub use calibration::{load_calibration, CalibrationSet, JointCalibration, REQUIRED_MOTOR_IDS};

use anyhow::Context;
use std::path::Path;

pub(crate) fn read_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}
