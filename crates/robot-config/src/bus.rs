use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use servo_transport::{BusConfig, ProtocolVersion};
use std::path::Path;
use std::time::Duration;

/// Layout of `dynamixel.yaml`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusFile {
    pub dynamixel: PortSection,
    pub control_table: ControlTable,
    #[serde(default)]
    pub packet_timeout_ms: Option<u64>,
    #[serde(default)]
    pub behavior: BehaviorConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortSection {
    pub device: String,
    pub baudrate: u32,
    pub protocol_version: ProtocolVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlTable {
    pub addr_torque_enable: u16,
    pub addr_goal_position: u16,
    pub addr_present_position: u16,
    pub len_goal_position: u16,
    pub len_present_position: u16,
}

/// Optional present-position polling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default)]
    pub enable_present_read: bool,
    #[serde(default = "default_present_hz")]
    pub present_read_hz: f64,
}

fn default_present_hz() -> f64 {
    10.0
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            enable_present_read: false,
            present_read_hz: default_present_hz(),
        }
    }
}

impl BehaviorConfig {
    /// Minimum interval between reads; rates below 1 Hz count as 1 Hz.
    pub fn present_period(&self) -> Duration {
        let hz = if self.present_read_hz.is_finite() {
            self.present_read_hz.max(1.0)
        } else {
            1.0
        };
        Duration::from_secs_f64(1.0 / hz)
    }
}

impl BusFile {
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let file: BusFile = serde_yaml::from_str(raw).context("decoding bus config")?;
        let table = &file.control_table;
        for (name, len) in [
            ("len_goal_position", table.len_goal_position),
            ("len_present_position", table.len_present_position),
        ] {
            ensure!(
                matches!(len, 1 | 2 | 4),
                "{name} must be 1, 2 or 4 bytes, got {len}"
            );
        }
        ensure!(file.dynamixel.baudrate > 0, "baudrate must be positive");
        Ok(file)
    }

    pub fn bus_config(&self) -> BusConfig {
        let mut cfg = BusConfig::x_series(&self.dynamixel.device, self.dynamixel.baudrate);
        cfg.protocol_version = self.dynamixel.protocol_version;
        cfg.addr_torque_enable = self.control_table.addr_torque_enable;
        cfg.addr_goal_position = self.control_table.addr_goal_position;
        cfg.addr_present_position = self.control_table.addr_present_position;
        cfg.len_goal_position = self.control_table.len_goal_position;
        cfg.len_present_position = self.control_table.len_present_position;
        if let Some(ms) = self.packet_timeout_ms {
            cfg.packet_timeout_ms = ms;
        }
        cfg
    }
}

pub fn load_bus(path: impl AsRef<Path>) -> anyhow::Result<BusFile> {
    let path = path.as_ref();
    let raw = crate::read_file(path)?;
    BusFile::from_yaml_str(&raw).with_context(|| format!("loading {}", path.display()))
}
