use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Dynamixel wire protocol revision.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl TryFrom<f64> for ProtocolVersion {
    type Error = String;

    fn try_from(v: f64) -> Result<Self, Self::Error> {
        if v == 1.0 {
            Ok(ProtocolVersion::V1)
        } else if v == 2.0 {
            Ok(ProtocolVersion::V2)
        } else {
            Err(format!("unsupported protocol version {v}"))
        }
    }
}

impl From<ProtocolVersion> for f64 {
    fn from(v: ProtocolVersion) -> f64 {
        match v {
            ProtocolVersion::V1 => 1.0,
            ProtocolVersion::V2 => 2.0,
        }
    }
}

/// Serial device plus the control-table registers the driver touches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    pub device: String,
    pub baudrate: u32,
    pub protocol_version: ProtocolVersion,
    pub addr_torque_enable: u16,
    pub addr_goal_position: u16,
    pub addr_present_position: u16,
    pub len_goal_position: u16,
    pub len_present_position: u16,
    #[serde(default = "default_packet_timeout_ms")]
    pub packet_timeout_ms: u64,
}

fn default_packet_timeout_ms() -> u64 {
    50
}

impl BusConfig {
    /// Control table of X-series servos (XL430/XM430) on protocol 2.0.
    pub fn x_series(device: &str, baudrate: u32) -> Self {
        Self {
            device: device.to_string(),
            baudrate,
            protocol_version: ProtocolVersion::V2,
            addr_torque_enable: 64,
            addr_goal_position: 116,
            addr_present_position: 132,
            len_goal_position: 4,
            len_present_position: 4,
            packet_timeout_ms: default_packet_timeout_ms(),
        }
    }

    pub fn packet_timeout(&self) -> Duration {
        Duration::from_millis(self.packet_timeout_ms)
    }
}

#[derive(Clone, Debug)]
pub struct PortInfo {
    pub name: String,
    pub driver: String,
}
