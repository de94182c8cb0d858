use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use teleop_protocol::JointTargets;

/// Operating mode of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Estop,
    Home,
    Track,
    LowConf,
    SoftHold,
    HardStop,
}

impl Mode {
    pub const ALL: [Mode; 6] = [
        Mode::Estop,
        Mode::Home,
        Mode::Track,
        Mode::LowConf,
        Mode::SoftHold,
        Mode::HardStop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Estop => "ESTOP",
            Mode::Home => "HOME",
            Mode::Track => "TRACK",
            Mode::LowConf => "LOW_CONF",
            Mode::SoftHold => "SOFT_HOLD",
            Mode::HardStop => "HARD_STOP",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Safety-relevant state, owned by the arbiter.
#[derive(Debug, Clone)]
pub struct SafetyState {
    pub estop: bool,
    pub torque: bool,
    pub last_good_command_time: Instant,
    pub last_good_seq: Option<u64>,
}

impl SafetyState {
    pub fn new(now: Instant) -> Self {
        Self {
            estop: false,
            torque: true,
            last_good_command_time: now,
            last_good_seq: None,
        }
    }
}

/// Command fields the arbiter looks at, with both gates already evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct ArbiterInput {
    pub seq: u64,
    pub estop: bool,
    pub torque: bool,
    pub confidence_ok: bool,
    pub home_requested: bool,
    pub joints: JointTargets,
}

/// Command-driven outcome, before staleness is considered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub mode: Mode,
    pub torque: bool,
    pub joints: Option<JointTargets>,
}

/// Time-driven verdict on the age of the last trusted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalePolicy {
    Ok,
    SoftHold,
    HardStop,
}

/// Final mode of a tick and the hardware writes it permits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actuation {
    pub mode: Mode,
    pub torque_applied: bool,
    /// Goal positions to send; `None` holds whatever was last written.
    pub write: Option<JointTargets>,
}
