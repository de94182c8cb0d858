use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Lowest addressable motor id on the servo bus.
pub const MIN_MOTOR_ID: u8 = 1;
/// Highest addressable motor id on the servo bus (254 is broadcast).
pub const MAX_MOTOR_ID: u8 = 253;

/// Goal positions in raw encoder ticks, keyed by motor id.
pub type JointTargets = BTreeMap<u8, i64>;

/// A validated teleoperation command.
///
/// `seq` is assigned by the sender and is not required to be monotonic on
/// receipt. `ts` is the sender's wall clock and is informational only.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub seq: u64,
    pub ts: f64,
    pub confidence: f64,
    pub estop: bool,
    pub torque: bool,
    pub joints: JointTargets,
    pub features: BTreeMap<String, f64>,
}

impl Command {
    /// Value of a named feature, if the sender provided it.
    pub fn feature(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied()
    }

    /// Encode back into the wire object.
    pub fn to_wire(&self) -> Value {
        let joints: Map<String, Value> = self
            .joints
            .iter()
            .map(|(id, pos)| (id.to_string(), Value::from(*pos)))
            .collect();
        let wire = WireCommand {
            r#type: "cmd",
            seq: self.seq,
            ts: self.ts,
            confidence: self.confidence,
            estop: self.estop,
            torque: self.torque,
            joints,
            features: &self.features,
        };
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }

    /// Encode as one NDJSON line, newline included.
    pub fn to_line(&self) -> String {
        let mut line = self.to_wire().to_string();
        line.push('\n');
        line
    }
}

#[derive(Serialize)]
struct WireCommand<'a> {
    r#type: &'static str,
    seq: u64,
    ts: f64,
    confidence: f64,
    estop: bool,
    torque: bool,
    joints: Map<String, Value>,
    features: &'a BTreeMap<String, f64>,
}
