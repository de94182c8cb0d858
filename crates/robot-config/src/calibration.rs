use anyhow::{bail, ensure, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Motor ids the arm cannot run without.
pub const REQUIRED_MOTOR_IDS: std::ops::RangeInclusive<u8> = 1..=6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointCalibration {
    pub motor_id: u8,
    pub range_min: i64,
    pub range_max: i64,
    #[serde(default)]
    pub homing_offset: i64,
}

impl JointCalibration {
    pub fn clamp(&self, value: i64) -> i64 {
        value.clamp(self.range_min, self.range_max)
    }

    /// Mean of the range bounds, truncated toward zero.
    pub fn midpoint(&self) -> i64 {
        let sum = i128::from(self.range_min) + i128::from(self.range_max);
        (sum / 2) as i64
    }
}

#[derive(Deserialize)]
struct KeyedEntry {
    range_min: i64,
    range_max: i64,
    #[serde(default)]
    homing_offset: i64,
}

#[derive(Deserialize)]
struct ListForm {
    joints: Vec<JointCalibration>,
}

/// Calibrated travel for every joint, keyed by motor id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CalibrationSet {
    joints: BTreeMap<u8, JointCalibration>,
}

impl CalibrationSet {
    pub fn get(&self, motor_id: u8) -> Option<&JointCalibration> {
        self.joints.get(&motor_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.joints.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JointCalibration> {
        self.joints.values()
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    /// Middle of each joint's travel, the default home pose.
    pub fn midpoints(&self) -> BTreeMap<u8, i64> {
        self.joints
            .iter()
            .map(|(&id, c)| (id, c.midpoint()))
            .collect()
    }

    /// Build a set without the required-id check; used for partial rigs and tests.
    pub fn from_joints(joints: impl IntoIterator<Item = JointCalibration>) -> anyhow::Result<Self> {
        let mut set = Self::default();
        for joint in joints {
            ensure!(
                (1..=253).contains(&joint.motor_id),
                "motor_id {} outside 1..253",
                joint.motor_id
            );
            ensure!(
                joint.range_min <= joint.range_max,
                "motor {}: range_min {} exceeds range_max {}",
                joint.motor_id,
                joint.range_min,
                joint.range_max
            );
            set.joints.insert(joint.motor_id, joint);
        }
        Ok(set)
    }

    /// Parse either calibration layout and require every id in 1..=6.
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let value: Value = serde_json::from_str(raw).context("parsing calibration json")?;
        let list_form = value.get("joints").is_some_and(Value::is_array);
        let joints = match value {
            Value::Object(_) if list_form => {
                serde_json::from_value::<ListForm>(value)
                    .context("decoding calibration joints list")?
                    .joints
            }
            Value::Object(map) => {
                let mut out = Vec::with_capacity(map.len());
                for (key, entry) in map {
                    let Ok(motor_id) = key.trim().parse::<u8>() else {
                        warn!(key = %key, "skipping calibration entry with non-numeric id");
                        continue;
                    };
                    match serde_json::from_value::<KeyedEntry>(entry) {
                        Ok(e) => out.push(JointCalibration {
                            motor_id,
                            range_min: e.range_min,
                            range_max: e.range_max,
                            homing_offset: e.homing_offset,
                        }),
                        Err(err) => warn!(motor_id, %err, "skipping malformed calibration entry"),
                    }
                }
                out
            }
            _ => bail!("unsupported calibration layout, expected an object"),
        };
        let set = Self::from_joints(joints)?;
        let missing: Vec<u8> = REQUIRED_MOTOR_IDS
            .filter(|id| !set.joints.contains_key(id))
            .collect();
        ensure!(
            missing.is_empty(),
            "calibration missing motor ids {:?}, found {:?}",
            missing,
            set.ids().collect::<Vec<_>>()
        );
        Ok(set)
    }
}

pub fn load_calibration(path: impl AsRef<Path>) -> anyhow::Result<CalibrationSet> {
    let path = path.as_ref();
    let raw = crate::read_file(path)?;
    CalibrationSet::from_json_str(&raw).with_context(|| format!("loading {}", path.display()))
}
