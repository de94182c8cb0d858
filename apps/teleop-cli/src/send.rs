use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use teleop_protocol::{Command, JointTargets, MAX_MOTOR_ID, MIN_MOTOR_ID};

/// Parse `id=position` pairs given on the command line.
pub fn parse_joints(pairs: &[String]) -> Result<JointTargets> {
    let mut joints = JointTargets::new();
    for pair in pairs {
        let Some((id, pos)) = pair.split_once('=') else {
            bail!("joint `{pair}` is not of the form id=position");
        };
        let id: u8 = id
            .trim()
            .parse()
            .with_context(|| format!("motor id in `{pair}`"))?;
        if !(MIN_MOTOR_ID..=MAX_MOTOR_ID).contains(&id) {
            bail!("motor id {id} outside {MIN_MOTOR_ID}..{MAX_MOTOR_ID}");
        }
        let pos: i64 = pos
            .trim()
            .parse()
            .with_context(|| format!("position in `{pair}`"))?;
        joints.insert(id, pos);
    }
    Ok(joints)
}

/// Fixed command template streamed by `send`; only `seq` and `ts` change.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    pub confidence: f64,
    pub estop: bool,
    pub torque: bool,
    pub home: bool,
    pub joints: JointTargets,
}

impl CommandTemplate {
    pub fn command(&self, seq: u64, ts: f64) -> Command {
        let mut features = BTreeMap::new();
        features.insert("home".to_string(), if self.home { 1.0 } else { 0.0 });
        Command {
            seq,
            ts,
            confidence: self.confidence,
            estop: self.estop,
            torque: self.torque,
            joints: self.joints.clone(),
            features,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_joints() {
        let joints = parse_joints(&["1=2048".into(), " 6 = -5 ".into()]).unwrap();
        assert_eq!(joints, JointTargets::from([(1, 2048), (6, -5)]));
        assert!(parse_joints(&["0=1".into()]).is_err());
        assert!(parse_joints(&["3:1".into()]).is_err());
    }

    #[test]
    fn test_template_lines_parse_back() {
        let template = CommandTemplate {
            confidence: 0.9,
            estop: false,
            torque: true,
            home: true,
            joints: JointTargets::from([(2, 1000)]),
        };
        let line = template.command(7, 12.5).to_line();
        let cmd = teleop_protocol::parse_line(line.trim_end()).unwrap();
        assert_eq!(cmd.seq, 7);
        assert_eq!(cmd.feature("home"), Some(1.0));
        assert_eq!(cmd.joints, template.joints);
    }
}
