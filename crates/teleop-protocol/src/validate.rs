use crate::types::{Command, JointTargets, MAX_MOTOR_ID, MIN_MOTOR_ID};
use crate::{Result, ValidationError};
use serde_json::Value;
use std::collections::BTreeMap;

const REQUIRED_KEYS: [&str; 8] = [
    "type",
    "seq",
    "ts",
    "confidence",
    "estop",
    "torque",
    "joints",
    "features",
];

/// Check a raw wire message without producing a [`Command`].
///
/// Never panics; every violation comes back as a [`ValidationError`].
pub fn validate(raw: &Value) -> Result<()> {
    let obj = raw.as_object().ok_or(ValidationError::NotAnObject)?;
    for key in REQUIRED_KEYS {
        if !obj.contains_key(key) {
            return Err(ValidationError::MissingKey(key));
        }
    }

    match &obj["type"] {
        Value::String(s) if s == "cmd" => {}
        other => return Err(ValidationError::WrongType(other.to_string())),
    }

    let seq = as_int(&obj["seq"]).ok_or_else(|| invalid("seq", &obj["seq"]))?;
    if seq < 0 {
        return Err(ValidationError::NegativeSeq(seq));
    }
    as_float(&obj["ts"]).ok_or_else(|| invalid("ts", &obj["ts"]))?;
    let confidence =
        as_float(&obj["confidence"]).ok_or_else(|| invalid("confidence", &obj["confidence"]))?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(ValidationError::ConfidenceOutOfRange(confidence));
    }
    as_bool(&obj["estop"]).ok_or_else(|| invalid("estop", &obj["estop"]))?;
    as_bool(&obj["torque"]).ok_or_else(|| invalid("torque", &obj["torque"]))?;

    let joints = obj["joints"]
        .as_object()
        .ok_or(ValidationError::NotAMapping("joints"))?;
    for (key, value) in joints {
        parse_motor_id(key).ok_or_else(|| ValidationError::InvalidMotorId(key.clone()))?;
        as_int(value).ok_or_else(|| ValidationError::InvalidJointValue {
            motor: key.clone(),
        })?;
    }

    let features = obj["features"]
        .as_object()
        .ok_or(ValidationError::NotAMapping("features"))?;
    for (name, value) in features {
        as_float(value).ok_or_else(|| ValidationError::InvalidFeature { name: name.clone() })?;
    }

    Ok(())
}

/// Build a [`Command`] from a message that already passed [`validate`].
///
/// The result for an unvalidated message is unspecified (fields that fail to
/// coerce fall back to zero/empty values).
pub fn decode(raw: &Value) -> Command {
    let field = |key: &str| raw.get(key).unwrap_or(&Value::Null);

    let joints: JointTargets = field("joints")
        .as_object()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| Some((parse_motor_id(k)?, as_int(v)?)))
                .collect()
        })
        .unwrap_or_default();
    let features: BTreeMap<String, f64> = field("features")
        .as_object()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| Some((k.clone(), as_float(v)?)))
                .collect()
        })
        .unwrap_or_default();

    Command {
        seq: as_int(field("seq")).map_or(0, |s| s.max(0) as u64),
        ts: as_float(field("ts")).unwrap_or(0.0),
        confidence: as_float(field("confidence")).unwrap_or(0.0),
        estop: as_bool(field("estop")).unwrap_or(false),
        torque: as_bool(field("torque")).unwrap_or(false),
        joints,
        features,
    }
}

/// Parse one NDJSON line: JSON syntax, then [`validate`], then [`decode`].
pub fn parse_line(line: &str) -> Result<Command> {
    let raw: Value =
        serde_json::from_str(line).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    validate(&raw)?;
    Ok(decode(&raw))
}

fn invalid(key: &'static str, value: &Value) -> ValidationError {
    ValidationError::InvalidField {
        key,
        reason: format!("cannot coerce {value}"),
    }
}

fn parse_motor_id(key: &str) -> Option<u8> {
    let id = key.trim().parse::<i64>().ok()?;
    if (i64::from(MIN_MOTOR_ID)..=i64::from(MAX_MOTOR_ID)).contains(&id) {
        u8::try_from(id).ok()
    } else {
        None
    }
}

// Integer fields accept floats, truncated toward zero.
fn as_int(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(i);
            }
            let f = n.as_f64()?;
            if f.is_finite() && f > i64::MIN as f64 && f < i64::MAX as f64 {
                Some(f.trunc() as i64)
            } else {
                None
            }
        }
        Value::Bool(b) => Some(i64::from(*b)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

// JSON cannot carry NaN or infinity, so neither is accepted on input.
fn as_float(v: &Value) -> Option<f64> {
    let f = match v {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    f.is_finite().then_some(f)
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scenario_a() -> Value {
        json!({
            "type": "cmd", "seq": 0, "ts": 1.0, "confidence": 0.9,
            "estop": false, "torque": true,
            "joints": {"1": 2048, "2": 2048, "3": 2048, "4": 2048, "5": 2048, "6": 2048},
            "features": {"home": 0.0}
        })
    }

    #[test]
    fn test_valid_command_decodes() {
        let raw = scenario_a();
        assert!(validate(&raw).is_ok());
        let cmd = decode(&raw);
        assert_eq!(cmd.seq, 0);
        assert_eq!(cmd.confidence, 0.9);
        assert!(!cmd.estop);
        assert!(cmd.torque);
        assert_eq!(cmd.joints.len(), 6);
        assert!(cmd.joints.values().all(|&v| v == 2048));
        assert_eq!(cmd.feature("home"), Some(0.0));
    }

    #[test]
    fn test_missing_joints_names_key() {
        let mut raw = scenario_a();
        raw.as_object_mut().unwrap().remove("joints");
        let err = validate(&raw).unwrap_err();
        assert_eq!(err, ValidationError::MissingKey("joints"));
        assert_eq!(err.key(), Some("joints"));
        assert!(err.to_string().contains("joints"));
    }

    #[test]
    fn test_partial_joints_are_valid() {
        let mut raw = scenario_a();
        raw["joints"] = json!({"1": 2048});
        assert!(validate(&raw).is_ok());
        assert_eq!(decode(&raw).joints.len(), 1);
    }

    #[test]
    fn test_wrong_type_rejected() {
        let mut raw = scenario_a();
        raw["type"] = json!("hello");
        assert_eq!(validate(&raw).unwrap_err().key(), Some("type"));
    }

    #[test]
    fn test_negative_seq_rejected() {
        let mut raw = scenario_a();
        raw["seq"] = json!(-3);
        assert_eq!(
            validate(&raw).unwrap_err(),
            ValidationError::NegativeSeq(-3)
        );
    }

    #[test]
    fn test_confidence_range() {
        for bad in [json!(1.5), json!(-0.1), json!("nan")] {
            let mut raw = scenario_a();
            raw["confidence"] = bad;
            assert_eq!(validate(&raw).unwrap_err().key(), Some("confidence"));
        }
        let mut raw = scenario_a();
        raw["confidence"] = json!(1);
        assert!(validate(&raw).is_ok());
    }

    #[test]
    fn test_motor_id_bounds() {
        for bad in ["0", "254", "abc", "-1"] {
            let mut raw = scenario_a();
            raw["joints"] = Value::Object([(bad.to_string(), json!(100))].into_iter().collect());
            assert!(matches!(
                validate(&raw),
                Err(ValidationError::InvalidMotorId(_))
            ));
        }
        let mut raw = scenario_a();
        raw["joints"] = json!({"253": 100, " 7 ": 5});
        assert!(validate(&raw).is_ok());
        let cmd = decode(&raw);
        assert_eq!(cmd.joints.get(&253), Some(&100));
        assert_eq!(cmd.joints.get(&7), Some(&5));
    }

    #[test]
    fn test_joint_values_coerce() {
        let mut raw = scenario_a();
        raw["joints"] = json!({"1": 2048.9, "2": "100", "3": -7.5});
        assert!(validate(&raw).is_ok());
        let cmd = decode(&raw);
        assert_eq!(cmd.joints[&1], 2048);
        assert_eq!(cmd.joints[&2], 100);
        assert_eq!(cmd.joints[&3], -7);

        raw["joints"] = json!({"1": "12.5"});
        assert_eq!(
            validate(&raw).unwrap_err(),
            ValidationError::InvalidJointValue {
                motor: "1".to_string()
            }
        );
        raw["joints"] = json!({"1": null});
        assert!(validate(&raw).is_err());
    }

    #[test]
    fn test_joints_and_features_must_be_objects() {
        let mut raw = scenario_a();
        raw["joints"] = json!([2048, 2048]);
        assert_eq!(
            validate(&raw).unwrap_err(),
            ValidationError::NotAMapping("joints")
        );

        let mut raw = scenario_a();
        raw["features"] = json!({"pinch": "wide"});
        assert_eq!(validate(&raw).unwrap_err().key(), Some("features"));
    }

    #[test]
    fn test_bool_coercion() {
        let mut raw = scenario_a();
        raw["estop"] = json!(1);
        raw["torque"] = json!("FALSE");
        assert!(validate(&raw).is_ok());
        let cmd = decode(&raw);
        assert!(cmd.estop);
        assert!(!cmd.torque);

        raw["estop"] = json!("maybe");
        assert_eq!(validate(&raw).unwrap_err().key(), Some("estop"));
        raw["estop"] = json!(null);
        assert!(validate(&raw).is_err());
    }

    #[test]
    fn test_bool_words_outside_true_false_rejected() {
        for word in ["yes", "no", "on", "off", "y", ""] {
            let mut raw = scenario_a();
            raw["estop"] = json!(word);
            assert_eq!(validate(&raw).unwrap_err().key(), Some("estop"));
            assert!(parse_line(&raw.to_string()).is_err());
        }
        for (word, expected) in [("True", true), ("1", true), ("false", false), ("0", false)] {
            let mut raw = scenario_a();
            raw["estop"] = json!(word);
            assert_eq!(parse_line(&raw.to_string()).unwrap().estop, expected);
        }
    }

    #[test]
    fn test_non_finite_floats_rejected() {
        for bad in ["nan", "inf", "-inf", "NaN", "infinity"] {
            let mut raw = scenario_a();
            raw["ts"] = json!(bad);
            assert_eq!(validate(&raw).unwrap_err().key(), Some("ts"));

            let mut raw = scenario_a();
            raw["features"] = json!({ "pinch": bad });
            assert_eq!(
                validate(&raw).unwrap_err(),
                ValidationError::InvalidFeature {
                    name: "pinch".to_string()
                }
            );
        }
    }

    #[test]
    fn test_accepted_line_reencodes_to_valid_line() {
        let line = r#"{"type":"cmd","seq":1,"ts":"1e308","confidence":"1.0","estop":false,"torque":true,"joints":{},"features":{"pinch":"-0.25"}}"#;
        let cmd = parse_line(line).unwrap();
        assert_eq!(parse_line(&cmd.to_line()).unwrap(), cmd);
        assert!(parse_line(&line.replace("1e308", "1e309")).is_err());
    }

    #[test]
    fn test_parse_line_malformed() {
        assert!(matches!(
            parse_line("{not json"),
            Err(ValidationError::Malformed(_))
        ));
        assert_eq!(parse_line("[1,2]"), Err(ValidationError::NotAnObject));
    }

    #[test]
    fn test_wire_encoding_reparses() {
        let line = r#"{"type":"cmd","seq":"12","ts":3.25,"confidence":0.75,"estop":0,"torque":true,"joints":{"2":1000.7},"features":{"pinch":"0.5","home":false}}"#;
        let cmd = parse_line(line).unwrap();
        let again = parse_line(&cmd.to_line()).unwrap();
        assert_eq!(cmd, again);
        assert_eq!(again.seq, 12);
        assert_eq!(again.joints[&2], 1000);
        assert_eq!(again.feature("pinch"), Some(0.5));
        assert_eq!(again.feature("home"), Some(0.0));
        assert!(cmd.to_line().ends_with('\n'));
    }
}
