use anyhow::{ensure, Context, Result};
use robot_config::CalibrationSet;
use servo_transport::{SerialLink, ServoBus};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;
use teleop_protocol::{JointTargets, TickLogReader, TickRecord};
use tracing::error;

/// Playback speeds below this are raised to it.
pub const MIN_SPEED: f64 = 0.1;

/// Read every record of a tick log; unreadable rows are reported and skipped.
pub fn load_records(path: &Path) -> Result<Vec<TickRecord>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = TickLogReader::new(BufReader::new(file))
        .with_context(|| format!("reading header of {}", path.display()))?;
    let mut records = Vec::new();
    for (row, rec) in reader.enumerate() {
        match rec {
            Ok(r) => records.push(r),
            Err(e) => error!(row, "skipping bad record: {e}"),
        }
    }
    Ok(records)
}

/// Pause before record `i` (i >= 1): its wall-clock gap to the previous one
/// divided by the playback speed.
pub fn pacing(prev: &TickRecord, next: &TickRecord, speed: f64) -> Duration {
    let speed = if speed.is_finite() {
        speed.max(MIN_SPEED)
    } else {
        1.0
    };
    let dt = ((next.wall_s - prev.wall_s) / speed).max(0.0);
    if dt.is_finite() {
        Duration::from_secs_f64(dt)
    } else {
        Duration::ZERO
    }
}

fn clamp_targets(targets: &JointTargets, calibration: &CalibrationSet) -> JointTargets {
    targets
        .iter()
        .filter_map(|(&id, &pos)| calibration.get(id).map(|c| (id, c.clamp(pos))))
        .collect()
}

/// Re-issue the commanded targets of `records` with torque held on.
/// Returns the number of position writes.
pub fn replay<L: SerialLink>(
    bus: &mut ServoBus<L>,
    records: &[TickRecord],
    calibration: &CalibrationSet,
    speed: f64,
    mut sleep: impl FnMut(Duration),
) -> Result<usize> {
    ensure!(
        records.len() >= 2,
        "not enough records to replay ({})",
        records.len()
    );
    bus.torque_all(true).context("enabling torque")?;
    let mut writes = 0;
    let result = records.windows(2).try_for_each(|pair| {
        sleep(pacing(&pair[0], &pair[1], speed));
        let targets = clamp_targets(&pair[1].cmd_targets(), calibration);
        bus.sync_write_positions(&targets)?;
        writes += 1;
        Ok::<(), servo_transport::BusError>(())
    });
    let released = bus.torque_all(false);
    result.context("writing replay targets")?;
    released.context("releasing torque")?;
    Ok(writes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use robot_config::JointCalibration;
    use servo_transport::{BusConfig, MockHandle, MockLink};
    use std::collections::BTreeMap;

    fn record(wall_s: f64, cmd: [i64; 6]) -> TickRecord {
        TickRecord {
            wall_s,
            seq: 0,
            confidence: 1.0,
            mode: "TRACK".into(),
            estop: false,
            torque: true,
            features: BTreeMap::new(),
            cmd,
            pos: [0; 6],
        }
    }

    fn calibration() -> CalibrationSet {
        CalibrationSet::from_joints((1..=6).map(|motor_id| JointCalibration {
            motor_id,
            range_min: 100,
            range_max: 3000,
            homing_offset: 0,
        }))
        .unwrap()
    }

    #[test]
    fn test_pacing_uses_speed_floor() {
        let a = record(10.0, [0; 6]);
        let b = record(10.5, [0; 6]);
        assert_eq!(pacing(&a, &b, 2.0), Duration::from_millis(250));
        assert!((pacing(&a, &b, 0.0).as_secs_f64() - 5.0).abs() < 1e-6);
        assert_eq!(pacing(&b, &a, 1.0), Duration::ZERO);
    }

    #[test]
    fn test_replay_clamps_and_releases_torque() {
        let handle = MockHandle::new(1..=6);
        let mut config = BusConfig::x_series("mock0", 1_000_000);
        config.packet_timeout_ms = 10;
        let mut bus = ServoBus::new(config, 1..=6);
        bus.attach(MockLink::new(handle.clone()));

        let records = vec![
            record(0.0, [500; 6]),
            record(0.1, [0, 200, 300, 400, 500, 600]),
            record(0.3, [5000, 200, 300, 400, 500, 600]),
        ];
        let mut pauses: Vec<Duration> = Vec::new();
        let sleep = |d: Duration| pauses.push(d);
        let writes = replay(&mut bus, &records, &calibration(), 1.0, sleep).unwrap();
        assert_eq!(writes, 2);
        assert_eq!(pauses.len(), 2);
        assert_eq!(handle.register(1, 116, 4), Some(3000));
        assert_eq!(handle.register(2, 116, 4), Some(200));
        assert_eq!(handle.register(1, 64, 1), Some(0));
    }

    #[test]
    fn test_replay_needs_two_records() {
        let mut bus: ServoBus<MockLink> =
            ServoBus::new(BusConfig::x_series("mock0", 57_600), 1..=6);
        let single = [record(0.0, [0; 6])];
        assert!(replay(&mut bus, &single, &calibration(), 1.0, |_| {}).is_err());
    }
}
