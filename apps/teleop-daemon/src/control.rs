use crate::metrics::LoopMetrics;
use crate::sink::TickSink;
use safety_guard::{ArbiterInput, Mode, SafetyArbiter, StalePolicy};
use servo_transport::{BusError, SerialLink, ServoBus, TorqueAllError};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use teleop_net::{ConnectionError, LineReader, NetStats, ReadEvent};
use teleop_protocol::{record::wall_time_s, JointTargets, TickRecord, ValidationError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A line that produced no tick. Never fatal to the session.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("invalid command: {0}")]
    Validation(#[from] ValidationError),
    #[error("bus failure: {0}")]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub seq: u64,
    pub mode: Mode,
    pub torque_applied: bool,
    pub wrote: bool,
}

#[derive(Debug)]
pub enum SessionEnd {
    Connection(ConnectionError),
    Shutdown,
}

/// Rate limit for the optional present-position read.
#[derive(Debug, Clone)]
pub struct PresentRead {
    pub enabled: bool,
    pub period: Duration,
}

struct PresentCache {
    config: PresentRead,
    last_read: Instant,
    positions: Option<JointTargets>,
}

impl PresentCache {
    fn due(&self, now: Instant) -> bool {
        self.config.enabled && now.saturating_duration_since(self.last_read) >= self.config.period
    }
}

/// One operator session's worth of state, driven a line at a time.
pub struct ControlLoop<L: SerialLink, S: TickSink> {
    bus: ServoBus<L>,
    arbiter: SafetyArbiter,
    sink: S,
    metrics: LoopMetrics,
    stats: NetStats,
    last_targets: JointTargets,
    torque_on: bool,
    mode: Option<Mode>,
    present: PresentCache,
}

impl<L: SerialLink, S: TickSink> ControlLoop<L, S> {
    /// Targets start at the arbiter's home pose (calibration midpoints).
    pub fn new(
        bus: ServoBus<L>,
        arbiter: SafetyArbiter,
        sink: S,
        metrics: LoopMetrics,
        present: PresentRead,
        now: Instant,
    ) -> Self {
        let last_targets = arbiter.calibration().midpoints();
        Self {
            bus,
            arbiter,
            sink,
            metrics,
            stats: NetStats::default(),
            last_targets,
            torque_on: false,
            mode: None,
            present: PresentCache {
                config: present,
                last_read: now,
                positions: None,
            },
        }
    }

    /// Enable torque on every servo before any client is served.
    pub fn startup(&mut self) -> Result<(), TorqueAllError> {
        self.bus.torque_all(true)?;
        self.torque_on = true;
        self.metrics.set_torque(true);
        info!(ids = ?self.bus.ids(), "torque enabled");
        Ok(())
    }

    pub fn stats(&self) -> &NetStats {
        &self.stats
    }

    pub fn last_targets(&self) -> &JointTargets {
        &self.last_targets
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    #[cfg(test)]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn enter_mode(&mut self, mode: Mode, seq: Option<u64>) {
        if self.mode != Some(mode) {
            match self.mode {
                Some(from) => info!(?seq, %from, to = %mode, "mode change"),
                None => info!(?seq, to = %mode, "mode"),
            }
            self.mode = Some(mode);
        }
    }

    fn write_torque(&mut self, enable: bool) {
        self.torque_on = enable;
        self.metrics.set_torque(enable);
        if let Err(err) = self.bus.torque_all(enable) {
            self.metrics.torque_failures.inc();
            warn!(
                enable,
                applied = ?err.applied,
                failed_id = err.failed_id,
                error = %err.source,
                "torque write failed"
            );
        }
    }

    /// Process one raw line as one tick.
    pub fn handle_line(&mut self, line: &str, now: Instant) -> Result<TickOutcome, TickError> {
        self.metrics.lines_received.inc();
        let cmd = teleop_protocol::parse_line(line)?;
        self.stats.record(cmd.seq, now);

        let input = ArbiterInput::from_command(&cmd);
        let act = self.arbiter.evaluate(&input, now);
        self.enter_mode(act.mode, Some(cmd.seq));
        self.metrics.record_mode(act.mode);

        // reasserted every tick, not only on change
        self.write_torque(act.torque_applied);

        let wrote = act.write.is_some();
        if let Some(targets) = &act.write {
            self.last_targets.extend(targets);
            self.bus.sync_write_positions(targets)?;
        }

        if self.present.due(now) {
            self.present.positions = match self.bus.sync_read_positions() {
                Ok(positions) => Some(positions),
                Err(err) => {
                    warn!(error = %err, "present position read failed");
                    None
                }
            };
            self.present.last_read = now;
        }

        let record = TickRecord {
            wall_s: wall_time_s(),
            seq: cmd.seq,
            confidence: cmd.confidence,
            mode: act.mode.as_str().to_string(),
            estop: cmd.estop,
            torque: act.torque_applied,
            features: cmd.features,
            cmd: TickRecord::joint_array(Some(&self.last_targets)),
            pos: TickRecord::joint_array(self.present.positions.as_ref()),
        };
        if let Err(err) = self.sink.record(&record) {
            warn!(error = %err, "tick log write failed");
        }

        Ok(TickOutcome {
            seq: cmd.seq,
            mode: act.mode,
            torque_applied: act.torque_applied,
            wrote,
        })
    }

    /// Housekeeping when the link has been quiet for one read wait.
    pub fn on_idle(&mut self, now: Instant) {
        if self.arbiter.stale_policy(now) != StalePolicy::HardStop {
            return;
        }
        self.enter_mode(Mode::HardStop, None);
        if self.torque_on {
            warn!(
                age_ms = self.arbiter.command_age(now).as_millis() as u64,
                "operator link silent, releasing torque"
            );
            self.write_torque(false);
        }
    }

    /// Run ticks until the connection ends or `shutdown` is raised.
    pub fn serve<R: Read>(
        &mut self,
        reader: &mut LineReader<R>,
        shutdown: &AtomicBool,
    ) -> SessionEnd {
        loop {
            match reader.next_event() {
                Ok(ReadEvent::Line(line)) => match self.handle_line(&line, Instant::now()) {
                    Ok(outcome) => debug!(
                        seq = outcome.seq,
                        mode = %outcome.mode,
                        torque = outcome.torque_applied,
                        wrote = outcome.wrote,
                        "tick ok"
                    ),
                    Err(TickError::Validation(err)) => {
                        self.metrics.lines_dropped.inc();
                        warn!(error = %err, "dropping line");
                    }
                    Err(err @ TickError::Bus(_)) => {
                        self.metrics.tick_failures.inc();
                        warn!(error = %err, "tick abandoned");
                    }
                },
                Ok(ReadEvent::Idle) => self.on_idle(Instant::now()),
                Err(err) => return SessionEnd::Connection(err),
            }
            if shutdown.load(Ordering::SeqCst) {
                return SessionEnd::Shutdown;
            }
        }
    }

    /// Stop logging, release torque and close the bus.
    pub fn shutdown(mut self) -> S {
        if let Err(err) = self.sink.stop() {
            warn!(error = %err, "failed to flush tick log");
        }
        self.write_torque(false);
        self.bus.close();
        info!(
            rx = self.stats.rx_count,
            last_seq = ?self.stats.last_seq,
            seq_gaps = self.stats.seq_gaps,
            "session stats"
        );
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robot_config::{CalibrationSet, JointCalibration};
    use servo_transport::{packet, BusConfig, MockHandle, MockLink};
    use std::io::Cursor;

    const ADDR_TORQUE: u16 = 64;
    const ADDR_GOAL: u16 = 116;
    const ADDR_PRESENT: u16 = 132;

    type TestLoop = ControlLoop<MockLink, Vec<TickRecord>>;

    fn calibration() -> CalibrationSet {
        CalibrationSet::from_joints((1..=6).map(|motor_id| JointCalibration {
            motor_id,
            range_min: 0,
            range_max: 4095,
            homing_offset: 0,
        }))
        .unwrap()
    }

    fn control_with(present: PresentRead, t0: Instant) -> (TestLoop, MockHandle, LoopMetrics) {
        let handle = MockHandle::new(1..=6);
        let mut config = BusConfig::x_series("mock0", 1_000_000);
        config.packet_timeout_ms = 10;
        let mut bus = ServoBus::new(config, 1..=6);
        bus.attach(MockLink::new(handle.clone()));
        let arbiter = SafetyArbiter::new(
            calibration(),
            Duration::from_millis(350),
            Duration::from_secs(1),
            t0,
        );
        let metrics = LoopMetrics::new().unwrap();
        let mut control = ControlLoop::new(bus, arbiter, Vec::new(), metrics.clone(), present, t0);
        control.startup().unwrap();
        handle.clear_packets();
        (control, handle, metrics)
    }

    fn control(t0: Instant) -> (TestLoop, MockHandle, LoopMetrics) {
        control_with(
            PresentRead {
                enabled: false,
                period: Duration::from_millis(100),
            },
            t0,
        )
    }

    fn tick(control: &mut TestLoop, line: &str, now: Instant) -> TickOutcome {
        control.handle_line(line, now).unwrap()
    }

    fn line(seq: u64, confidence: f64, estop: bool, joints: &str) -> String {
        format!(
            r#"{{"type":"cmd","seq":{seq},"ts":1.0,"confidence":{confidence},"estop":{estop},"torque":true,"joints":{joints},"features":{{"home":0.0}}}}"#
        )
    }

    const ALL_2048: &str = r#"{"1":2048,"2":2048,"3":2048,"4":2048,"5":2048,"6":2048}"#;

    #[test]
    fn test_track_writes_targets_and_logs() {
        let t0 = Instant::now();
        let (mut control, handle, _) = control(t0);
        let outcome = tick(&mut control, &line(0, 0.9, false, ALL_2048), t0);
        assert_eq!(outcome.mode, Mode::Track);
        assert!(outcome.torque_applied && outcome.wrote);
        for id in 1..=6 {
            assert_eq!(handle.register(id, ADDR_GOAL, 4), Some(2048));
            assert_eq!(handle.register(id, ADDR_TORQUE, 1), Some(1));
        }
        let records = control.sink();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mode, "TRACK");
        assert_eq!(records[0].cmd, [2048; 6]);
        assert_eq!(records[0].pos, [0; 6]);
        assert!(records[0].torque);
    }

    #[test]
    fn test_invalid_line_touches_nothing() {
        let t0 = Instant::now();
        let (mut control, handle, _) = control(t0);
        let raw = r#"{"type":"cmd","seq":1,"ts":1.0,"confidence":0.9,"estop":false,"torque":true,"features":{}}"#;
        match control.handle_line(raw, t0) {
            Err(TickError::Validation(err)) => assert_eq!(err.key(), Some("joints")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(handle.packets().is_empty());
        assert!(control.sink().is_empty());
        assert_eq!(control.stats().rx_count, 0);
    }

    #[test]
    fn test_estop_releases_torque_without_motion() {
        let t0 = Instant::now();
        let (mut control, handle, _) = control(t0);
        let outcome = tick(&mut control, &line(0, 0.9, true, ALL_2048), t0);
        assert_eq!(outcome.mode, Mode::Estop);
        assert!(!outcome.wrote);
        assert_eq!(handle.count_instructions(packet::INST_SYNC_WRITE), 0);
        assert_eq!(handle.register(3, ADDR_TORQUE, 1), Some(0));
        assert!(!control.sink()[0].torque);
    }

    #[test]
    fn test_low_confidence_holds_previous_targets() {
        let t0 = Instant::now();
        let (mut control, handle, _) = control(t0);
        tick(&mut control, &line(0, 0.9, false, ALL_2048), t0);
        handle.clear_packets();
        let outcome = tick(&mut control, &line(1, 0.3, false, r#"{"1":10}"#), t0);
        assert_eq!(outcome.mode, Mode::LowConf);
        assert_eq!(handle.count_instructions(packet::INST_SYNC_WRITE), 0);
        assert_eq!(handle.register(1, ADDR_GOAL, 4), Some(2048));
        assert_eq!(control.sink()[1].cmd, [2048; 6]);
        // torque is still reasserted on a hold tick
        assert_eq!(handle.count_instructions(packet::INST_WRITE), 6);
    }

    #[test]
    fn test_partial_joints_merge_into_held_pose() {
        let t0 = Instant::now();
        let (mut control, handle, _) = control(t0);
        assert_eq!(control.last_targets().get(&2), Some(&2047));
        let spread = r#"{"1":100,"2":200,"3":300,"4":400,"5":500,"6":600}"#;
        tick(&mut control, &line(0, 0.9, false, spread), t0);
        tick(&mut control, &line(1, 0.9, false, r#"{"1":9999}"#), t0);
        assert_eq!(control.sink()[1].cmd, [4095, 200, 300, 400, 500, 600]);
        assert_eq!(handle.register(1, ADDR_GOAL, 4), Some(4095));
        assert_eq!(handle.register(2, ADDR_GOAL, 4), Some(200));
    }

    #[test]
    fn test_bus_failure_abandons_tick() {
        let t0 = Instant::now();
        let (mut control, handle, metrics) = control(t0);
        handle.set_fail_tx(true);
        match control.handle_line(&line(0, 0.9, false, ALL_2048), t0) {
            Err(TickError::Bus(err)) => assert!(err.is_comm()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(metrics.torque_failures.get(), 1);
        assert!(control.sink().is_empty());

        handle.set_fail_tx(false);
        let retry = control.handle_line(&line(1, 0.9, false, ALL_2048), t0);
        assert!(retry.is_ok());
    }

    #[test]
    fn test_stale_low_confidence_soft_holds_then_hard_stops() {
        let t0 = Instant::now();
        let (mut control, handle, _) = control(t0);
        let t_soft = t0 + Duration::from_millis(500);
        let soft = tick(&mut control, &line(0, 0.2, false, ALL_2048), t_soft);
        assert_eq!(soft.mode, Mode::SoftHold);
        assert!(soft.torque_applied);

        let t_hard = t0 + Duration::from_millis(1500);
        let hard = tick(&mut control, &line(1, 0.2, false, ALL_2048), t_hard);
        assert_eq!(hard.mode, Mode::HardStop);
        assert!(!hard.torque_applied);
        assert_eq!(handle.register(1, ADDR_TORQUE, 1), Some(0));
    }

    #[test]
    fn test_idle_releases_torque_once() {
        let t0 = Instant::now();
        let (mut control, handle, metrics) = control(t0);
        control.on_idle(t0 + Duration::from_millis(500));
        assert!(handle.packets().is_empty());

        control.on_idle(t0 + Duration::from_secs(2));
        assert_eq!(control.mode(), Some(Mode::HardStop));
        assert_eq!(handle.register(4, ADDR_TORQUE, 1), Some(0));
        assert_eq!(metrics.torque_applied.get(), 0);
        let sent = handle.packets().len();
        control.on_idle(t0 + Duration::from_secs(3));
        assert_eq!(handle.packets().len(), sent);
    }

    #[test]
    fn test_present_read_is_rate_limited() {
        let t0 = Instant::now();
        let (mut control, handle, _) = control_with(
            PresentRead {
                enabled: true,
                period: Duration::from_millis(100),
            },
            t0,
        );
        for id in 1..=6u8 {
            handle.set_register(id, ADDR_PRESENT, 4, 1000 + i64::from(id));
        }
        let at = |ms| t0 + Duration::from_millis(ms);
        tick(&mut control, &line(0, 0.9, false, ALL_2048), at(50));
        assert_eq!(handle.count_instructions(packet::INST_SYNC_READ), 0);
        tick(&mut control, &line(1, 0.9, false, ALL_2048), at(150));
        tick(&mut control, &line(2, 0.9, false, ALL_2048), at(200));
        assert_eq!(handle.count_instructions(packet::INST_SYNC_READ), 1);
        let records = control.sink();
        assert_eq!(records[0].pos, [0; 6]);
        assert_eq!(records[1].pos, [1001, 1002, 1003, 1004, 1005, 1006]);
        assert_eq!(records[2].pos, records[1].pos);
    }

    #[test]
    fn test_serve_until_disconnect_then_shutdown() {
        let t0 = Instant::now();
        let (mut control, handle, metrics) = control(t0);
        let input = format!(
            "{}\nnot json\n\n{}\n",
            line(0, 0.9, false, ALL_2048),
            line(2, 0.9, false, r#"{"6":100}"#)
        );
        let mut reader = LineReader::new(Cursor::new(input.into_bytes()));
        let flag = AtomicBool::new(false);
        let end = control.serve(&mut reader, &flag);
        assert!(matches!(end, SessionEnd::Connection(ConnectionError::Disconnected)));
        assert_eq!(metrics.lines_received.get(), 3);
        assert_eq!(metrics.lines_dropped.get(), 1);
        assert_eq!(metrics.mode_count(Mode::Track), 2);
        assert_eq!(control.stats().seq_gaps, 1);

        let records = control.shutdown();
        assert_eq!(records.len(), 2);
        for id in 1..=6 {
            assert_eq!(handle.register(id, ADDR_TORQUE, 1), Some(0));
        }
    }

    #[test]
    fn test_serve_stops_on_shutdown_flag() {
        let t0 = Instant::now();
        let (mut control, _, _) = control(t0);
        let input = format!("{}\n", line(0, 0.9, false, ALL_2048));
        let mut reader = LineReader::new(Cursor::new(input.into_bytes()));
        let flag = AtomicBool::new(true);
        assert!(matches!(control.serve(&mut reader, &flag), SessionEnd::Shutdown));
        assert_eq!(control.sink().len(), 1);
    }
}
