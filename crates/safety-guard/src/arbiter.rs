use crate::{
    Actuation, ArbiterInput, Decision, Mode, SafetyState, StalePolicy, StalenessWatchdog,
};
use robot_config::CalibrationSet;
use std::time::{Duration, Instant};
use teleop_protocol::{Command, JointTargets};
use tracing::{debug, warn};

/// Minimum confidence for a command's joints to be honored. Applied here
/// regardless of any gate the sender runs.
pub const CONFIDENCE_THRESHOLD: f64 = 0.60;

/// Feature that requests the home pose when at or above [`HOME_THRESHOLD`].
pub const HOME_FEATURE: &str = "home";
pub const HOME_THRESHOLD: f64 = 0.5;

impl ArbiterInput {
    pub fn from_command(cmd: &Command) -> Self {
        Self {
            seq: cmd.seq,
            estop: cmd.estop,
            torque: cmd.torque,
            confidence_ok: cmd.confidence >= CONFIDENCE_THRESHOLD,
            home_requested: cmd.feature(HOME_FEATURE).unwrap_or(0.0) >= HOME_THRESHOLD,
            joints: cmd.joints.clone(),
        }
    }
}

pub struct SafetyArbiter {
    calibration: CalibrationSet,
    home_pose: JointTargets,
    state: SafetyState,
    watchdog: StalenessWatchdog,
}

impl SafetyArbiter {
    /// Home pose defaults to the middle of each calibrated range.
    pub fn new(
        calibration: CalibrationSet,
        stale_timeout: Duration,
        hard_stop_timeout: Duration,
        now: Instant,
    ) -> Self {
        let home_pose = calibration.midpoints();
        Self {
            calibration,
            home_pose,
            state: SafetyState::new(now),
            watchdog: StalenessWatchdog::new(stale_timeout, hard_stop_timeout),
        }
    }

    pub fn state(&self) -> &SafetyState {
        &self.state
    }

    pub fn calibration(&self) -> &CalibrationSet {
        &self.calibration
    }

    pub fn home_pose(&self) -> &JointTargets {
        &self.home_pose
    }

    pub fn set_home_pose(&mut self, pose: JointTargets) {
        self.home_pose = pose;
    }

    /// Limit each target to its calibrated travel. Ids without calibration
    /// are dropped.
    pub fn clamp(&self, joints: &JointTargets) -> JointTargets {
        let mut out = JointTargets::new();
        for (&id, &value) in joints {
            match self.calibration.get(id) {
                Some(calib) => {
                    out.insert(id, calib.clamp(value));
                }
                None => warn!(motor_id = id, "dropping target for uncalibrated motor"),
            }
        }
        out
    }

    /// Command-driven decision. Estop wins, then home, then the confidence
    /// gate; anything else holds the last pose.
    pub fn apply(&mut self, input: &ArbiterInput, now: Instant) -> Decision {
        self.state.estop = input.estop;
        self.state.torque = input.torque;

        if self.state.estop {
            return Decision {
                mode: Mode::Estop,
                torque: false,
                joints: None,
            };
        }

        if input.home_requested {
            return Decision {
                mode: Mode::Home,
                torque: self.state.torque,
                joints: Some(self.clamp(&self.home_pose)),
            };
        }

        if input.confidence_ok {
            self.state.last_good_command_time = now;
            self.state.last_good_seq = Some(input.seq);
            return Decision {
                mode: Mode::Track,
                torque: self.state.torque,
                joints: Some(self.clamp(&input.joints)),
            };
        }

        Decision {
            mode: Mode::LowConf,
            torque: self.state.torque,
            joints: None,
        }
    }

    pub fn stale_policy(&mut self, now: Instant) -> StalePolicy {
        let age = self.command_age(now);
        self.watchdog.check(age)
    }

    /// Time since the last TRACK decision, or since construction.
    pub fn command_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.last_good_command_time)
    }

    /// Apply the staleness override and derive the permitted writes.
    pub fn resolve(&mut self, decision: Decision, now: Instant) -> Actuation {
        let policy = self.stale_policy(now);
        let mode = match (policy, decision.mode) {
            (StalePolicy::HardStop, _) => Mode::HardStop,
            (StalePolicy::SoftHold, Mode::LowConf) => Mode::SoftHold,
            (_, mode) => mode,
        };
        if mode != decision.mode {
            debug!(
                from = %decision.mode,
                to = %mode,
                age_ms = self.command_age(now).as_millis() as u64,
                stale_checks = self.watchdog.consecutive_stale(),
                "staleness override"
            );
        }
        let hard_stop = mode == Mode::HardStop;
        Actuation {
            mode,
            torque_applied: decision.torque && !hard_stop,
            write: decision.joints.filter(|_| !hard_stop),
        }
    }

    /// `apply` followed by `resolve` at the same instant.
    pub fn evaluate(&mut self, input: &ArbiterInput, now: Instant) -> Actuation {
        let decision = self.apply(input, now);
        self.resolve(decision, now)
    }
}
