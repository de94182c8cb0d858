use crate::StalePolicy;
use std::time::Duration;

/// Grades the age of the last trusted command against two thresholds.
///
/// The watchdog keeps no clock of its own; callers pass the age measured
/// from [`SafetyState::last_good_command_time`](crate::SafetyState).
#[derive(Debug, Clone)]
pub struct StalenessWatchdog {
    stale_timeout: Duration,
    hard_stop_timeout: Duration,
    consecutive_stale: u32,
}

impl StalenessWatchdog {
    /// `stale_timeout` is expected to be shorter than `hard_stop_timeout`.
    pub fn new(stale_timeout: Duration, hard_stop_timeout: Duration) -> Self {
        Self {
            stale_timeout,
            hard_stop_timeout,
            consecutive_stale: 0,
        }
    }

    /// Thresholds are exclusive: an age equal to a timeout is not yet past it.
    pub fn check(&mut self, age: Duration) -> StalePolicy {
        let policy = if age > self.hard_stop_timeout {
            StalePolicy::HardStop
        } else if age > self.stale_timeout {
            StalePolicy::SoftHold
        } else {
            StalePolicy::Ok
        };
        if policy == StalePolicy::Ok {
            self.consecutive_stale = 0;
        } else {
            self.consecutive_stale = self.consecutive_stale.saturating_add(1);
        }
        policy
    }

    /// Checks in a row that found the link stale.
    pub fn consecutive_stale(&self) -> u32 {
        self.consecutive_stale
    }
}
