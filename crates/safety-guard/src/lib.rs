//! safety-guard: final safety authority between operator commands and servos
//!
//! - [`SafetyArbiter`] turns each command into a [`Decision`] by precedence:
//!   estop, home request, confidence gate, otherwise hold.
//! - The [`StalenessWatchdog`] degrades the decision when trusted commands
//!   stop arriving.
//! - [`Actuation`] is what the control loop is actually allowed to do.
//!
//! All time-dependent calls take an explicit [`std::time::Instant`].

mod types;
pub use types::{Actuation, ArbiterInput, Decision, Mode, SafetyState, StalePolicy};

mod arbiter;
pub use arbiter::{SafetyArbiter, CONFIDENCE_THRESHOLD, HOME_FEATURE, HOME_THRESHOLD};

mod watchdogs;
pub use watchdogs::StalenessWatchdog;
