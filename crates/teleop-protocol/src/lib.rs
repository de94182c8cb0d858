//! teleop-protocol: wire commands and tick records for the arm teleoperation link
//!
//! Operator-side senders stream one JSON object per line over TCP. This crate
//! turns such a line into a strongly typed [`Command`] (validating every field
//! exactly once) and defines the per-tick record the controller persists for
//! later replay.

mod types;
pub use types::{Command, JointTargets, MAX_MOTOR_ID, MIN_MOTOR_ID};

mod error;
pub use error::{Result, ValidationError};

mod validate;
pub use validate::{decode, parse_line, validate};

pub mod record;
pub use record::{TickLogReader, TickLogWriter, TickRecord, JOINT_COUNT};
