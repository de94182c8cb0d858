//! teleop-net: operator link for the arm controller
//!
//! One listener accepts exactly one client and is closed afterwards. The
//! connection is read with a bounded wait and split into trimmed,
//! non-empty lines; an idle wait surfaces as [`ReadEvent::Idle`] so the
//! caller can do housekeeping between commands.

mod error;
pub use error::ConnectionError;

mod listener;
pub use listener::{Connection, IngressListener};

mod lines;
pub use lines::{LineReader, ReadEvent, MAX_LINE_BYTES};

mod stats;
pub use stats::NetStats;

/// Line sequence over an accepted connection.
pub fn lines(conn: Connection) -> LineReader<Connection> {
    LineReader::new(conn)
}
