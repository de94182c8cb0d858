//! Per-tick record persisted by the controller (NDJSON `.ticklog` files).
//!
//! The first line is a header object; every following line is one
//! [`TickRecord`]. Commanded and read-back positions are always six wide
//! (motor ids 1..=6), zero-filled where nothing was available.

use crate::types::JointTargets;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// Number of joints carried in each record.
pub const JOINT_COUNT: usize = 6;

const FORMAT: &str = "ticklog";
const VERSION: u32 = 1;
const FLUSH_EVERY: u64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    /// Controller wall clock, seconds since the Unix epoch.
    pub wall_s: f64,
    pub seq: u64,
    pub confidence: f64,
    pub mode: String,
    pub estop: bool,
    pub torque: bool,
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
    pub cmd: [i64; JOINT_COUNT],
    pub pos: [i64; JOINT_COUNT],
}

impl TickRecord {
    /// Flatten a target map into the fixed six-joint layout.
    pub fn joint_array(targets: Option<&JointTargets>) -> [i64; JOINT_COUNT] {
        let mut out = [0i64; JOINT_COUNT];
        if let Some(targets) = targets {
            for (slot, id) in out.iter_mut().zip(1u8..) {
                *slot = targets.get(&id).copied().unwrap_or(0);
            }
        }
        out
    }

    /// Commanded targets keyed by motor id.
    pub fn cmd_targets(&self) -> JointTargets {
        (1u8..).zip(self.cmd.iter().copied()).collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TickLogHeader {
    format: String,
    version: u32,
    started: String,
}

/// Current wall clock as fractional Unix seconds.
pub fn wall_time_s() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}

pub struct TickLogWriter<W: Write> {
    out: W,
    rows: u64,
}

impl TickLogWriter<BufWriter<File>> {
    /// Create `run_<unix seconds>.ticklog` inside `dir` (created if needed).
    pub fn create_in(dir: impl AsRef<Path>) -> io::Result<(Self, PathBuf)> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "run_{}.ticklog",
            OffsetDateTime::now_utc().unix_timestamp()
        ));
        let file = File::create(&path)?;
        let writer = Self::new(BufWriter::new(file))?;
        Ok((writer, path))
    }
}

impl<W: Write> TickLogWriter<W> {
    pub fn new(mut out: W) -> io::Result<Self> {
        let started = OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();
        let header = TickLogHeader {
            format: FORMAT.to_string(),
            version: VERSION,
            started,
        };
        serde_json::to_writer(&mut out, &header)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(Self { out, rows: 0 })
    }

    pub fn write(&mut self, record: &TickRecord) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.rows += 1;
        if self.rows % FLUSH_EVERY == 0 {
            self.out.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Flush and hand back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Iterates the records of a tick log. Blank lines are skipped.
pub struct TickLogReader<R: BufRead> {
    lines: io::Lines<R>,
}

impl<R: BufRead> TickLogReader<R> {
    pub fn new(mut reader: R) -> io::Result<Self> {
        let mut first = String::new();
        reader.read_line(&mut first)?;
        let header: TickLogHeader = serde_json::from_str(first.trim())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if header.format != FORMAT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("not a tick log: format={}", header.format),
            ));
        }
        Ok(Self {
            lines: reader.lines(),
        })
    }
}

impl<R: BufRead> Iterator for TickLogReader<R> {
    type Item = io::Result<TickRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(l) => l,
                Err(e) => return Some(Err(e)),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str(&line)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            );
        }
    }
}
