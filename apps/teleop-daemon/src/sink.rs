use std::io::{self, Write};
use teleop_protocol::{TickLogWriter, TickRecord};

/// Destination for the per-tick records.
pub trait TickSink {
    fn record(&mut self, record: &TickRecord) -> io::Result<()>;

    /// Called once at shutdown.
    fn stop(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: Write> TickSink for TickLogWriter<W> {
    fn record(&mut self, record: &TickRecord) -> io::Result<()> {
        self.write(record)
    }

    fn stop(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl TickSink for Vec<TickRecord> {
    fn record(&mut self, record: &TickRecord) -> io::Result<()> {
        self.push(record.clone());
        Ok(())
    }
}
