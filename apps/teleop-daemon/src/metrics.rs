use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use safety_guard::Mode;

/// Counters for one controller run.
#[derive(Clone)]
pub struct LoopMetrics {
    pub registry: Registry,
    pub lines_received: IntCounter,
    pub lines_dropped: IntCounter,
    pub tick_failures: IntCounter,
    pub torque_failures: IntCounter,
    pub ticks: IntCounterVec,
    pub torque_applied: IntGauge,
}

impl LoopMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let lines_received = IntCounter::new(
            "teleop_lines_received",
            "Non-empty lines read from the operator",
        )?;
        let lines_dropped = IntCounter::new(
            "teleop_lines_dropped",
            "Lines rejected by command validation",
        )?;
        let tick_failures =
            IntCounter::new("teleop_tick_failures", "Ticks abandoned on a bus error")?;
        let torque_failures =
            IntCounter::new("teleop_torque_failures", "Failed bulk torque writes")?;
        let ticks = IntCounterVec::new(
            Opts::new("teleop_ticks", "Processed ticks by final mode"),
            &["mode"],
        )?;
        let torque_applied =
            IntGauge::new("teleop_torque_applied", "1 while torque is commanded on")?;
        registry.register(Box::new(lines_received.clone()))?;
        registry.register(Box::new(lines_dropped.clone()))?;
        registry.register(Box::new(tick_failures.clone()))?;
        registry.register(Box::new(torque_failures.clone()))?;
        registry.register(Box::new(ticks.clone()))?;
        registry.register(Box::new(torque_applied.clone()))?;
        Ok(Self {
            registry,
            lines_received,
            lines_dropped,
            tick_failures,
            torque_failures,
            ticks,
            torque_applied,
        })
    }

    pub fn record_mode(&self, mode: Mode) {
        self.ticks.with_label_values(&[mode.as_str()]).inc();
    }

    pub fn mode_count(&self, mode: Mode) -> u64 {
        self.ticks.with_label_values(&[mode.as_str()]).get()
    }

    pub fn set_torque(&self, on: bool) {
        self.torque_applied.set(i64::from(on));
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
