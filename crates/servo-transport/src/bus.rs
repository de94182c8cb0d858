use crate::packet::{self, Decoded, Status};
use crate::{
    BusConfig, BusError, CommResult, ProtocolVersion, Result, SerialLink, TorqueAllError,
};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Model number register, at the same place in every control table.
const ADDR_MODEL_NUMBER: u16 = 0;

/// Driver for a chain of servos sharing one serial link.
///
/// All operations are blocking and bounded by the configured packet timeout.
pub struct ServoBus<L: SerialLink> {
    config: BusConfig,
    ids: Vec<u8>,
    link: Option<L>,
    rx: Vec<u8>,
}

impl<L: SerialLink> ServoBus<L> {
    pub fn new(config: BusConfig, ids: impl IntoIterator<Item = u8>) -> Self {
        Self {
            config,
            ids: ids.into_iter().collect(),
            link: None,
            rx: Vec::new(),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Servo ids addressed by bulk operations, in bus order.
    pub fn ids(&self) -> &[u8] {
        &self.ids
    }

    fn version(&self) -> ProtocolVersion {
        self.config.protocol_version
    }

    /// Open the configured device. A no-op if already open.
    pub fn open(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }
        let link = L::open(&self.config.device, self.config.baudrate)?;
        info!(
            device = %self.config.device,
            baudrate = self.config.baudrate,
            protocol = f64::from(self.version()),
            "servo bus open"
        );
        self.attach(link);
        Ok(())
    }

    /// Use an already opened link.
    pub fn attach(&mut self, link: L) {
        self.rx.clear();
        self.link = Some(link);
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    pub fn close(&mut self) {
        if self.link.take().is_some() {
            self.rx.clear();
            debug!(device = %self.config.device, "servo bus closed");
        }
    }

    /// True only if the servo answered without an error flag.
    pub fn ping(&mut self, id: u8) -> bool {
        let Ok(pkt) = packet::ping(self.version(), id) else {
            return false;
        };
        match self.transact(id, &pkt) {
            Ok(status) => status.error == 0,
            Err(err) => {
                debug!(id, %err, "ping failed");
                false
            }
        }
    }

    pub fn torque_enable(&mut self, id: u8, enable: bool) -> Result<()> {
        let pkt = packet::write(
            self.version(),
            id,
            self.config.addr_torque_enable,
            &[u8::from(enable)],
        )?;
        let status = self.transact(id, &pkt)?;
        if status.error != 0 {
            return Err(BusError::Device {
                id,
                code: status.error,
            });
        }
        Ok(())
    }

    /// Write torque for every id in order, stopping at the first failure.
    pub fn torque_all(&mut self, enable: bool) -> Result<(), TorqueAllError> {
        let mut applied = Vec::with_capacity(self.ids.len());
        for id in self.ids.clone() {
            if let Err(source) = self.torque_enable(id, enable) {
                return Err(TorqueAllError {
                    applied,
                    failed_id: id,
                    source,
                });
            }
            applied.push(id);
        }
        trace!(enable, count = applied.len(), "torque written");
        Ok(())
    }

    /// Broadcast goal positions for the known ids present in `targets`.
    /// Ids outside the bus are ignored; nothing is sent if none remain.
    pub fn sync_write_positions(&mut self, targets: &BTreeMap<u8, i64>) -> Result<()> {
        let len = self.config.len_goal_position;
        let mut entries = Vec::with_capacity(targets.len());
        for &id in &self.ids {
            let Some(&goal) = targets.get(&id) else {
                continue;
            };
            let data = packet::encode_le(goal, usize::from(len)).ok_or_else(|| {
                BusError::InvalidParam(format!(
                    "goal {goal} for id {id} does not fit in {len} bytes"
                ))
            })?;
            entries.push((id, data));
        }
        if entries.is_empty() {
            trace!("sync write skipped, no known ids");
            return Ok(());
        }
        let pkt = packet::sync_write(
            self.version(),
            self.config.addr_goal_position,
            len,
            &entries,
        )?;
        self.send(&pkt).map_err(|r| BusError::comm(None, r))
    }

    /// Read present position from every id in one broadcast.
    ///
    /// Ids that did not answer are left out. Fails only when nobody answered.
    pub fn sync_read_positions(&mut self) -> Result<BTreeMap<u8, i64>> {
        let addr = self.config.addr_present_position;
        let len = self.config.len_present_position;
        let pkt = packet::sync_read(self.version(), addr, len, &self.ids)?;
        self.send(&pkt).map_err(|r| BusError::comm(None, r))?;

        let deadline = Instant::now() + self.config.packet_timeout() * self.ids.len().max(1) as u32;
        let mut positions = BTreeMap::new();
        let mut last_err = None;
        while positions.len() < self.ids.len() {
            match self.receive(deadline) {
                Ok(status) if !self.ids.contains(&status.id) => {
                    trace!(id = status.id, "sync read: status from unknown id");
                }
                Ok(status) if status.params.len() >= usize::from(len) => {
                    if status.error != 0 {
                        debug!(
                            id = status.id,
                            code = status.error,
                            "sync read: device flag set"
                        );
                    }
                    let value = packet::decode_le(&status.params[..usize::from(len)]);
                    positions.insert(status.id, value);
                }
                Ok(status) => {
                    debug!(
                        id = status.id,
                        got = status.params.len(),
                        "sync read: short data"
                    );
                }
                Err(CommResult::RxTimeout) => {
                    last_err = Some(CommResult::RxTimeout);
                    break;
                }
                Err(result) => {
                    debug!(%result, "sync read: bad packet");
                    last_err = Some(result);
                }
            }
        }
        if positions.is_empty() {
            if let Some(result) = last_err {
                return Err(BusError::comm(None, result));
            }
        }
        if positions.len() < self.ids.len() {
            debug!(
                missing = self.ids.len() - positions.len(),
                "sync read incomplete"
            );
        }
        Ok(positions)
    }

    /// Read `len` bytes at `addr` from one servo.
    pub fn read_register(&mut self, id: u8, addr: u16, len: u16) -> Result<i64> {
        let pkt = packet::read(self.version(), id, addr, len)?;
        let status = self.transact(id, &pkt)?;
        if status.error != 0 {
            return Err(BusError::Device {
                id,
                code: status.error,
            });
        }
        let len = usize::from(len);
        if status.params.len() < len {
            return Err(BusError::comm(Some(id), CommResult::RxCorrupt("short read")));
        }
        Ok(packet::decode_le(&status.params[..len]))
    }

    pub fn model_number(&mut self, id: u8) -> Result<u16> {
        let model = self.read_register(id, ADDR_MODEL_NUMBER, 2)?;
        u16::try_from(model).map_err(|_| BusError::comm(Some(id), CommResult::RxCorrupt("model")))
    }

    fn send(&mut self, pkt: &[u8]) -> core::result::Result<(), CommResult> {
        let link = self.link.as_mut().ok_or(CommResult::PortClosed)?;
        if let Err(err) = link.clear_input() {
            warn!(%err, "failed to clear input buffer");
        }
        self.rx.clear();
        link.write_all(pkt)
            .and_then(|()| link.flush())
            .map_err(|e| CommResult::TxFail(e.to_string()))
    }

    /// Send `pkt` and wait for the status packet from `id`.
    fn transact(&mut self, id: u8, pkt: &[u8]) -> Result<Status> {
        self.send(pkt).map_err(|r| BusError::comm(Some(id), r))?;
        let deadline = Instant::now() + self.config.packet_timeout();
        let mut stray = None;
        loop {
            match self.receive(deadline) {
                Ok(status) if status.id == id => return Ok(status),
                Ok(status) => {
                    trace!(expected = id, got = status.id, "status from another id");
                    stray = Some(status.id);
                }
                Err(CommResult::RxTimeout) => {
                    let result = match stray {
                        Some(got) => CommResult::IdMismatch { expected: id, got },
                        None => CommResult::RxTimeout,
                    };
                    return Err(BusError::comm(Some(id), result));
                }
                Err(result) => return Err(BusError::comm(Some(id), result)),
            }
        }
    }

    /// Next status packet on the wire, or `RxTimeout` once `deadline` passes.
    fn receive(&mut self, deadline: Instant) -> core::result::Result<Status, CommResult> {
        let version = self.version();
        let mut buf = [0u8; 256];
        loop {
            match packet::decode_frame(version, &self.rx) {
                Decoded::Frame { frame, consumed } => {
                    self.rx.drain(..consumed);
                    match packet::status_from_frame(version, frame) {
                        Ok(status) => return Ok(status),
                        // echo of our own instruction on half-duplex adapters
                        Err(_) => continue,
                    }
                }
                Decoded::Corrupt { consumed, reason } => {
                    self.rx.drain(..consumed);
                    return Err(CommResult::RxCorrupt(reason));
                }
                Decoded::Incomplete { garbage } => {
                    self.rx.drain(..garbage);
                }
            }
            if Instant::now() >= deadline {
                return Err(CommResult::RxTimeout);
            }
            let link = self.link.as_mut().ok_or(CommResult::PortClosed)?;
            match link.read(&mut buf) {
                Ok(0) => std::thread::yield_now(),
                Ok(n) => self.rx.extend_from_slice(&buf[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    std::thread::yield_now()
                }
                Err(e) => return Err(CommResult::RxFail(e.to_string())),
            }
        }
    }
}
