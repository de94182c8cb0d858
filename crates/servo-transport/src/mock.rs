use crate::packet::{self, Decoded, Frame};
use crate::{BusError, PortInfo, ProtocolVersion, Result, SerialLink};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

const TABLE_SIZE: usize = 256;

/// Model number and firmware returned to a protocol 2.0 ping (XL430-W250).
const PING_REPLY: [u8; 3] = [0x24, 0x04, 0x2D];

#[derive(Default)]
struct MockState {
    tables: BTreeMap<u8, [u8; TABLE_SIZE]>,
    offline: BTreeSet<u8>,
    device_errors: BTreeMap<u8, u8>,
    fail_tx: bool,
    pending: Vec<u8>,
    replies: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
}

/// Shared view of a simulated servo chain. Cloning shares the same servos,
/// so tests keep a handle while the bus owns the link.
#[derive(Clone, Default)]
pub struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    /// Chain with one servo per id. Registers are zeroed apart from the
    /// model number at address 0.
    pub fn new(ids: impl IntoIterator<Item = u8>) -> Self {
        let handle = Self::default();
        {
            let mut state = handle.lock();
            for id in ids {
                let mut table = [0; TABLE_SIZE];
                table[..2].copy_from_slice(&PING_REPLY[..2]);
                state.tables.insert(id, table);
            }
        }
        handle
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// An offline servo ignores everything sent to it.
    pub fn set_offline(&self, id: u8, offline: bool) {
        let mut state = self.lock();
        if offline {
            state.offline.insert(id);
        } else {
            state.offline.remove(&id);
        }
    }

    /// Error byte placed in every status from `id`; 0 clears it.
    pub fn set_device_error(&self, id: u8, code: u8) {
        let mut state = self.lock();
        if code == 0 {
            state.device_errors.remove(&id);
        } else {
            state.device_errors.insert(id, code);
        }
    }

    /// Make every write on the link fail.
    pub fn set_fail_tx(&self, fail: bool) {
        self.lock().fail_tx = fail;
    }

    pub fn register(&self, id: u8, addr: u16, len: u16) -> Option<i64> {
        let state = self.lock();
        let table = state.tables.get(&id)?;
        let range = span(addr, len)?;
        Some(packet::decode_le(&table[range]))
    }

    pub fn set_register(&self, id: u8, addr: u16, len: u16, value: i64) {
        let mut state = self.lock();
        let (Some(table), Some(range), Some(bytes)) = (
            state.tables.get_mut(&id),
            span(addr, len),
            packet::encode_le(value, usize::from(len)),
        ) else {
            return;
        };
        table[range].copy_from_slice(&bytes);
    }

    /// Raw packets written to the link, oldest first.
    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.lock().sent.clone()
    }

    /// Number of packets sent with instruction `inst`.
    pub fn count_instructions(&self, inst: u8) -> usize {
        let state = self.lock();
        state
            .sent
            .iter()
            .filter(|pkt| instruction_of(pkt) == Some(inst))
            .count()
    }

    pub fn clear_packets(&self) {
        self.lock().sent.clear();
    }
}

fn span(addr: u16, len: u16) -> Option<std::ops::Range<usize>> {
    let start = usize::from(addr);
    let end = start + usize::from(len);
    (len > 0 && end <= TABLE_SIZE).then_some(start..end)
}

fn version_of(pkt: &[u8]) -> ProtocolVersion {
    if pkt.starts_with(&[0xFF, 0xFF, 0xFD, 0x00]) {
        ProtocolVersion::V2
    } else {
        ProtocolVersion::V1
    }
}

fn instruction_of(pkt: &[u8]) -> Option<u8> {
    match version_of(pkt) {
        ProtocolVersion::V1 => pkt.get(4).copied(),
        ProtocolVersion::V2 => pkt.get(7).copied(),
    }
}

impl MockState {
    fn status(&mut self, version: ProtocolVersion, id: u8, params: &[u8]) {
        let error = self.device_errors.get(&id).copied().unwrap_or(0);
        let encoded = match version {
            ProtocolVersion::V1 => packet::encode_packet(version, id, error, params),
            ProtocolVersion::V2 => {
                let mut body = vec![error];
                body.extend_from_slice(params);
                packet::encode_packet(version, id, packet::INST_STATUS, &body)
            }
        };
        if let Ok(pkt) = encoded {
            self.replies.extend(pkt);
        }
    }

    fn online(&self, id: u8) -> bool {
        self.tables.contains_key(&id) && !self.offline.contains(&id)
    }

    fn write_table(&mut self, id: u8, addr: usize, data: &[u8]) {
        if self.device_errors.contains_key(&id) {
            return;
        }
        if let Some(table) = self.tables.get_mut(&id) {
            if let Some(dst) = table.get_mut(addr..addr + data.len()) {
                dst.copy_from_slice(data);
            }
        }
    }

    fn read_table(&self, id: u8, addr: usize, len: usize) -> Vec<u8> {
        self.tables
            .get(&id)
            .and_then(|t| t.get(addr..addr + len))
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    fn handle(&mut self, version: ProtocolVersion, frame: Frame) {
        let Some((&inst, params)) = frame.payload.split_first() else {
            return;
        };
        let width = match version {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
        };
        let field = |at: usize| -> Option<usize> {
            let bytes = params.get(at..at + width)?;
            Some(packet::decode_le(bytes) as usize)
        };
        let id = frame.id;
        match inst {
            packet::INST_PING if self.online(id) => match version {
                ProtocolVersion::V1 => self.status(version, id, &[]),
                ProtocolVersion::V2 => self.status(version, id, &PING_REPLY),
            },
            packet::INST_WRITE if self.online(id) => {
                let Some(addr) = field(0) else { return };
                self.write_table(id, addr, &params[width..]);
                self.status(version, id, &[]);
            }
            packet::INST_READ if self.online(id) => {
                let (Some(addr), Some(len)) = (field(0), field(width)) else {
                    return;
                };
                let data = self.read_table(id, addr, len);
                self.status(version, id, &data);
            }
            packet::INST_SYNC_WRITE if id == packet::BROADCAST_ID => {
                let (Some(addr), Some(len)) = (field(0), field(width)) else {
                    return;
                };
                for chunk in params[2 * width..].chunks_exact(len + 1) {
                    if self.online(chunk[0]) {
                        self.write_table(chunk[0], addr, &chunk[1..]);
                    }
                }
            }
            packet::INST_SYNC_READ
                if id == packet::BROADCAST_ID && version == ProtocolVersion::V2 =>
            {
                let (Some(addr), Some(len)) = (field(0), field(width)) else {
                    return;
                };
                for &target in &params[2 * width..] {
                    if self.online(target) {
                        let data = self.read_table(target, addr, len);
                        self.status(version, target, &data);
                    }
                }
            }
            _ => {}
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        loop {
            let version = version_of(&self.pending);
            match packet::decode_frame(version, &self.pending) {
                Decoded::Frame { frame, consumed } => {
                    self.sent.push(self.pending.drain(..consumed).collect());
                    self.handle(version, frame);
                }
                Decoded::Corrupt { consumed, .. } => {
                    self.pending.drain(..consumed);
                }
                Decoded::Incomplete { garbage } => {
                    self.pending.drain(..garbage);
                    break;
                }
            }
        }
    }
}

/// In-process servo chain answering ping, read, write and sync packets.
pub struct MockLink {
    handle: MockHandle,
}

impl MockLink {
    pub fn new(handle: MockHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

impl SerialLink for MockLink {
    /// Simulates servos 1 through 6. A zero baud rate fails like a bad device.
    fn open(path: &str, baudrate: u32) -> Result<Self> {
        if baudrate == 0 {
            return Err(BusError::Open {
                device: path.to_string(),
                reason: "invalid baud rate".into(),
            });
        }
        Ok(Self::new(MockHandle::new(1..=6)))
    }

    fn list() -> Result<Vec<PortInfo>> {
        Ok(vec![PortInfo {
            name: "mock0".to_string(),
            driver: "mock".to_string(),
        }])
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.handle.lock().replies.clear();
        Ok(())
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.handle.lock();
        if state.fail_tx {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock tx failure"));
        }
        state.feed(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.handle.lock();
        if state.replies.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply pending"));
        }
        let n = buf.len().min(state.replies.len());
        for (dst, src) in buf.iter_mut().zip(state.replies.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_zero_baud() {
        assert!(matches!(MockLink::open("mock0", 0), Err(BusError::Open { .. })));
        assert!(MockLink::open("mock0", 57_600).is_ok());
    }

    #[test]
    fn test_ping_reply_v2() {
        let mut link = MockLink::new(MockHandle::new([1]));
        link.write_all(&packet::ping(ProtocolVersion::V2, 1).unwrap())
            .unwrap();
        let mut buf = [0u8; 64];
        let n = link.read(&mut buf).unwrap();
        match packet::decode_frame(ProtocolVersion::V2, &buf[..n]) {
            Decoded::Frame { frame, .. } => {
                let status = packet::status_from_frame(ProtocolVersion::V2, frame).unwrap();
                assert_eq!(status.id, 1);
                assert_eq!(status.params, PING_REPLY.to_vec());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_packet_split_across_writes() {
        let handle = MockHandle::new([2]);
        let mut link = MockLink::new(handle.clone());
        let pkt = packet::write(ProtocolVersion::V2, 2, 116, &[0x00, 0x08, 0x00, 0x00]).unwrap();
        link.write_all(&pkt[..5]).unwrap();
        assert_eq!(handle.register(2, 116, 4), Some(0));
        link.write_all(&pkt[5..]).unwrap();
        assert_eq!(handle.register(2, 116, 4), Some(2048));
        assert_eq!(handle.count_instructions(packet::INST_WRITE), 1);
    }
}
