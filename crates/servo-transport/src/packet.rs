//! Dynamixel packet framing for protocol 1.0 and 2.0.
//!
//! A frame is `header | id | length | payload | check`. The first payload
//! byte is the instruction (host to servo) or, in a status packet, the error
//! byte (1.0) or the `0x55` marker followed by the error byte (2.0).

use crate::{BusError, CommResult, ProtocolVersion, Result};

pub const BROADCAST_ID: u8 = 0xFE;

pub const INST_PING: u8 = 0x01;
pub const INST_READ: u8 = 0x02;
pub const INST_WRITE: u8 = 0x03;
pub const INST_SYNC_READ: u8 = 0x82;
pub const INST_SYNC_WRITE: u8 = 0x83;
pub const INST_STATUS: u8 = 0x55;

const HEADER_V1: [u8; 2] = [0xFF, 0xFF];
const HEADER_V2: [u8; 4] = [0xFF, 0xFF, 0xFD, 0x00];
const MAX_LEN_V2: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub id: u8,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// More bytes are needed. The first `garbage` bytes can never start a
    /// frame and may be dropped.
    Incomplete { garbage: usize },
    Frame { frame: Frame, consumed: usize },
    Corrupt {
        consumed: usize,
        reason: &'static str,
    },
}

/// Reply from a single servo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub id: u8,
    pub error: u8,
    pub params: Vec<u8>,
}

/// CRC-16 used by protocol 2.0 (poly 0x8005, init 0, no reflection).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x8005;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Protocol 1.0 checksum over everything after the header.
pub fn checksum_v1(body: &[u8]) -> u8 {
    let sum: u32 = body.iter().map(|&b| u32::from(b)).sum();
    !(sum as u8)
}

fn stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4);
    for (i, &b) in data.iter().enumerate() {
        out.push(b);
        if i >= 2 && data[i - 2..=i] == [0xFF, 0xFF, 0xFD] {
            out.push(0xFD);
        }
    }
    out
}

fn unstuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        out.push(data[i]);
        if out.ends_with(&[0xFF, 0xFF, 0xFD]) && data.get(i + 1) == Some(&0xFD) {
            i += 1;
        }
        i += 1;
    }
    out
}

/// Build a complete packet whose payload is `first` followed by `params`.
pub fn encode_packet(
    version: ProtocolVersion,
    id: u8,
    first: u8,
    params: &[u8],
) -> Result<Vec<u8>> {
    match version {
        ProtocolVersion::V1 => {
            let len = u8::try_from(params.len() + 2)
                .map_err(|_| BusError::InvalidParam("packet too long for protocol 1.0".into()))?;
            let mut pkt = Vec::with_capacity(params.len() + 6);
            pkt.extend_from_slice(&HEADER_V1);
            pkt.extend_from_slice(&[id, len, first]);
            pkt.extend_from_slice(params);
            let check = checksum_v1(&pkt[2..]);
            pkt.push(check);
            Ok(pkt)
        }
        ProtocolVersion::V2 => {
            let mut body = Vec::with_capacity(params.len() + 1);
            body.push(first);
            body.extend_from_slice(params);
            let body = stuff(&body);
            let len = u16::try_from(body.len() + 2)
                .ok()
                .filter(|&l| usize::from(l) <= MAX_LEN_V2)
                .ok_or_else(|| BusError::InvalidParam("packet too long".into()))?;
            let mut pkt = Vec::with_capacity(body.len() + 9);
            pkt.extend_from_slice(&HEADER_V2);
            pkt.push(id);
            pkt.extend_from_slice(&len.to_le_bytes());
            pkt.extend_from_slice(&body);
            let crc = crc16(&pkt);
            pkt.extend_from_slice(&crc.to_le_bytes());
            Ok(pkt)
        }
    }
}

/// Find and verify the first frame in `buf`.
pub fn decode_frame(version: ProtocolVersion, buf: &[u8]) -> Decoded {
    match version {
        ProtocolVersion::V1 => decode_v1(buf),
        ProtocolVersion::V2 => decode_v2(buf),
    }
}

fn find(buf: &[u8], pattern: &[u8]) -> Option<usize> {
    buf.windows(pattern.len()).position(|w| w == pattern)
}

fn decode_v1(buf: &[u8]) -> Decoded {
    let Some(mut start) = find(buf, &HEADER_V1) else {
        return Decoded::Incomplete {
            garbage: buf.len().saturating_sub(1),
        };
    };
    // 0xFF is never a valid id, so a run of 0xFF only starts at its last pair
    while buf.len() > start + 2 && buf[start + 2] == 0xFF {
        start += 1;
    }
    let p = &buf[start..];
    if p.len() < 4 {
        return Decoded::Incomplete { garbage: start };
    }
    let id = p[2];
    let len = usize::from(p[3]);
    if len < 2 {
        return Decoded::Corrupt {
            consumed: start + 4,
            reason: "length",
        };
    }
    let total = 4 + len;
    if p.len() < total {
        return Decoded::Incomplete { garbage: start };
    }
    if checksum_v1(&p[2..total - 1]) != p[total - 1] {
        return Decoded::Corrupt {
            consumed: start + total,
            reason: "checksum",
        };
    }
    Decoded::Frame {
        frame: Frame {
            id,
            payload: p[4..total - 1].to_vec(),
        },
        consumed: start + total,
    }
}

fn decode_v2(buf: &[u8]) -> Decoded {
    let Some(start) = find(buf, &HEADER_V2) else {
        return Decoded::Incomplete {
            garbage: buf.len().saturating_sub(HEADER_V2.len() - 1),
        };
    };
    let p = &buf[start..];
    if p.len() < 7 {
        return Decoded::Incomplete { garbage: start };
    }
    let id = p[4];
    let len = usize::from(u16::from_le_bytes([p[5], p[6]]));
    if !(3..=MAX_LEN_V2).contains(&len) {
        return Decoded::Corrupt {
            consumed: start + HEADER_V2.len(),
            reason: "length",
        };
    }
    let total = 7 + len;
    if p.len() < total {
        return Decoded::Incomplete { garbage: start };
    }
    let crc = u16::from_le_bytes([p[total - 2], p[total - 1]]);
    if crc16(&p[..total - 2]) != crc {
        return Decoded::Corrupt {
            consumed: start + total,
            reason: "crc",
        };
    }
    Decoded::Frame {
        frame: Frame {
            id,
            payload: unstuff(&p[7..total - 2]),
        },
        consumed: start + total,
    }
}

/// Interpret a frame received from the bus as a status packet.
pub fn status_from_frame(
    version: ProtocolVersion,
    frame: Frame,
) -> core::result::Result<Status, CommResult> {
    let (error, params) = match version {
        ProtocolVersion::V1 => match frame.payload.split_first() {
            Some((&error, rest)) => (error, rest.to_vec()),
            None => return Err(CommResult::RxCorrupt("empty status")),
        },
        ProtocolVersion::V2 => match frame.payload.as_slice() {
            [INST_STATUS, error, rest @ ..] => (*error, rest.to_vec()),
            _ => return Err(CommResult::RxCorrupt("not a status packet")),
        },
    };
    Ok(Status {
        id: frame.id,
        error,
        params,
    })
}

/// Register address as sent on the wire (1 byte in 1.0, 2 bytes LE in 2.0).
pub fn field_bytes(version: ProtocolVersion, value: u16) -> Result<Vec<u8>> {
    match version {
        ProtocolVersion::V1 => u8::try_from(value)
            .map(|v| vec![v])
            .map_err(|_| BusError::InvalidParam(format!("{value} exceeds one byte"))),
        ProtocolVersion::V2 => Ok(value.to_le_bytes().to_vec()),
    }
}

/// Unsigned little-endian encoding of `value` in exactly `len` bytes.
pub fn encode_le(value: i64, len: usize) -> Option<Vec<u8>> {
    if value < 0 || len == 0 || len > 8 {
        return None;
    }
    let raw = value as u64;
    if len < 8 && raw >> (8 * len) != 0 {
        return None;
    }
    Some(raw.to_le_bytes()[..len].to_vec())
}

pub fn decode_le(bytes: &[u8]) -> i64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)) as i64
}

pub fn ping(version: ProtocolVersion, id: u8) -> Result<Vec<u8>> {
    encode_packet(version, id, INST_PING, &[])
}

pub fn write(version: ProtocolVersion, id: u8, addr: u16, data: &[u8]) -> Result<Vec<u8>> {
    let mut params = field_bytes(version, addr)?;
    params.extend_from_slice(data);
    encode_packet(version, id, INST_WRITE, &params)
}

pub fn read(version: ProtocolVersion, id: u8, addr: u16, len: u16) -> Result<Vec<u8>> {
    let mut params = field_bytes(version, addr)?;
    params.extend(field_bytes(version, len)?);
    encode_packet(version, id, INST_READ, &params)
}

/// One broadcast packet writing `len` bytes at `addr` for every entry.
pub fn sync_write(
    version: ProtocolVersion,
    addr: u16,
    len: u16,
    entries: &[(u8, Vec<u8>)],
) -> Result<Vec<u8>> {
    let mut params = field_bytes(version, addr)?;
    params.extend(field_bytes(version, len)?);
    for (id, data) in entries {
        if data.len() != usize::from(len) {
            return Err(BusError::InvalidParam(format!(
                "sync write data for id {id} is {} bytes, expected {len}",
                data.len()
            )));
        }
        params.push(*id);
        params.extend_from_slice(data);
    }
    encode_packet(version, BROADCAST_ID, INST_SYNC_WRITE, &params)
}

/// Broadcast read request; each listed id answers with its own status packet.
pub fn sync_read(version: ProtocolVersion, addr: u16, len: u16, ids: &[u8]) -> Result<Vec<u8>> {
    if version == ProtocolVersion::V1 {
        return Err(BusError::Unsupported("sync read requires protocol 2.0"));
    }
    let mut params = field_bytes(version, addr)?;
    params.extend(field_bytes(version, len)?);
    params.extend_from_slice(ids);
    encode_packet(version, BROADCAST_ID, INST_SYNC_READ, &params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0xFEE8);
    }

    #[test]
    fn test_ping_v2_reference_packet() {
        let pkt = ping(ProtocolVersion::V2, 1).unwrap();
        assert_eq!(
            pkt,
            vec![0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x03, 0x00, 0x01, 0x19, 0x4E]
        );
    }

    #[test]
    fn test_ping_v1_reference_packet() {
        let pkt = ping(ProtocolVersion::V1, 1).unwrap();
        assert_eq!(pkt, vec![0xFF, 0xFF, 0x01, 0x02, 0x01, 0xFB]);
    }

    #[test]
    fn test_byte_stuffing_survives_decode() {
        let params = [0xFF, 0xFF, 0xFD, 0x10, 0xFF, 0xFF, 0xFD];
        let pkt = encode_packet(ProtocolVersion::V2, 3, INST_WRITE, &params).unwrap();
        // two stuffed bytes: length covers inst + 7 params + 2 stuff + crc
        assert_eq!(u16::from_le_bytes([pkt[5], pkt[6]]), 12);
        match decode_frame(ProtocolVersion::V2, &pkt) {
            Decoded::Frame { frame, consumed } => {
                assert_eq!(consumed, pkt.len());
                assert_eq!(frame.id, 3);
                assert_eq!(frame.payload[0], INST_WRITE);
                assert_eq!(&frame.payload[1..], &params);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_skips_leading_noise_and_waits_for_tail() {
        let pkt = encode_packet(ProtocolVersion::V2, 2, INST_STATUS, &[0x00, 0x10]).unwrap();
        let mut buf = vec![0x00, 0x13];
        buf.extend_from_slice(&pkt[..6]);
        assert_eq!(
            decode_frame(ProtocolVersion::V2, &buf),
            Decoded::Incomplete { garbage: 2 }
        );
        buf.extend_from_slice(&pkt[6..]);
        match decode_frame(ProtocolVersion::V2, &buf) {
            Decoded::Frame { frame, consumed } => {
                assert_eq!(consumed, buf.len());
                let status = status_from_frame(ProtocolVersion::V2, frame).unwrap();
                assert_eq!(status.id, 2);
                assert_eq!(status.error, 0);
                assert_eq!(status.params, vec![0x10]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_checksum_detected() {
        let mut pkt = encode_packet(ProtocolVersion::V1, 4, 0x00, &[0x01, 0x02]).unwrap();
        let last = pkt.len() - 1;
        pkt[last] ^= 0xFF;
        assert!(matches!(
            decode_frame(ProtocolVersion::V1, &pkt),
            Decoded::Corrupt {
                reason: "checksum",
                ..
            }
        ));
    }

    #[test]
    fn test_le_encoding_bounds() {
        assert_eq!(encode_le(2048, 4), Some(vec![0x00, 0x08, 0x00, 0x00]));
        assert_eq!(encode_le(0x1234, 2), Some(vec![0x34, 0x12]));
        assert_eq!(encode_le(65536, 2), None);
        assert_eq!(encode_le(-1, 4), None);
        assert_eq!(decode_le(&[0x00, 0x08, 0x00, 0x00]), 2048);
    }

    #[test]
    fn test_sync_read_needs_v2() {
        assert!(matches!(
            sync_read(ProtocolVersion::V1, 36, 2, &[1, 2]),
            Err(BusError::Unsupported(_))
        ));
    }

    #[test]
    fn test_sync_write_layout_v1() {
        let pkt = sync_write(
            ProtocolVersion::V1,
            30,
            2,
            &[(1, vec![0x00, 0x02]), (2, vec![0x10, 0x01])],
        )
        .unwrap();
        assert_eq!(&pkt[..5], &[0xFF, 0xFF, BROADCAST_ID, 10, INST_SYNC_WRITE]);
        assert_eq!(&pkt[5..13], &[30, 2, 1, 0x00, 0x02, 2, 0x10, 0x01]);
    }
}
