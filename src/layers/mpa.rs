//! MPA framing (RFC 5044): the FPDU layer between TCP and DDP for
//! iWARP connections.
//!
//! Carving happens against the reassembled TCP stream: the connection
//! setup exchange is recognized by its 16-byte key strings, after which
//! the stream is a sequence of FPDUs (2-byte ULPDU length, payload, pad
//! to a 4-byte boundary, CRC32c). Marker insertion is not supported; a
//! connection that negotiates markers is left undecoded.

use byteorder::{BigEndian, ByteOrder};
use tracing::warn;

use crate::matcher::Value;

const REQ_KEY: &[u8; 16] = b"MPA ID Req Frame";
const REP_KEY: &[u8; 16] = b"MPA ID Rep Frame";

const MPA_CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpaFrameType {
    Request,
    Reply,
    Fpdu,
}

/// One MPA frame: either half of the connection setup exchange or an
/// FPDU carrying a ULPDU.
#[derive(Debug, Clone)]
pub struct Mpa {
    pub frame_type: MpaFrameType,
    /// Marker insertion negotiated (setup frames only).
    pub markers: bool,
    /// CRC32c negotiated (setup frames only).
    pub crc: bool,
    /// Connection rejected (reply frames only).
    pub rejected: bool,
    pub revision: u8,
    pub private_data: Vec<u8>,
    pub ulpdu_len: u16,
    pub crc32: Option<u32>,
    pub crc_ok: Option<bool>,
}

impl Mpa {
    fn setup(frame_type: MpaFrameType, flags: u8, revision: u8, private_data: Vec<u8>) -> Self {
        Self {
            frame_type,
            markers: flags & 0x80 != 0,
            crc: flags & 0x40 != 0,
            rejected: flags & 0x20 != 0,
            revision,
            private_data,
            ulpdu_len: 0,
            crc32: None,
            crc_ok: None,
        }
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "type" => Some(Value::Str(
                match self.frame_type {
                    MpaFrameType::Request => "request",
                    MpaFrameType::Reply => "reply",
                    MpaFrameType::Fpdu => "fpdu",
                }
                .to_string(),
            )),
            "markers" => Some(Value::Bool(self.markers)),
            "crc" => Some(Value::Bool(self.crc)),
            "rejected" => Some(Value::Bool(self.rejected)),
            "revision" => Some(Value::Int(self.revision as i64)),
            "private_data" => Some(Value::Bytes(self.private_data.clone())),
            "ulpdu_len" => Some(Value::Int(self.ulpdu_len as i64)),
            "crc32" => self.crc32.map(|v| Value::Int(v as i64)),
            "crc_ok" => self.crc_ok.map(Value::Bool),
            _ => None,
        }
    }
}

/// Tries to carve an MPA connection setup frame off the front of the
/// stream buffer. `None` means the stream does not start with a setup
/// frame at all; `Some(Err(()))` means more bytes are needed.
pub fn carve_setup(buf: &mut Vec<u8>) -> Option<Result<Mpa, ()>> {
    let probe_len = buf.len().min(16);
    let frame_type = if buf.len() < 16 {
        if REQ_KEY[..probe_len] == buf[..probe_len] || REP_KEY[..probe_len] == buf[..probe_len] {
            return Some(Err(()));
        }
        return None;
    } else if buf[..16] == REQ_KEY[..] {
        MpaFrameType::Request
    } else if buf[..16] == REP_KEY[..] {
        MpaFrameType::Reply
    } else {
        return None;
    };

    if buf.len() < 20 {
        return Some(Err(()));
    }
    let flags = buf[16];
    let revision = buf[17];
    let pd_length = BigEndian::read_u16(&buf[18..20]) as usize;
    if buf.len() < 20 + pd_length {
        return Some(Err(()));
    }
    let private_data = buf[20..20 + pd_length].to_vec();
    buf.drain(..20 + pd_length);
    Some(Ok(Mpa::setup(frame_type, flags, revision, private_data)))
}

/// Tries to carve one FPDU off the front of the stream buffer. Returns
/// the frame header and the ULPDU payload, or `None` when the buffer
/// does not yet hold a whole FPDU.
pub fn carve_fpdu(buf: &mut Vec<u8>, crc_enabled: bool) -> Option<(Mpa, Vec<u8>)> {
    if buf.len() < 2 {
        return None;
    }
    let ulpdu_len = BigEndian::read_u16(&buf[..2]) as usize;
    let pad = (4 - (2 + ulpdu_len) % 4) % 4;
    let total = 2 + ulpdu_len + pad + 4;
    if buf.len() < total {
        return None;
    }
    let payload = buf[2..2 + ulpdu_len].to_vec();
    let crc32 = BigEndian::read_u32(&buf[total - 4..total]);
    let crc_ok = if crc_enabled {
        let computed = MPA_CRC.checksum(&buf[..total - 4]);
        if computed != crc32 {
            warn!(expected = crc32, computed, "MPA FPDU CRC mismatch");
        }
        Some(computed == crc32)
    } else {
        None
    };
    buf.drain(..total);
    Some((
        Mpa {
            frame_type: MpaFrameType::Fpdu,
            markers: false,
            crc: crc_enabled,
            rejected: false,
            revision: 0,
            private_data: Vec::new(),
            ulpdu_len: ulpdu_len as u16,
            crc32: Some(crc32),
            crc_ok,
        },
        payload,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_frame_carves_with_private_data() {
        let mut buf = Vec::new();
        buf.extend_from_slice(REQ_KEY);
        buf.push(0x40); // CRC, no markers
        buf.push(1);
        buf.extend_from_slice(&2u16.to_be_bytes());
        buf.extend_from_slice(&[0xAB, 0xCD]);
        buf.extend_from_slice(&[0xFF; 3]); // trailing stream bytes stay

        let frame = carve_setup(&mut buf).unwrap().unwrap();
        assert_eq!(frame.frame_type, MpaFrameType::Request);
        assert!(frame.crc);
        assert!(!frame.markers);
        assert_eq!(frame.private_data, vec![0xAB, 0xCD]);
        assert_eq!(buf, vec![0xFF; 3]);
    }

    #[test]
    fn fpdu_needs_full_frame() {
        // 5-byte ULPDU: 2 + 5 = 7, pad 1, crc 4 → 12 total
        let mut frame = Vec::new();
        frame.extend_from_slice(&5u16.to_be_bytes());
        frame.extend_from_slice(&[1, 2, 3, 4, 5, 0]);
        let crc = MPA_CRC.checksum(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());

        let mut partial = frame[..frame.len() - 1].to_vec();
        assert!(carve_fpdu(&mut partial, true).is_none());

        let mut buf = frame;
        let (mpa, payload) = carve_fpdu(&mut buf, true).unwrap();
        assert_eq!(payload, vec![1, 2, 3, 4, 5]);
        assert_eq!(mpa.ulpdu_len, 5);
        assert_eq!(mpa.crc_ok, Some(true));
        assert!(buf.is_empty());
    }
}
