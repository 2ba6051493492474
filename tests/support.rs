//! Shared builders for the integration tests: in-memory pcap synthesis
//! and frame construction for every protocol stack the engine decodes.
//!
//! Everything is byte-level on purpose; the tests must exercise the
//! real decoders, not mirrors of their logic.
#![allow(dead_code)]

use std::io::Write;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;

pub const LINKTYPE_ETHERNET: u32 = 1;

/// One capture record: `(ts_sec, ts_usec, frame bytes)`.
pub type TestRecord = (u32, u32, Vec<u8>);

pub fn pcap_bytes(link_type: u32, big_endian: bool, records: &[TestRecord]) -> Vec<u8> {
    fn put32(out: &mut Vec<u8>, big: bool, v: u32) {
        let mut b = [0u8; 4];
        if big {
            BigEndian::write_u32(&mut b, v);
        } else {
            LittleEndian::write_u32(&mut b, v);
        }
        out.extend_from_slice(&b);
    }
    fn put16(out: &mut Vec<u8>, big: bool, v: u16) {
        let mut b = [0u8; 2];
        if big {
            BigEndian::write_u16(&mut b, v);
        } else {
            LittleEndian::write_u16(&mut b, v);
        }
        out.extend_from_slice(&b);
    }

    let mut out = Vec::new();
    put32(&mut out, big_endian, 0xA1B2_C3D4);
    put16(&mut out, big_endian, 2);
    put16(&mut out, big_endian, 4);
    put32(&mut out, big_endian, 0); // thiszone
    put32(&mut out, big_endian, 0); // sigfigs
    put32(&mut out, big_endian, 65535); // snaplen
    put32(&mut out, big_endian, link_type);
    for (ts_sec, ts_usec, data) in records {
        put32(&mut out, big_endian, *ts_sec);
        put32(&mut out, big_endian, *ts_usec);
        put32(&mut out, big_endian, data.len() as u32);
        put32(&mut out, big_endian, data.len() as u32);
        out.extend_from_slice(data);
    }
    out
}

pub fn write_capture(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(bytes).expect("write capture");
    file.flush().expect("flush capture");
    file
}

pub fn write_pcap(link_type: u32, big_endian: bool, records: &[TestRecord]) -> NamedTempFile {
    write_capture(&pcap_bytes(link_type, big_endian, records))
}

pub fn write_pcap_gz(link_type: u32, big_endian: bool, records: &[TestRecord]) -> NamedTempFile {
    let plain = pcap_bytes(link_type, big_endian, records);
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&plain).expect("gzip");
    let compressed = enc.finish().expect("gzip finish");
    write_capture(&compressed)
}

// --- link / internet / transport builders -------------------------------

pub fn eth(etype: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(14 + payload.len());
    out.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
    out.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
    out.extend_from_slice(&etype.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn vlan_tag(vid: u16, etype: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&vid.to_be_bytes());
    out.extend_from_slice(&etype.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn ipv4(src: [u8; 4], dst: [u8; 4], protocol: u8, payload: &[u8]) -> Vec<u8> {
    ipv4_frag(src, dst, protocol, 0, 0, false, payload)
}

/// `frag_offset` is in bytes and must be a multiple of 8.
pub fn ipv4_frag(
    src: [u8; 4],
    dst: [u8; 4],
    protocol: u8,
    id: u16,
    frag_offset: usize,
    more_fragments: bool,
    payload: &[u8],
) -> Vec<u8> {
    assert_eq!(frag_offset % 8, 0, "fragment offsets are 8-byte units");
    let total_len = 20 + payload.len();
    let mut flags_frag = (frag_offset / 8) as u16;
    if more_fragments {
        flags_frag |= 0x2000;
    }
    let mut out = Vec::with_capacity(total_len);
    out.push(0x45);
    out.push(0);
    out.extend_from_slice(&(total_len as u16).to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&flags_frag.to_be_bytes());
    out.push(64); // ttl
    out.push(protocol);
    out.extend_from_slice(&[0, 0]); // checksum unverified
    out.extend_from_slice(&src);
    out.extend_from_slice(&dst);
    out.extend_from_slice(payload);
    out
}

pub const TCP_SYN: u16 = 0x002;
pub const TCP_ACK: u16 = 0x010;
pub const TCP_PSH: u16 = 0x008;

pub fn tcp_seg(src_port: u16, dst_port: u16, seq: u32, flags: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(20 + payload.len());
    out.extend_from_slice(&src_port.to_be_bytes());
    out.extend_from_slice(&dst_port.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes()); // ack
    out.extend_from_slice(&((5u16 << 12) | flags).to_be_bytes());
    out.extend_from_slice(&8192u16.to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent
    out.extend_from_slice(payload);
    out
}

pub fn udp_dgram(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&src_port.to_be_bytes());
    out.extend_from_slice(&dst_port.to_be_bytes());
    out.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(payload);
    out
}

/// Ethernet+IPv4+TCP frame on fixed test addresses.
pub fn tcp_frame(src_port: u16, dst_port: u16, seq: u32, flags: u16, payload: &[u8]) -> Vec<u8> {
    eth(0x0800, &ipv4([10, 0, 0, 1], [10, 0, 0, 2], 6, &tcp_seg(src_port, dst_port, seq, flags, payload)))
}

pub fn udp_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    eth(0x0800, &ipv4([10, 0, 0, 1], [10, 0, 0, 2], 17, &udp_dgram(src_port, dst_port, payload)))
}

// --- RPC builders -------------------------------------------------------

pub fn rpc_call(xid: u32, program: u32, version: u32, procedure: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for v in [xid, 0, 2, program, version, procedure, 0, 0, 0, 0] {
        out.extend_from_slice(&v.to_be_bytes());
    }
    out.extend_from_slice(body);
    out
}

pub fn rpc_reply(xid: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    // xid, REPLY, MSG_ACCEPTED, null verf, SUCCESS
    for v in [xid, 1, 0, 0, 0, 0] {
        out.extend_from_slice(&v.to_be_bytes());
    }
    out.extend_from_slice(body);
    out
}

/// Record-marked fragment for RPC-over-TCP.
pub fn record_fragment(data: &[u8], last: bool) -> Vec<u8> {
    let mut marker = data.len() as u32;
    if last {
        marker |= 1 << 31;
    }
    let mut out = Vec::with_capacity(4 + data.len());
    out.extend_from_slice(&marker.to_be_bytes());
    out.extend_from_slice(data);
    out
}

// --- InfiniBand / RoCEv2 builders ---------------------------------------

pub const OP_SEND_ONLY: u8 = 0x04;
pub const OP_WRITE_FIRST: u8 = 0x06;
pub const OP_WRITE_MIDDLE: u8 = 0x07;
pub const OP_WRITE_LAST: u8 = 0x08;
pub const OP_WRITE_ONLY: u8 = 0x0A;
pub const OP_READ_REQUEST: u8 = 0x0C;
pub const OP_READ_RESP_MIDDLE: u8 = 0x0E;
pub const OP_READ_RESP_LAST: u8 = 0x0F;
pub const OP_READ_RESP_ONLY: u8 = 0x10;

pub struct BthFrame {
    pub opcode: u8,
    pub psn: u32,
    pub reth: Option<(u64, u32, u32)>,
    pub aeth: bool,
    pub payload: Vec<u8>,
}

/// BTH (+optional RETH/AETH) + payload + dummy ICRC, as carried over
/// UDP 4791. Payloads must be 4-byte aligned so the pad count stays 0.
pub fn bth(frame: &BthFrame) -> Vec<u8> {
    assert_eq!(frame.payload.len() % 4, 0, "IB payloads are 4-byte aligned");
    let mut out = Vec::new();
    out.push(frame.opcode);
    out.push(0); // se/m/pad/tver
    out.extend_from_slice(&0xFFFFu16.to_be_bytes()); // pkey
    out.push(0);
    out.extend_from_slice(&[0, 0, 7]); // dest qp 7
    out.push(0); // ackreq
    out.extend_from_slice(&[
        (frame.psn >> 16) as u8,
        (frame.psn >> 8) as u8,
        frame.psn as u8,
    ]);
    if let Some((va, rkey, dma_len)) = frame.reth {
        out.extend_from_slice(&va.to_be_bytes());
        out.extend_from_slice(&rkey.to_be_bytes());
        out.extend_from_slice(&dma_len.to_be_bytes());
    }
    if frame.aeth {
        out.extend_from_slice(&[0, 0, 0, 0]);
    }
    out.extend_from_slice(&frame.payload);
    out.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]); // ICRC placeholder
    out
}

pub fn roce_frame(frame: &BthFrame) -> Vec<u8> {
    udp_frame(49152, 4791, &bth(frame))
}

// --- RPC-over-RDMA builders ---------------------------------------------

pub struct RpcOrdmaMsg {
    pub xid: u32,
    /// 0 = RDMA_MSG, 1 = RDMA_NOMSG.
    pub proc: u32,
    /// `(xdr_position, handle, length, offset)`.
    pub reads: Vec<(u32, u32, u32, u64)>,
    /// Chunks of `(handle, length, offset)` segments.
    pub writes: Vec<Vec<(u32, u32, u64)>>,
    pub reply: Option<Vec<(u32, u32, u64)>>,
    pub reduced: Vec<u8>,
}

pub fn rpcordma(msg: &RpcOrdmaMsg) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&msg.xid.to_be_bytes());
    out.extend_from_slice(&1u32.to_be_bytes()); // vers
    out.extend_from_slice(&32u32.to_be_bytes()); // credits
    out.extend_from_slice(&msg.proc.to_be_bytes());
    for (position, handle, length, offset) in &msg.reads {
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(&position.to_be_bytes());
        out.extend_from_slice(&handle.to_be_bytes());
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&offset.to_be_bytes());
    }
    out.extend_from_slice(&0u32.to_be_bytes());
    for chunk in &msg.writes {
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
        for (handle, length, offset) in chunk {
            out.extend_from_slice(&handle.to_be_bytes());
            out.extend_from_slice(&length.to_be_bytes());
            out.extend_from_slice(&offset.to_be_bytes());
        }
    }
    out.extend_from_slice(&0u32.to_be_bytes());
    match &msg.reply {
        Some(chunk) => {
            out.extend_from_slice(&1u32.to_be_bytes());
            out.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
            for (handle, length, offset) in chunk {
                out.extend_from_slice(&handle.to_be_bytes());
                out.extend_from_slice(&length.to_be_bytes());
                out.extend_from_slice(&offset.to_be_bytes());
            }
        }
        None => out.extend_from_slice(&0u32.to_be_bytes()),
    }
    out.extend_from_slice(&msg.reduced);
    out
}
