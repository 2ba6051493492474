//! TCP decoding and per-connection stream reassembly.
//!
//! Each direction of a connection is a separate stream keyed by
//! `(src_ip, dst_ip, src_port, dst_port)`. The stream accumulates
//! in-order payload and carves messages out of it: RPC record-marked
//! fragments (RFC 5531 record marking, a 4-byte header whose high bit is
//! the last-fragment flag and whose low 31 bits are the length) on most
//! ports, MPA FPDUs on the NFS-over-iWARP port. Retransmissions are
//! dropped silently; segments ahead of the expected sequence number are
//! parked up to a cap and spliced in when the hole fills. A gap that is
//! never filled poisons any partially accumulated record, which is
//! discarded rather than guessed at.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::IpAddr;

use tracing::{debug, trace, warn};

use crate::layers::ip::ip_addrs;
use crate::layers::{mpa, rpc, DecodeContext};
use crate::matcher::Value;
use crate::pkt::{DataLayer, Layer, Packet};
use crate::unpack::Unpacker;

/// IANA port for NFS over RDMA (iWARP); streams on it carry MPA FPDUs.
pub const NFS_RDMA_PORT: u16 = 20049;

/// Largest RPC record accepted from a stream; anything bigger means the
/// marker was not a marker and the stream is not RPC.
pub const MAX_RPC_RECORD_LENGTH: usize = 16 * 1024 * 1024;

/// Cap on buffered out-of-order bytes per stream.
const MAX_OOO_BYTES: usize = 4 * 1024 * 1024;

/// TCP header.
#[derive(Debug, Clone)]
pub struct Tcp {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub hdr_len: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
    pub options: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFlags(pub u16);

impl TcpFlags {
    pub fn fin(&self) -> bool {
        self.0 & 0x001 != 0
    }
    pub fn syn(&self) -> bool {
        self.0 & 0x002 != 0
    }
    pub fn rst(&self) -> bool {
        self.0 & 0x004 != 0
    }
    pub fn psh(&self) -> bool {
        self.0 & 0x008 != 0
    }
    pub fn ack(&self) -> bool {
        self.0 & 0x010 != 0
    }
    pub fn urg(&self) -> bool {
        self.0 & 0x020 != 0
    }

    fn as_value(&self) -> Value {
        let bit = |on: bool| Value::Int(on as i64);
        Value::from_entries([
            ("FIN", bit(self.fin())),
            ("SYN", bit(self.syn())),
            ("RST", bit(self.rst())),
            ("PSH", bit(self.psh())),
            ("ACK", bit(self.ack())),
            ("URG", bit(self.urg())),
            ("ECE", bit(self.0 & 0x040 != 0)),
            ("CWR", bit(self.0 & 0x080 != 0)),
            ("NS", bit(self.0 & 0x100 != 0)),
        ])
    }
}

impl Tcp {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "src_port" => Some(Value::Int(self.src_port as i64)),
            "dst_port" => Some(Value::Int(self.dst_port as i64)),
            "seq" => Some(Value::Int(self.seq as i64)),
            "ack" => Some(Value::Int(self.ack as i64)),
            "hdr_len" => Some(Value::Int(self.hdr_len as i64)),
            "flags" => Some(self.flags.as_value()),
            "flags_raw" => Some(Value::Int(self.flags.0 as i64)),
            "window" => Some(Value::Int(self.window as i64)),
            "checksum" => Some(Value::Int(self.checksum as i64)),
            "urgent" => Some(Value::Int(self.urgent as i64)),
            _ => None,
        }
    }
}

/// One direction of a connection. The reverse tuple is a distinct key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CarveMode {
    /// RPC record marking.
    Rpc,
    /// MPA FPDU framing (NFS-over-iWARP port).
    Mpa,
    /// Stream demoted to raw payload delivery.
    Off,
}

/// Message carved out of a stream, ready for its upper-layer decoder.
#[derive(Debug)]
pub enum StreamMessage {
    Rpc(Vec<u8>),
    MpaSetup(mpa::Mpa),
    Fpdu { header: mpa::Mpa, payload: Vec<u8> },
}

#[derive(Debug)]
pub struct TcpStream {
    next_seq: Option<u32>,
    /// In-order payload not yet carved.
    buf: Vec<u8>,
    /// Accumulated RPC record fragments awaiting the last-fragment flag.
    rec_buf: Vec<u8>,
    /// Segments ahead of the expected sequence number.
    ooo: BTreeMap<u32, Vec<u8>>,
    ooo_bytes: usize,
    mode: CarveMode,
    /// MPA CRC negotiated for this direction's FPDUs.
    mpa_crc: bool,
    mpa_setup_seen: bool,
}

impl TcpStream {
    fn new(mode: CarveMode) -> Self {
        Self {
            next_seq: None,
            buf: Vec::new(),
            rec_buf: Vec::new(),
            ooo: BTreeMap::new(),
            ooo_bytes: 0,
            mode,
            mpa_crc: false,
            mpa_setup_seen: false,
        }
    }

    /// Inserts segment payload, keeping only bytes that extend the
    /// stream. Returns true when new in-order data arrived.
    fn push_payload(&mut self, seq: u32, data: Vec<u8>) -> bool {
        if data.is_empty() {
            return false;
        }
        let expected = match self.next_seq {
            Some(s) => s,
            None => {
                // first sighting of this direction anchors the stream
                self.next_seq = Some(seq);
                seq
            }
        };
        let delta = seq.wrapping_sub(expected) as i32;
        if delta < 0 {
            // retransmission; keep any part extending past the edge
            let already = (-delta) as usize;
            if already >= data.len() {
                trace!(seq, "retransmitted segment dropped");
                return false;
            }
            self.append(&data[already..]);
        } else if delta == 0 {
            self.append(&data);
        } else {
            if self.ooo_bytes + data.len() > MAX_OOO_BYTES {
                warn!(seq, buffered = self.ooo_bytes, "out-of-order buffer full, segment dropped");
                return false;
            }
            trace!(seq, ahead = delta, "segment buffered out of order");
            self.ooo_bytes += data.len();
            self.ooo.insert(seq, data);
            return false;
        }
        self.drain_ooo();
        true
    }

    fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.next_seq = Some(self.next_seq.unwrap_or(0).wrapping_add(data.len() as u32));
    }

    /// Splices in any parked segments the stream has caught up to.
    fn drain_ooo(&mut self) {
        loop {
            let Some(expected) = self.next_seq else { return };
            let Some((&seq, _)) = self.ooo.iter().next() else { return };
            let delta = seq.wrapping_sub(expected) as i32;
            if delta > 0 {
                return;
            }
            let data = self.ooo.remove(&seq).unwrap_or_default();
            self.ooo_bytes -= data.len();
            let already = (-delta) as usize;
            if already < data.len() {
                self.append(&data[already..]);
            }
        }
    }

    /// Carves complete messages out of the in-order buffer.
    fn carve(&mut self) -> Vec<StreamMessage> {
        match self.mode {
            CarveMode::Rpc => self.carve_rpc(),
            CarveMode::Mpa => self.carve_mpa(),
            CarveMode::Off => Vec::new(),
        }
    }

    fn carve_rpc(&mut self) -> Vec<StreamMessage> {
        let mut out = Vec::new();
        while self.buf.len() >= 4 {
            let marker = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            let is_last = marker & (1 << 31) != 0;
            let length = (marker & ((1 << 31) - 1)) as usize;
            if length == 0 || self.rec_buf.len().saturating_add(length) > MAX_RPC_RECORD_LENGTH {
                debug!(length, "implausible record marker, stream demoted to raw data");
                self.mode = CarveMode::Off;
                break;
            }
            if self.buf.len() < 4 + length {
                break;
            }
            self.rec_buf.extend_from_slice(&self.buf[4..4 + length]);
            self.buf.drain(..4 + length);
            trace!(length, is_last, "carved record fragment");
            if is_last {
                out.push(StreamMessage::Rpc(std::mem::take(&mut self.rec_buf)));
            }
        }
        out
    }

    fn carve_mpa(&mut self) -> Vec<StreamMessage> {
        let mut out = Vec::new();
        loop {
            if !self.mpa_setup_seen {
                match mpa::carve_setup(&mut self.buf) {
                    Some(Ok(frame)) => {
                        self.mpa_crc = frame.crc;
                        if frame.markers {
                            warn!("MPA markers negotiated; stream left undecoded");
                            self.mode = CarveMode::Off;
                            out.push(StreamMessage::MpaSetup(frame));
                            return out;
                        }
                        self.mpa_setup_seen = true;
                        out.push(StreamMessage::MpaSetup(frame));
                        continue;
                    }
                    Some(Err(())) => return out, // need more bytes
                    None => self.mpa_setup_seen = true, // no setup frame; FPDUs directly
                }
            }
            match mpa::carve_fpdu(&mut self.buf, self.mpa_crc) {
                Some((header, payload)) => out.push(StreamMessage::Fpdu { header, payload }),
                None => return out,
            }
        }
    }

    /// Unfilled gap at end of stream: partial buffers are dropped, not
    /// guessed at.
    fn abandon_partial(&mut self) {
        if !self.rec_buf.is_empty() || !self.buf.is_empty() {
            debug!(
                record = self.rec_buf.len(),
                stream = self.buf.len(),
                "discarding partial stream data"
            );
        }
        self.rec_buf.clear();
        self.buf.clear();
        self.ooo.clear();
        self.ooo_bytes = 0;
    }
}

/// Per-connection stream table, owned by the reassembly state.
#[derive(Debug, Default)]
pub struct TcpStreamTable {
    streams: HashMap<StreamKey, TcpStream>,
}

impl TcpStreamTable {
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }
}

pub fn decode(u: &mut Unpacker, pkt: &mut Packet, ctx: &mut DecodeContext<'_>) -> io::Result<()> {
    let src_port = u.unpack_u16()?;
    let dst_port = u.unpack_u16()?;
    let seq = u.unpack_u32()?;
    let ack = u.unpack_u32()?;
    let off_flags = u.unpack_u16()?;
    let hdr_len = ((off_flags >> 12) & 0xF) as u8 * 4;
    if hdr_len < 20 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "TCP header length below 20"));
    }
    let flags = TcpFlags(off_flags & 0x01FF);
    let window = u.unpack_u16()?;
    let checksum = u.unpack_u16()?;
    let urgent = u.unpack_u16()?;
    let options = u.read(hdr_len as usize - 20)?;

    pkt.push(Layer::Tcp(Tcp {
        src_port,
        dst_port,
        seq,
        ack,
        hdr_len,
        flags,
        window,
        checksum,
        urgent,
        options,
    }));

    let payload = u.read_all();
    let Some((src, dst)) = ip_addrs(pkt) else {
        if !payload.is_empty() {
            pkt.push(Layer::Data(DataLayer { data: payload }));
        }
        return Ok(());
    };
    let key = StreamKey { src, dst, src_port, dst_port };

    let messages = {
        let mode = if src_port == NFS_RDMA_PORT || dst_port == NFS_RDMA_PORT {
            CarveMode::Mpa
        } else {
            CarveMode::Rpc
        };
        let stream = ctx
            .state
            .tcp_streams
            .streams
            .entry(key)
            .or_insert_with(|| TcpStream::new(mode));

        if flags.syn() {
            // SYN consumes one sequence number and carries no stream data
            stream.next_seq = Some(seq.wrapping_add(1));
            stream.abandon_partial();
            return Ok(());
        }
        if flags.rst() {
            stream.abandon_partial();
            return Ok(());
        }

        if stream.mode == CarveMode::Off {
            if !payload.is_empty() {
                pkt.push(Layer::Data(DataLayer { data: payload }));
            }
            return Ok(());
        }

        if !stream.push_payload(seq, payload) {
            return Ok(());
        }
        stream.carve()
    };

    deliver(messages, pkt, ctx);
    Ok(())
}

/// Hands carved messages to their upper-layer decoders. The first
/// message lands on the current packet; each further message from the
/// same segment gets its own packet (sharing the frame) queued on the
/// trace.
fn deliver(messages: Vec<StreamMessage>, pkt: &mut Packet, ctx: &mut DecodeContext<'_>) {
    let mut iter = messages.into_iter();
    let Some(head) = iter.next() else { return };
    let shell = pkt.clone();
    deliver_one(head, pkt, ctx);
    for message in iter {
        let mut extra = shell.clone();
        deliver_one(message, &mut extra, ctx);
        ctx.state.pending_pkts.push_back(extra);
    }
}

fn deliver_one(message: StreamMessage, pkt: &mut Packet, ctx: &mut DecodeContext<'_>) {
    match message {
        StreamMessage::Rpc(bytes) => {
            let mut mu = Unpacker::new(bytes);
            if rpc::decode(&mut mu, pkt, ctx).is_err() {
                let _ = mu.seek(io::SeekFrom::Start(0));
                pkt.push(Layer::Data(DataLayer { data: mu.read_all() }));
            }
        }
        StreamMessage::MpaSetup(frame) => {
            pkt.push(Layer::Mpa(frame));
        }
        StreamMessage::Fpdu { header, payload } => {
            pkt.push(Layer::Mpa(header));
            let mut mu = Unpacker::new(payload);
            if crate::layers::ddp::decode(&mut mu, pkt, ctx).is_err() {
                let _ = mu.seek(io::SeekFrom::Start(0));
                pkt.push(Layer::Data(DataLayer { data: mu.read_all() }));
            }
        }
    }
}
