//! Internet layer decoders: IPv4 with fragment reassembly, IPv6 and ARP.
//!
//! IPv4 fragments are parked in a table keyed by
//! `(src, dst, protocol, identification)` and the next-protocol decoder
//! only runs once the datagram is whole, on the frame that completed it.
//! Fragments may arrive in any order; IPv6 extension headers are not
//! supported.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::{debug, warn};

use crate::layers::{tcp, udp, DecodeContext};
use crate::matcher::Value;
use crate::pkt::{DataLayer, Layer, LayerKind, Packet};
use crate::unpack::Unpacker;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// IPv4 header.
#[derive(Debug, Clone)]
pub struct Ipv4 {
    pub hdr_len: u8,
    pub tos: u8,
    pub total_len: u16,
    pub id: u16,
    pub df: bool,
    pub mf: bool,
    pub frag_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub options: Vec<u8>,
    /// True when this frame carried a fragment of a larger datagram.
    pub fragment: bool,
}

impl Ipv4 {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "version" => Some(Value::Int(4)),
            "hdr_len" => Some(Value::Int(self.hdr_len as i64)),
            "tos" => Some(Value::Int(self.tos as i64)),
            "total_len" => Some(Value::Int(self.total_len as i64)),
            "id" => Some(Value::Int(self.id as i64)),
            "df" => Some(Value::Bool(self.df)),
            "mf" => Some(Value::Bool(self.mf)),
            "frag_offset" => Some(Value::Int(self.frag_offset as i64)),
            "ttl" => Some(Value::Int(self.ttl as i64)),
            "protocol" => Some(Value::Int(self.protocol as i64)),
            "checksum" => Some(Value::Int(self.checksum as i64)),
            "src" => Some(Value::Str(self.src.to_string())),
            "dst" => Some(Value::Str(self.dst.to_string())),
            "fragment" => Some(Value::Bool(self.fragment)),
            _ => None,
        }
    }
}

/// IPv6 fixed header.
#[derive(Debug, Clone)]
pub struct Ipv6 {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub payload_len: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

impl Ipv6 {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "version" => Some(Value::Int(6)),
            "traffic_class" => Some(Value::Int(self.traffic_class as i64)),
            "flow_label" => Some(Value::Int(self.flow_label as i64)),
            "payload_len" => Some(Value::Int(self.payload_len as i64)),
            "protocol" | "next_header" => Some(Value::Int(self.next_header as i64)),
            "hop_limit" => Some(Value::Int(self.hop_limit as i64)),
            "src" => Some(Value::Str(self.src.to_string())),
            "dst" => Some(Value::Str(self.dst.to_string())),
            _ => None,
        }
    }
}

/// ARP over Ethernet/IPv4.
#[derive(Debug, Clone)]
pub struct Arp {
    pub htype: u16,
    pub ptype: u16,
    pub hlen: u8,
    pub plen: u8,
    pub oper: u16,
    pub sha: Vec<u8>,
    pub spa: Vec<u8>,
    pub tha: Vec<u8>,
    pub tpa: Vec<u8>,
}

fn addr_field(bytes: &[u8]) -> Value {
    if bytes.len() == 4 {
        Value::Str(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).to_string())
    } else {
        Value::Bytes(bytes.to_vec())
    }
}

impl Arp {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "htype" => Some(Value::Int(self.htype as i64)),
            "ptype" => Some(Value::Int(self.ptype as i64)),
            "oper" => Some(Value::Int(self.oper as i64)),
            "sha" => Some(Value::Bytes(self.sha.clone())),
            "spa" => Some(addr_field(&self.spa)),
            "tha" => Some(Value::Bytes(self.tha.clone())),
            "tpa" => Some(addr_field(&self.tpa)),
            _ => None,
        }
    }
}

/// Key of an in-progress IPv4 datagram reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    id: u16,
}

#[derive(Debug, Default)]
struct FragEntry {
    /// Byte offset within the datagram → fragment payload.
    fragments: BTreeMap<usize, Vec<u8>>,
    /// Fixed by the MF=0 fragment.
    total_len: Option<usize>,
}

impl FragEntry {
    fn assemble(&self) -> Option<Vec<u8>> {
        let total = self.total_len?;
        let mut out = Vec::with_capacity(total);
        for (&off, data) in &self.fragments {
            if off != out.len() {
                return None;
            }
            out.extend_from_slice(data);
        }
        (out.len() == total).then_some(out)
    }
}

/// IPv4 fragment reassembly table, owned by the trace's reassembly
/// state.
#[derive(Debug, Default)]
pub struct FragmentTable {
    entries: HashMap<FragKey, FragEntry>,
}

impl FragmentTable {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deposits a fragment and returns the whole datagram once every
    /// byte is present.
    fn insert(
        &mut self,
        key: FragKey,
        offset: usize,
        data: Vec<u8>,
        more_fragments: bool,
    ) -> Option<Vec<u8>> {
        let entry = self.entries.entry(key).or_default();
        if !more_fragments {
            entry.total_len = Some(offset + data.len());
        }
        if entry.fragments.insert(offset, data).is_some() {
            debug!(?key, offset, "duplicate IPv4 fragment replaced");
        }
        let whole = entry.assemble()?;
        self.entries.remove(&key);
        Some(whole)
    }
}

/// Source and destination of the packet's internet layer, used to key
/// TCP streams.
pub fn ip_addrs(pkt: &Packet) -> Option<(IpAddr, IpAddr)> {
    match pkt.get(LayerKind::Ip)? {
        Layer::Ipv4(ip) => Some((IpAddr::V4(ip.src), IpAddr::V4(ip.dst))),
        Layer::Ipv6(ip) => Some((IpAddr::V6(ip.src), IpAddr::V6(ip.dst))),
        _ => None,
    }
}

fn dispatch_protocol(
    protocol: u8,
    u: &mut Unpacker,
    pkt: &mut Packet,
    ctx: &mut DecodeContext<'_>,
) {
    let entry = u.tell();
    let result = match protocol {
        PROTO_TCP => tcp::decode(u, pkt, ctx),
        PROTO_UDP => udp::decode(u, pkt, ctx),
        other => {
            debug!(protocol = other, "unknown IP protocol, payload kept raw");
            Ok(())
        }
    };
    if let Err(e) = result {
        debug!(protocol, error = %e, "transport decode rejected, payload kept raw");
        let _ = u.seek(io::SeekFrom::Start(entry as u64));
    }
}

pub fn decode_ipv4(
    u: &mut Unpacker,
    pkt: &mut Packet,
    ctx: &mut DecodeContext<'_>,
) -> io::Result<()> {
    let vi = u.unpack_u8()?;
    if vi >> 4 != 4 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "not an IPv4 header"));
    }
    let hdr_len = (vi & 0x0F) * 4;
    if hdr_len < 20 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "IPv4 header length below 20"));
    }
    let tos = u.unpack_u8()?;
    let total_len = u.unpack_u16()?;
    let id = u.unpack_u16()?;
    let frag = u.unpack_u16()?;
    let ttl = u.unpack_u8()?;
    let protocol = u.unpack_u8()?;
    let checksum = u.unpack_u16()?;
    let src = Ipv4Addr::from(u.unpack_array::<4>()?);
    let dst = Ipv4Addr::from(u.unpack_array::<4>()?);
    let options = u.read(hdr_len as usize - 20)?;

    let df = frag & 0x4000 != 0;
    let mf = frag & 0x2000 != 0;
    let frag_offset = frag & 0x1FFF;

    // bound the payload to the declared total length so Ethernet padding
    // never reaches the transport decoder
    let payload_len = (total_len as usize).saturating_sub(hdr_len as usize);
    u.truncate(payload_len);

    let fragment = mf || frag_offset > 0;
    pkt.push(Layer::Ipv4(Ipv4 {
        hdr_len,
        tos,
        total_len,
        id,
        df,
        mf,
        frag_offset,
        ttl,
        protocol,
        checksum,
        src,
        dst,
        options,
        fragment,
    }));

    if fragment {
        let key = FragKey { src, dst, protocol, id };
        let data = u.read_all();
        let Some(whole) = ctx.state.ipv4_fragments.insert(key, frag_offset as usize * 8, data, mf)
        else {
            return Ok(());
        };
        debug!(?src, ?dst, id, len = whole.len(), "IPv4 datagram reassembled");
        let mut ru = Unpacker::new(whole);
        dispatch_protocol(protocol, &mut ru, pkt, ctx);
        if ru.remaining() > 0 && !pkt.has(LayerKind::Data) {
            pkt.push(Layer::Data(DataLayer { data: ru.read_all() }));
        }
        return Ok(());
    }

    dispatch_protocol(protocol, u, pkt, ctx);
    Ok(())
}

pub fn decode_ipv6(
    u: &mut Unpacker,
    pkt: &mut Packet,
    ctx: &mut DecodeContext<'_>,
) -> io::Result<()> {
    let word = u.unpack_u32()?;
    if word >> 28 != 6 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "not an IPv6 header"));
    }
    let traffic_class = ((word >> 20) & 0xFF) as u8;
    let flow_label = word & 0x000F_FFFF;
    let payload_len = u.unpack_u16()?;
    let next_header = u.unpack_u8()?;
    let hop_limit = u.unpack_u8()?;
    let src = Ipv6Addr::from(u.unpack_array::<16>()?);
    let dst = Ipv6Addr::from(u.unpack_array::<16>()?);

    u.truncate(payload_len as usize);
    pkt.push(Layer::Ipv6(Ipv6 {
        traffic_class,
        flow_label,
        payload_len,
        next_header,
        hop_limit,
        src,
        dst,
    }));

    match next_header {
        PROTO_TCP | PROTO_UDP => dispatch_protocol(next_header, u, pkt, ctx),
        other => {
            // extension headers are out of scope
            warn!(next_header = other, "unsupported IPv6 next header, payload kept raw");
        }
    }
    Ok(())
}

pub fn decode_arp(u: &mut Unpacker, pkt: &mut Packet) -> io::Result<()> {
    let htype = u.unpack_u16()?;
    let ptype = u.unpack_u16()?;
    let hlen = u.unpack_u8()?;
    let plen = u.unpack_u8()?;
    let oper = u.unpack_u16()?;
    let sha = u.read(hlen as usize)?;
    let spa = u.read(plen as usize)?;
    let tha = u.read(hlen as usize)?;
    let tpa = u.read(plen as usize)?;
    pkt.push(Layer::Arp(Arp { htype, ptype, hlen, plen, oper, sha, spa, tha, tpa }));
    Ok(())
}
