//! Link layer decoders: Ethernet II, 802.1Q VLAN stacks, Linux cooked
//! capture v1/v2 and ERF.
//!
//! Each decoder consumes its fixed header from the Unpacker, attaches
//! itself to the packet and hands the payload to the EtherType dispatch
//! in [`crate::layers`].

use std::fmt;
use std::io;

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::layers::{dispatch_ethertype, ib, DecodeContext};
use crate::pkt::{Layer, Packet};
use crate::matcher::Value;
use crate::unpack::Unpacker;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_QINQ: u16 = 0x88A8;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

/// ERF record types this crate recognizes.
const ERF_TYPE_ETH: u8 = 2;
const ERF_TYPE_INFINIBAND: u8 = 21;

/// 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

/// Ethernet II header.
#[derive(Debug, Clone)]
pub struct Ethernet {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub etype: u16,
}

impl Ethernet {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "src" => Some(Value::Str(self.src.to_string())),
            "dst" => Some(Value::Str(self.dst.to_string())),
            "etype" => Some(Value::Int(self.etype as i64)),
            _ => None,
        }
    }
}

/// One 802.1Q tag. Stacked tags attach as separate layers.
#[derive(Debug, Clone)]
pub struct Vlan {
    pub pcp: u8,
    pub dei: u8,
    pub vid: u16,
    pub etype: u16,
}

impl Vlan {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "pcp" => Some(Value::Int(self.pcp as i64)),
            "dei" => Some(Value::Int(self.dei as i64)),
            "vid" => Some(Value::Int(self.vid as i64)),
            "etype" => Some(Value::Int(self.etype as i64)),
            _ => None,
        }
    }
}

/// Linux cooked capture v1 (link type 113).
#[derive(Debug, Clone)]
pub struct Sll {
    pub pkttype: u16,
    pub hatype: u16,
    pub halen: u16,
    pub addr: [u8; 8],
    pub proto: u16,
}

impl Sll {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "pkttype" => Some(Value::Int(self.pkttype as i64)),
            "hatype" => Some(Value::Int(self.hatype as i64)),
            "halen" => Some(Value::Int(self.halen as i64)),
            "addr" => Some(Value::Bytes(self.addr.to_vec())),
            "proto" => Some(Value::Int(self.proto as i64)),
            _ => None,
        }
    }
}

/// Linux cooked capture v2 (link type 276).
#[derive(Debug, Clone)]
pub struct Sll2 {
    pub proto: u16,
    pub ifindex: u32,
    pub hatype: u16,
    pub pkttype: u8,
    pub halen: u8,
    pub addr: [u8; 8],
}

impl Sll2 {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "proto" => Some(Value::Int(self.proto as i64)),
            "ifindex" => Some(Value::Int(self.ifindex as i64)),
            "hatype" => Some(Value::Int(self.hatype as i64)),
            "pkttype" => Some(Value::Int(self.pkttype as i64)),
            "halen" => Some(Value::Int(self.halen as i64)),
            "addr" => Some(Value::Bytes(self.addr.to_vec())),
            _ => None,
        }
    }
}

/// Endace ERF record header (link type 197).
#[derive(Debug, Clone)]
pub struct Erf {
    pub timestamp: u64,
    pub rtype: u8,
    pub flags: u8,
    pub rlen: u16,
    pub lctr: u16,
    pub wlen: u16,
}

impl Erf {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "timestamp" => Some(Value::Int(self.timestamp as i64)),
            "rtype" => Some(Value::Int(self.rtype as i64)),
            "flags" => Some(Value::Int(self.flags as i64)),
            "rlen" => Some(Value::Int(self.rlen as i64)),
            "lctr" => Some(Value::Int(self.lctr as i64)),
            "wlen" => Some(Value::Int(self.wlen as i64)),
            _ => None,
        }
    }
}

pub fn decode_ethernet(
    u: &mut Unpacker,
    pkt: &mut Packet,
    ctx: &mut DecodeContext<'_>,
) -> io::Result<()> {
    let dst = MacAddr(u.unpack_array::<6>()?);
    let src = MacAddr(u.unpack_array::<6>()?);
    let etype = u.unpack_u16()?;
    pkt.push(Layer::Ethernet(Ethernet { dst, src, etype }));
    dispatch_ethertype(etype, u, pkt, ctx);
    Ok(())
}

/// 802.1Q / 802.1ad tag. Recurses for stacked tags; the packet exposes
/// ordinal handles plus a `vlan` alias for the innermost tag.
pub fn decode_vlan(
    u: &mut Unpacker,
    pkt: &mut Packet,
    ctx: &mut DecodeContext<'_>,
) -> io::Result<()> {
    let tci = u.unpack_u16()?;
    let etype = u.unpack_u16()?;
    pkt.push(Layer::Vlan(Vlan {
        pcp: (tci >> 13) as u8,
        dei: ((tci >> 12) & 1) as u8,
        vid: tci & 0x0FFF,
        etype,
    }));
    dispatch_ethertype(etype, u, pkt, ctx);
    Ok(())
}

pub fn decode_sll(
    u: &mut Unpacker,
    pkt: &mut Packet,
    ctx: &mut DecodeContext<'_>,
) -> io::Result<()> {
    let pkttype = u.unpack_u16()?;
    let hatype = u.unpack_u16()?;
    let halen = u.unpack_u16()?;
    let addr = u.unpack_array::<8>()?;
    let proto = u.unpack_u16()?;
    pkt.push(Layer::Sll(Sll { pkttype, hatype, halen, addr, proto }));
    dispatch_ethertype(proto, u, pkt, ctx);
    Ok(())
}

pub fn decode_sll2(
    u: &mut Unpacker,
    pkt: &mut Packet,
    ctx: &mut DecodeContext<'_>,
) -> io::Result<()> {
    let proto = u.unpack_u16()?;
    let _reserved = u.unpack_u16()?;
    let ifindex = u.unpack_u32()?;
    let hatype = u.unpack_u16()?;
    let pkttype = u.unpack_u8()?;
    let halen = u.unpack_u8()?;
    let addr = u.unpack_array::<8>()?;
    pkt.push(Layer::Sll2(Sll2 { proto, ifindex, hatype, pkttype, halen, addr }));
    dispatch_ethertype(proto, u, pkt, ctx);
    Ok(())
}

pub fn decode_erf(
    u: &mut Unpacker,
    pkt: &mut Packet,
    ctx: &mut DecodeContext<'_>,
) -> io::Result<()> {
    // ERF timestamps are little-endian, unlike everything else here
    let ts_bytes = u.unpack_array::<8>()?;
    let timestamp = LittleEndian::read_u64(&ts_bytes);
    let rtype = u.unpack_u8()?;
    let flags = u.unpack_u8()?;
    let rlen = u.unpack_u16()?;
    let lctr = u.unpack_u16()?;
    let wlen = u.unpack_u16()?;
    // optional extension headers, chained by the high bit
    if rtype & 0x80 != 0 {
        loop {
            let ext = u.unpack_array::<8>()?;
            if ext[0] & 0x80 == 0 {
                break;
            }
        }
    }
    pkt.push(Layer::Erf(Erf { timestamp, rtype: rtype & 0x7F, flags, rlen, lctr, wlen }));
    match rtype & 0x7F {
        ERF_TYPE_ETH => {
            // two bytes of offset/pad precede the Ethernet frame
            let _ = u.read(2)?;
            decode_ethernet(u, pkt, ctx)
        }
        ERF_TYPE_INFINIBAND => ib::decode_lrh(u, pkt, ctx),
        other => {
            debug!(rtype = other, "unhandled ERF record type");
            Ok(())
        }
    }
}
