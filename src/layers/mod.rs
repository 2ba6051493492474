//! The layered decoder pipeline.
//!
//! A frame decodes link → network → transport → application; each
//! decoder consumes a prefix of the shared [`Unpacker`] and attaches its
//! layer to the packet. A decoder that rejects its input seeks the
//! cursor back to where it started, and whatever no decoder claimed is
//! kept as a raw `data` layer so the frame survives with its payload
//! visible.

pub mod ddp;
pub mod dns;
pub mod ib;
pub mod ip;
pub mod link;
pub mod mpa;
pub mod ntp;
pub mod rdma;
pub mod rdmap;
pub mod rpc;
pub mod rpcordma;
pub mod tcp;
pub mod udp;

use std::io;

use tracing::debug;

use crate::layers::rpc::ProgramRegistry;
use crate::pkt::{DataLayer, Layer, LayerKind, Packet, Record};
use crate::trace::state::ReassemblyState;
use crate::unpack::Unpacker;

/// Pcap link types this engine recognizes.
pub const LINKTYPE_ETHERNET: u32 = 1;
pub const LINKTYPE_RAW: u32 = 101;
pub const LINKTYPE_SLL: u32 = 113;
pub const LINKTYPE_ERF: u32 = 197;
pub const LINKTYPE_SLL2: u32 = 276;

/// Everything a decoder may touch besides its own bytes: the shared
/// reassembly state and the registered program decoders.
pub struct DecodeContext<'a> {
    pub state: &'a mut ReassemblyState,
    pub programs: &'a ProgramRegistry,
}

/// Decodes one pcap record into a packet. Never fails: frames with
/// unknown or malformed prefixes keep their payload as raw data.
/// `index` is the packet index the driver will assign; decoders record
/// it (the XID map keys call positions on it).
pub fn decode_frame(record: Record, index: u64, data: Vec<u8>, ctx: &mut DecodeContext<'_>) -> Packet {
    let mut pkt = Packet::new(record);
    pkt.index = index;
    let mut u = Unpacker::new(data);

    let result = match pkt.record.link_type {
        LINKTYPE_ETHERNET => link::decode_ethernet(&mut u, &mut pkt, ctx),
        LINKTYPE_RAW => decode_raw_ip(&mut u, &mut pkt, ctx),
        LINKTYPE_SLL => link::decode_sll(&mut u, &mut pkt, ctx),
        LINKTYPE_SLL2 => link::decode_sll2(&mut u, &mut pkt, ctx),
        LINKTYPE_ERF => link::decode_erf(&mut u, &mut pkt, ctx),
        other => {
            debug!(link_type = other, frame = pkt.record.frame, "unknown link type");
            Ok(())
        }
    };
    if let Err(e) = result {
        debug!(frame = pkt.record.frame, error = %e, "frame kept with raw payload");
        let _ = u.seek(io::SeekFrom::Start(0));
    }
    if u.remaining() > 0 && !pkt.has(LayerKind::Data) {
        pkt.push(Layer::Data(DataLayer { data: u.read_all() }));
    }
    pkt
}

/// Link type 101: bare IPv4 or IPv6, told apart by the version nibble.
fn decode_raw_ip(u: &mut Unpacker, pkt: &mut Packet, ctx: &mut DecodeContext<'_>) -> io::Result<()> {
    let nibble = u.peek(1)?[0] >> 4;
    match nibble {
        4 => ip::decode_ipv4(u, pkt, ctx),
        6 => ip::decode_ipv6(u, pkt, ctx),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("raw link frame with IP version {other}"),
        )),
    }
}

/// EtherType dispatch shared by Ethernet, VLAN and both SLL flavors. A
/// rejecting child decoder leaves the payload for the raw data layer.
pub(crate) fn dispatch_ethertype(
    etype: u16,
    u: &mut Unpacker,
    pkt: &mut Packet,
    ctx: &mut DecodeContext<'_>,
) {
    let entry = u.tell();
    let result = match etype {
        link::ETHERTYPE_IPV4 => ip::decode_ipv4(u, pkt, ctx),
        link::ETHERTYPE_IPV6 => ip::decode_ipv6(u, pkt, ctx),
        link::ETHERTYPE_ARP => ip::decode_arp(u, pkt),
        link::ETHERTYPE_VLAN | link::ETHERTYPE_QINQ => link::decode_vlan(u, pkt, ctx),
        other => {
            debug!(etype = format_args!("{other:#06x}"), "unknown EtherType");
            Ok(())
        }
    };
    if let Err(e) = result {
        debug!(etype, error = %e, "network decode rejected, payload kept raw");
        let _ = u.seek(io::SeekFrom::Start(entry as u64));
    }
}

/// A completed RDMA Send carries an RPC-over-RDMA message; the bytes are
/// prepended to the (fully consumed) frame Unpacker so the header
/// decoder reads them naturally.
pub(crate) fn deliver_send_message(
    message: Vec<u8>,
    u: &mut Unpacker,
    pkt: &mut Packet,
    ctx: &mut DecodeContext<'_>,
) {
    u.insert(&message);
    if rpcordma::decode(u, pkt, ctx).is_err() {
        debug!("Send payload is not RPC-over-RDMA");
        if u.remaining() > 0 && !pkt.has(LayerKind::Data) {
            pkt.push(Layer::Data(DataLayer { data: u.read_all() }));
        }
    }
}

/// A reconstructed message (reduced Send spliced with its read chunks)
/// is a plain RPC message; same prepend-and-decode delivery.
pub(crate) fn deliver_rpc_message(
    message: Vec<u8>,
    u: &mut Unpacker,
    pkt: &mut Packet,
    ctx: &mut DecodeContext<'_>,
) {
    u.insert(&message);
    if rpc::decode(u, pkt, ctx).is_err() {
        if u.remaining() > 0 && !pkt.has(LayerKind::Data) {
            pkt.push(Layer::Data(DataLayer { data: u.read_all() }));
        }
    }
}
