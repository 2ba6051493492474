//! Matcher semantics: layer predicates, the NFS compound wrapper,
//! rewind-on-no-match, call/reply pairing, buffered mode and escaping.

mod support;

use std::io;
use std::sync::Arc;

use nfs_trace::layers::rpc::{DecodeAux, ProgramDecoder, ProgramInfo};
use nfs_trace::pkt::AppLayer;
use nfs_trace::{LayerKind, MatchOpts, PacketTrace, Unpacker, Value};
use support::*;

/// Toy NFSv4 decoder: the call body is `count` argop numbers. Stands in
/// for the pluggable XDR decoders, which are out of scope here.
struct ToyNfs;

impl ProgramDecoder for ToyNfs {
    fn decode_call(
        &self,
        info: &ProgramInfo,
        u: &mut Unpacker,
        _aux: &DecodeAux<'_>,
    ) -> io::Result<Option<AppLayer>> {
        if info.program != 100003 || info.version != 4 || info.procedure != 1 {
            return Ok(None);
        }
        let count = u.unpack_u32()?;
        let mut ops = Vec::new();
        for _ in 0..count {
            let argop = u.unpack_u32()?;
            ops.push(Value::from_entries([("argop", Value::Int(argop as i64))]));
        }
        Ok(Some(AppLayer {
            name: "nfs".to_string(),
            fields: Value::from_entries([
                ("status", Value::Int(0)),
                ("minorversion", Value::Int(1)),
                ("tag", Value::Str(String::new())),
                ("array", Value::List(ops)),
            ]),
        }))
    }

    fn decode_reply(
        &self,
        _info: &ProgramInfo,
        _u: &mut Unpacker,
        _aux: &DecodeAux<'_>,
    ) -> io::Result<Option<AppLayer>> {
        Ok(None)
    }
}

fn compound_call_frame(src_port: u16, xid: u32, argops: &[u32]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(argops.len() as u32).to_be_bytes());
    for op in argops {
        body.extend_from_slice(&op.to_be_bytes());
    }
    let message = record_fragment(&rpc_call(xid, 100003, 4, 1, &body), true);
    tcp_frame(src_port, 2049, 1, TCP_ACK, &message)
}

/// S6: nothing matches in 100 frames; the cursor is restored to where
/// the search began.
#[test]
fn no_match_restores_position() {
    let records: Vec<TestRecord> =
        (0..100).map(|i| (i, 0, udp_frame(5000, 123, &[0u8; 48]))).collect();
    let file = write_pcap(LINKTYPE_ETHERNET, true, &records);
    let mut trace = PacketTrace::open(file.path()).unwrap();

    assert!(trace.match_next("NFS.argop == 38").unwrap().is_none());
    assert_eq!(trace.index(), 0);

    // and the next read is still packet 0
    let pkt = trace.next().unwrap().unwrap();
    assert_eq!(pkt.index, 0);
}

#[test]
fn layer_field_predicates() {
    let records: Vec<TestRecord> = vec![
        (1, 0, udp_frame(5000, 123, &[0u8; 48])),
        (2, 0, tcp_frame(902, 2049, 1, TCP_ACK | TCP_PSH, &[])),
    ];
    let file = write_pcap(LINKTYPE_ETHERNET, true, &records);
    let mut trace = PacketTrace::open(file.path()).unwrap();

    let pkt = trace
        .match_next("TCP.flags.ACK == 1 and TCP.dst_port == 2049")
        .unwrap()
        .expect("TCP frame matches");
    assert!(pkt.has(LayerKind::Tcp));
    assert_eq!(pkt.record.frame, 2);

    trace.rewind(0).unwrap();
    let pkt = trace.match_next("IP.src == '10.0.0.1' and UDP.dst_port == 123").unwrap();
    assert_eq!(pkt.expect("UDP frame matches").record.frame, 1);
}

/// A predicate naming a missing layer is a quiet non-match, not an
/// error.
#[test]
fn missing_layer_is_no_match() {
    let file =
        write_pcap(LINKTYPE_ETHERNET, true, &[(1, 0, udp_frame(1000, 2000, &[0xFF; 12]))]);
    let mut trace = PacketTrace::open(file.path()).unwrap();
    assert!(trace.match_next("TCP.src_port == 1000").unwrap().is_none());
}

/// Per-operation NFS fields match if any compound operation satisfies
/// the sub-predicate; compound-wide fields resolve directly.
#[test]
fn nfs_compound_exists_semantics() {
    let records: Vec<TestRecord> = vec![
        (1, 0, compound_call_frame(901, 0x10, &[22, 9])),
        (2, 0, compound_call_frame(902, 0x11, &[22, 38, 9])),
    ];
    let file = write_pcap(LINKTYPE_ETHERNET, true, &records);

    let mut trace = PacketTrace::open(file.path()).unwrap();
    trace.register_program_decoder(Arc::new(ToyNfs));
    trace.define_constant("OP_WRITE", 38);

    let pkt = trace.match_next("NFS.argop == OP_WRITE").unwrap().expect("second compound");
    assert_eq!(pkt.record.frame, 2);
    assert_eq!(pkt.rpc().unwrap().xid, 0x11);

    trace.rewind(0).unwrap();
    let pkt = trace.match_next("NFS.minorversion == 1").unwrap().expect("compound-wide field");
    assert_eq!(pkt.record.frame, 1);

    trace.rewind(0).unwrap();
    let pkt = trace.match_next("NFS.argop in (3, 9)").unwrap().expect("membership over ops");
    assert_eq!(pkt.record.frame, 1);
}

/// Reply mode yields the reply whose XID paired a matched call even
/// when the predicate itself does not match the reply.
#[test]
fn reply_pairing_by_xid() {
    let call = record_fragment(&rpc_call(0x5150, 100003, 3, 7, &[]), true);
    let reply = record_fragment(&rpc_reply(0x5150, &[]), true);
    let records: Vec<TestRecord> = vec![
        (1, 0, tcp_frame(903, 2049, 1, TCP_ACK, &call)),
        (2, 0, tcp_frame(2049, 903, 1, TCP_ACK, &reply)),
    ];
    let file = write_pcap(LINKTYPE_ETHERNET, true, &records);
    let mut trace = PacketTrace::open(file.path()).unwrap();

    let call_pkt = trace.match_next("RPC.type == 0").unwrap().expect("call matches");
    assert!(call_pkt.rpc().unwrap().is_call());

    let reply_pkt = trace
        .match_with("RPC.type == 0", MatchOpts { reply: true, ..Default::default() })
        .unwrap()
        .expect("reply returned through XID pairing");
    let rpc = reply_pkt.rpc().unwrap();
    assert!(rpc.is_reply());
    assert_eq!(rpc.xid, 0x5150);
    // the reply resolves its program from the XID map
    assert_eq!(rpc.procedure, Some(7));

    // the XID is consumed; a second reply search finds nothing
    assert!(trace
        .match_with("RPC.type == 0", MatchOpts { reply: true, ..Default::default() })
        .unwrap()
        .is_none());
}

#[test]
fn maxindex_bounds_the_search() {
    let records: Vec<TestRecord> = vec![
        (1, 0, udp_frame(5000, 123, &[0u8; 48])),
        (2, 0, tcp_frame(904, 2049, 1, TCP_ACK, &[])),
    ];
    let file = write_pcap(LINKTYPE_ETHERNET, true, &records);
    let mut trace = PacketTrace::open(file.path()).unwrap();

    let opts = MatchOpts { maxindex: Some(1), ..Default::default() };
    assert!(trace.match_with("TCP.dst_port == 2049", opts).unwrap().is_none());
    assert_eq!(trace.index(), 0);
}

/// Buffered mode: matching runs over the installed list with a private
/// cursor; the reader is untouched.
#[test]
fn pktlist_buffered_matching() {
    let records: Vec<TestRecord> = vec![
        (1, 0, udp_frame(5000, 123, &[0u8; 48])),
        (2, 0, tcp_frame(905, 2049, 1, TCP_ACK, &[])),
        (3, 0, udp_frame(5001, 123, &[0u8; 48])),
    ];
    let file = write_pcap(LINKTYPE_ETHERNET, true, &records);
    let mut trace = PacketTrace::open(file.path()).unwrap();

    let mut all = Vec::new();
    while let Some(pkt) = trace.next().unwrap() {
        all.push(pkt);
    }
    trace.set_pktlist(Some(all));

    let pkt = trace.match_next("TCP.dst_port == 2049").unwrap().expect("found in the list");
    assert_eq!(pkt.record.frame, 2);
    assert_eq!(trace.index(), 2);

    assert!(trace.match_next("TCP.dst_port == 7").unwrap().is_none());
    assert_eq!(trace.index(), 2, "buffered no-match restores the list cursor");

    trace.set_pktlist(None);
}

/// Opaque bytes embedded through `escape` compare equal to the wire
/// payload.
#[test]
fn escape_round_trips_through_the_parser() {
    let payload = vec![0x00, 0x27, 0x5C, 0x41, 0xFF, 0x80, 0x0A];
    let file = write_pcap(LINKTYPE_ETHERNET, true, &[(1, 0, udp_frame(700, 701, &payload))]);
    let mut trace = PacketTrace::open(file.path()).unwrap();

    let expr = format!("DATA.data == {}", PacketTrace::escape(&payload));
    let pkt = trace.match_next(&expr).unwrap().expect("escaped literal matches");
    assert!(pkt.has(LayerKind::Data));
}

#[test]
fn arithmetic_and_functions() {
    let records: Vec<TestRecord> = vec![(1, 0, tcp_frame(906, 2049, 5, TCP_ACK, &[]))];
    let file = write_pcap(LINKTYPE_ETHERNET, true, &records);
    let mut trace = PacketTrace::open(file.path()).unwrap();

    let pkt = trace
        .match_next("TCP.seq * 2 + 1 == 11 and (TCP.dst_port & 0xFF) == 1 and len('abc') == 3")
        .unwrap();
    assert!(pkt.is_some());

    trace.rewind(0).unwrap();
    let pkt = trace.match_next("search('10\\\\.0\\\\.0\\\\..', IP.src)").unwrap();
    assert!(pkt.is_some(), "regex search over a field");
}
