//! RDMA reassembly scenarios: read chunks, write chunks, the
//! Position-Zero Read Chunk and the iWARP framing path.

mod support;

use nfs_trace::{Layer, LayerKind, PacketTrace};
use support::*;

/// NFS WRITE shape: a reduced Send declaring one read chunk at XDR
/// position 92, then read responses delivering 4096 bytes out of order
/// across PSNs 17..21. The RPC decoder must see
/// `reduced[0..92] ++ chunk ++ reduced[92..]` on the Read_Response_Last
/// frame.
#[test]
fn read_chunk_reconstruction_out_of_order() {
    let reduced = rpc_call(0x77, 100003, 4, 1, &vec![0x11u8; 108]);
    assert_eq!(reduced.len(), 148);

    let send = rpcordma(&RpcOrdmaMsg {
        xid: 0x77,
        proc: 0, // RDMA_MSG
        reads: vec![(92, 0xA, 4096, 0)],
        writes: vec![],
        reply: None,
        reduced: reduced.clone(),
    });

    let chunk_frag = |psn: u32, size: usize| vec![psn as u8; size];
    let mut records: Vec<TestRecord> = vec![
        (1, 0, roce_frame(&BthFrame { opcode: OP_SEND_ONLY, psn: 1, reth: None, aeth: false, payload: send })),
        (2, 0, roce_frame(&BthFrame { opcode: OP_READ_REQUEST, psn: 17, reth: Some((0, 0xA, 4096)), aeth: false, payload: vec![] })),
    ];
    // responses delivered 18, 17, 20, 19, 21
    for (ts, psn, size, last) in [
        (3u32, 18u32, 820usize, false),
        (4, 17, 820, false),
        (5, 20, 820, false),
        (6, 19, 820, false),
        (7, 21, 816, true),
    ] {
        let opcode = if last { OP_READ_RESP_LAST } else { OP_READ_RESP_MIDDLE };
        records.push((
            ts,
            0,
            roce_frame(&BthFrame { opcode, psn, reth: None, aeth: last, payload: chunk_frag(psn, size) }),
        ));
    }

    let file = write_pcap(LINKTYPE_ETHERNET, true, &records);
    let mut trace = PacketTrace::open(file.path()).unwrap();

    for _ in 0..6 {
        let pkt = trace.next().unwrap().unwrap();
        assert!(!pkt.has(LayerKind::Rpc), "no RPC before the last response");
    }
    let last = trace.next().unwrap().unwrap();
    assert_eq!(last.record.frame, 7);
    let rpc = last.rpc().expect("reconstructed message on the Last frame");
    assert_eq!(rpc.xid, 0x77);

    // the byte stream handed to the RPC decoder, minus the envelope it
    // consumed, must be the spliced message
    let mut expected = Vec::new();
    expected.extend_from_slice(&reduced[..92]);
    for psn in 17u32..=21 {
        let size = if psn == 21 { 816 } else { 820 };
        expected.extend_from_slice(&vec![psn as u8; size]);
    }
    expected.extend_from_slice(&reduced[92..]);
    let Some(Layer::Data(data)) = last.get(LayerKind::Data) else { panic!("payload kept") };
    assert_eq!(data.data, expected[40..]);
}

/// NFS READ shape: the call declares a write chunk, RDMA Writes deliver
/// 8 KB into it, and on the reply Send the write-chunk accessor exposes
/// the delivered bytes in declared order.
#[test]
fn write_chunks_exposed_on_reply() {
    let call = rpcordma(&RpcOrdmaMsg {
        xid: 0x66,
        proc: 0,
        reads: vec![],
        writes: vec![vec![(0xB, 8192, 0)]],
        reply: None,
        reduced: rpc_call(0x66, 100003, 4, 1, &[]),
    });
    let reply = rpcordma(&RpcOrdmaMsg {
        xid: 0x66,
        proc: 0,
        reads: vec![],
        writes: vec![],
        reply: None,
        reduced: rpc_reply(0x66, &vec![0x44u8; 176]),
    });

    let records: Vec<TestRecord> = vec![
        (1, 0, roce_frame(&BthFrame { opcode: OP_SEND_ONLY, psn: 1, reth: None, aeth: false, payload: call })),
        (2, 0, roce_frame(&BthFrame { opcode: OP_WRITE_FIRST, psn: 10, reth: Some((0, 0xB, 8192)), aeth: false, payload: vec![0xAA; 4096] })),
        (3, 0, roce_frame(&BthFrame { opcode: OP_WRITE_LAST, psn: 11, reth: None, aeth: false, payload: vec![0xBB; 4096] })),
        (4, 0, roce_frame(&BthFrame { opcode: OP_SEND_ONLY, psn: 2, reth: None, aeth: false, payload: reply })),
    ];
    let file = write_pcap(LINKTYPE_ETHERNET, true, &records);
    let mut trace = PacketTrace::open(file.path()).unwrap();

    for _ in 0..3 {
        trace.next().unwrap().unwrap();
    }
    assert!(trace.rdma_write_chunks().is_empty(), "no exposure before the reply");

    let reply_pkt = trace.next().unwrap().unwrap();
    assert!(reply_pkt.rpc().is_some_and(|r| r.is_reply() && r.xid == 0x66));

    let chunks = trace.rdma_write_chunks();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].len(), 1);
    let mut expected = vec![0xAA; 4096];
    expected.extend_from_slice(&[0xBB; 4096]);
    assert_eq!(chunks[0][0], expected);
}

/// A Position-Zero Read Chunk carries the whole message: spliced with no
/// padding against the (empty) reduced prefix.
#[test]
fn position_zero_read_chunk_is_whole_message() {
    let whole = rpc_call(0x88, 100003, 4, 0, &vec![0x55u8; 216]);
    assert_eq!(whole.len(), 256);

    let send = rpcordma(&RpcOrdmaMsg {
        xid: 0x88,
        proc: 1, // RDMA_NOMSG
        reads: vec![(0, 0xC, 256, 0)],
        writes: vec![],
        reply: None,
        reduced: vec![],
    });
    let records: Vec<TestRecord> = vec![
        (1, 0, roce_frame(&BthFrame { opcode: OP_SEND_ONLY, psn: 1, reth: None, aeth: false, payload: send })),
        (2, 0, roce_frame(&BthFrame { opcode: OP_READ_REQUEST, psn: 40, reth: Some((0, 0xC, 256)), aeth: false, payload: vec![] })),
        (3, 0, roce_frame(&BthFrame { opcode: OP_READ_RESP_ONLY, psn: 40, reth: None, aeth: true, payload: whole.clone() })),
    ];
    let file = write_pcap(LINKTYPE_ETHERNET, true, &records);
    let mut trace = PacketTrace::open(file.path()).unwrap();

    trace.next().unwrap().unwrap();
    trace.next().unwrap().unwrap();
    let pkt = trace.next().unwrap().unwrap();
    let rpc = pkt.rpc().expect("whole message delivered from the chunk");
    assert_eq!(rpc.xid, 0x88);
    assert_eq!(rpc.procedure, Some(0));
    let Some(Layer::Data(data)) = pkt.get(LayerKind::Data) else { panic!("body kept") };
    assert_eq!(data.data, whole[40..]);
}

fn ddp_untagged_send(msn: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(0x41); // untagged, last, DDP version 1
    out.push(0x43); // RDMAP version 1, opcode Send
    out.extend_from_slice(&0u32.to_be_bytes()); // queue 0
    out.extend_from_slice(&msn.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes()); // message offset
    out.extend_from_slice(payload);
    out
}

fn fpdu(ulpdu: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(ulpdu.len() as u16).to_be_bytes());
    out.extend_from_slice(ulpdu);
    let pad = (4 - (2 + ulpdu.len()) % 4) % 4;
    out.extend(std::iter::repeat(0u8).take(pad));
    out.extend_from_slice(&[0; 4]); // CRC field present but not enabled
    out
}

fn mpa_request() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"MPA ID Req Frame");
    out.push(0x00); // no markers, no CRC
    out.push(1); // revision
    out.extend_from_slice(&0u16.to_be_bytes());
    out
}

/// iWARP path: MPA setup, then an FPDU carrying a DDP untagged Send
/// with an RPC-over-RDMA message.
#[test]
fn iwarp_send_decodes_through_mpa_ddp_rdmap() {
    let message = rpcordma(&RpcOrdmaMsg {
        xid: 0x99,
        proc: 0,
        reads: vec![],
        writes: vec![],
        reply: None,
        reduced: rpc_call(0x99, 100003, 4, 0, &[]),
    });
    let stream_fpdu = fpdu(&ddp_untagged_send(1, &message));

    let setup = mpa_request();
    let setup_len = setup.len() as u32;
    let records: Vec<TestRecord> = vec![
        (1, 0, tcp_frame(900, 20049, 1, TCP_ACK, &setup)),
        (2, 0, tcp_frame(900, 20049, 1 + setup_len, TCP_ACK, &stream_fpdu)),
    ];
    let file = write_pcap(LINKTYPE_ETHERNET, true, &records);
    let mut trace = PacketTrace::open(file.path()).unwrap();

    let p1 = trace.next().unwrap().unwrap();
    assert!(p1.has(LayerKind::Mpa));
    assert_eq!(p1.field("mpa", "type"), Some(nfs_trace::Value::Str("request".into())));

    let p2 = trace.next().unwrap().unwrap();
    assert!(p2.has(LayerKind::Mpa));
    assert!(p2.has(LayerKind::Ddp));
    assert!(p2.has(LayerKind::Rdmap));
    assert!(p2.has(LayerKind::RpcOrdma));
    assert_eq!(p2.rpc().expect("send decoded to RPC").xid, 0x99);
}
