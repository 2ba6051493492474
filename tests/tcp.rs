//! TCP stream reassembly and RPC record carving.

mod support;

use nfs_trace::{LayerKind, PacketTrace};
use support::*;

/// One RPC call of ~3.9 KB split over three TCP segments; the message
/// must appear exactly once, on the frame completing the record.
#[test]
fn rpc_record_carved_across_three_segments() {
    let body = vec![0x5A; 3868];
    let message = rpc_call(0x11223344, 100003, 3, 1, &body);
    let stream = record_fragment(&message, true);
    assert_eq!(stream.len(), 4 + 40 + 3868);

    let seg1 = &stream[..1000];
    let seg2 = &stream[1000..2460];
    let seg3 = &stream[2460..];
    let records: Vec<TestRecord> = vec![
        (10, 0, tcp_frame(799, 2049, 1000, TCP_ACK, seg1)),
        (11, 0, tcp_frame(799, 2049, 2000, TCP_ACK, seg2)),
        (12, 0, tcp_frame(799, 2049, 3460, TCP_ACK | TCP_PSH, seg3)),
    ];
    let file = write_pcap(LINKTYPE_ETHERNET, true, &records);
    let mut trace = PacketTrace::open(file.path()).unwrap();

    let p1 = trace.next().unwrap().unwrap();
    assert!(!p1.has(LayerKind::Rpc));
    let p2 = trace.next().unwrap().unwrap();
    assert!(!p2.has(LayerKind::Rpc));
    let p3 = trace.next().unwrap().unwrap();
    let rpc = p3.rpc().expect("RPC delivered on the completing frame");
    assert_eq!(rpc.xid, 0x11223344);
    assert_eq!(rpc.program, Some(100003));
    assert_eq!(p3.record.frame, 3);
    assert!(trace.next().unwrap().is_none());
}

/// A record split across a file rotation reassembles, with cumulative
/// index and frame counters.
#[test]
fn rpc_record_across_file_rotation() {
    let body = vec![0x21; 3860];
    let message = rpc_call(0xABCD0001, 100003, 3, 0, &body);
    let stream = record_fragment(&message, true);

    let part_a = &stream[..1000];
    let part_b = &stream[1000..];
    let file_a =
        write_pcap(LINKTYPE_ETHERNET, true, &[(50, 0, tcp_frame(800, 2049, 1, TCP_ACK, part_a))]);
    let file_b = write_pcap(
        LINKTYPE_ETHERNET,
        true,
        &[(60, 0, tcp_frame(800, 2049, 1001, TCP_ACK, part_b))],
    );

    let mut trace =
        PacketTrace::open_many(&[file_a.path(), file_b.path()], Default::default()).unwrap();
    let p1 = trace.next().unwrap().unwrap();
    assert!(!p1.has(LayerKind::Rpc));
    assert_eq!((p1.index, p1.record.frame), (0, 1));

    let p2 = trace.next().unwrap().unwrap();
    let rpc = p2.rpc().expect("record completed in the second file");
    assert_eq!(rpc.xid, 0xABCD0001);
    assert_eq!((p2.index, p2.record.frame), (1, 2));
    assert!(trace.next().unwrap().is_none());
}

/// Two record-marked messages in one segment yield two packets sharing
/// the frame, with consecutive indexes.
#[test]
fn two_messages_in_one_segment_share_the_frame() {
    let m1 = record_fragment(&rpc_call(1, 100003, 3, 0, &[]), true);
    let m2 = record_fragment(&rpc_call(2, 100003, 3, 0, &[]), true);
    let mut payload = m1;
    payload.extend_from_slice(&m2);

    let file = write_pcap(
        LINKTYPE_ETHERNET,
        true,
        &[(5, 0, tcp_frame(801, 2049, 1, TCP_ACK, &payload))],
    );
    let mut trace = PacketTrace::open(file.path()).unwrap();

    let p1 = trace.next().unwrap().unwrap();
    let p2 = trace.next().unwrap().unwrap();
    assert_eq!(p1.rpc().unwrap().xid, 1);
    assert_eq!(p2.rpc().unwrap().xid, 2);
    assert_eq!(p1.record.frame, p2.record.frame);
    assert_eq!((p1.index, p2.index), (0, 1));
    assert!(trace.next().unwrap().is_none());
}

/// A retransmitted segment must not produce a second copy of the data.
#[test]
fn retransmission_is_dropped() {
    let m1 = record_fragment(&rpc_call(7, 100003, 3, 0, &[]), true);
    let m2 = record_fragment(&rpc_call(8, 100003, 3, 0, &[]), true);

    let records: Vec<TestRecord> = vec![
        (1, 0, tcp_frame(802, 2049, 1, TCP_ACK, &m1)),
        (2, 0, tcp_frame(802, 2049, 1, TCP_ACK, &m1)), // retransmission
        (3, 0, tcp_frame(802, 2049, 1 + m1.len() as u32, TCP_ACK, &m2)),
    ];
    let file = write_pcap(LINKTYPE_ETHERNET, true, &records);
    let mut trace = PacketTrace::open(file.path()).unwrap();

    let mut xids = Vec::new();
    while let Some(pkt) = trace.next().unwrap() {
        if let Some(rpc) = pkt.rpc() {
            xids.push(rpc.xid);
        }
    }
    assert_eq!(xids, vec![7, 8]);
}

/// Out-of-order segments are parked and spliced in when the hole fills.
#[test]
fn out_of_order_segment_is_spliced() {
    let message = rpc_call(0x0F0F0F0F, 100003, 3, 0, &vec![9u8; 200]);
    let stream = record_fragment(&message, true);
    let first = &stream[..100];
    let second = &stream[100..];

    let records: Vec<TestRecord> = vec![
        (0, 0, tcp_frame(803, 2049, 0, TCP_SYN, &[])), // anchors the stream
        (1, 0, tcp_frame(803, 2049, 101, TCP_ACK, second)), // arrives early
        (2, 0, tcp_frame(803, 2049, 1, TCP_ACK, first)),
    ];
    let file = write_pcap(LINKTYPE_ETHERNET, true, &records);
    let mut trace = PacketTrace::open(file.path()).unwrap();

    let syn = trace.next().unwrap().unwrap();
    assert!(syn.tcp().unwrap().flags.syn());
    let p1 = trace.next().unwrap().unwrap();
    assert!(!p1.has(LayerKind::Rpc));
    let p2 = trace.next().unwrap().unwrap();
    assert_eq!(p2.rpc().expect("completed after the hole filled").xid, 0x0F0F0F0F);
}

/// Multi-fragment records concatenate until the last-fragment flag.
#[test]
fn multi_fragment_record_concatenates() {
    let message = rpc_call(0x00C0FFEE, 100003, 3, 0, &vec![3u8; 64]);
    let mut stream = record_fragment(&message[..40], false);
    stream.extend_from_slice(&record_fragment(&message[40..], true));

    let file = write_pcap(
        LINKTYPE_ETHERNET,
        true,
        &[(1, 0, tcp_frame(804, 2049, 1, TCP_ACK, &stream))],
    );
    let mut trace = PacketTrace::open(file.path()).unwrap();
    let pkt = trace.next().unwrap().unwrap();
    assert_eq!(pkt.rpc().expect("one message from two fragments").xid, 0x00C0FFEE);
}
