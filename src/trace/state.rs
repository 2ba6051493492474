//! Shared reassembly state.
//!
//! One value owns every table the decoders mutate: TCP streams, the
//! IPv4 fragment table, the RDMA reassembly engine, the RPC XID map and
//! the queue of extra packets carved out of a single frame. The driver
//! owns exactly one of these per pipeline; keeping it a plain value is
//! what lets state survive a capture file rotation (the next reader
//! simply keeps decoding against it) and makes rewind a simple drop-
//! and-recreate.

use std::collections::VecDeque;

use crate::layers::ip::FragmentTable;
use crate::layers::rdma::RdmaReassembly;
use crate::layers::rpc::XidMap;
use crate::layers::tcp::TcpStreamTable;
use crate::pkt::Packet;

#[derive(Default)]
pub struct ReassemblyState {
    pub tcp_streams: TcpStreamTable,
    pub ipv4_fragments: FragmentTable,
    pub rdma: RdmaReassembly,
    pub xid_map: XidMap,
    /// Packets decoded but not yet yielded: one TCP record can carve
    /// several RPC messages, all sharing the frame that completed them.
    pub pending_pkts: VecDeque<Packet>,
}

impl ReassemblyState {
    /// True when nothing is buffered anywhere; used to decide whether a
    /// finished capture file still has state worth carrying forward.
    pub fn is_empty(&self) -> bool {
        self.tcp_streams.is_empty()
            && self.ipv4_fragments.is_empty()
            && self.rdma.is_empty()
            && self.xid_map.is_empty()
            && self.pending_pkts.is_empty()
    }
}
