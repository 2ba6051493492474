//! RDMA reassembly engine.
//!
//! Reconstructs RPC messages whose payloads were carried in RDMA Send,
//! Write and Read operations, for both InfiniBand/RoCEv2 (PSN-ordered
//! fragments) and iWARP (DDP tagged offsets). Segments are registered by
//! STag/R_Key handle from RPC-over-RDMA chunk lists; fragments land in
//! PSN-windowed sub-segments or directly at tagged offsets; completed
//! read chunks are spliced back into the reduced Send to rebuild the
//! original RPC message.
//!
//! All tables here live in the trace's reassembly state: they are
//! created lazily, carried across capture file rotations and dropped on
//! rewind.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace, warn};

/// PSNs are 24-bit and wrap.
const PSN_MASK: u32 = 0x00FF_FFFF;
/// A PSN this far ahead of an open window's start is not part of it.
const MAX_WINDOW: u32 = 1 << 16;
/// Hard cap on bytes a single segment may grow to; placements past it
/// are treated as corrupt addressing.
const MAX_SEGMENT_BYTES: usize = 1 << 30;

/// Forward distance from `start` to `psn` modulo the PSN space.
fn psn_delta(start: u32, psn: u32) -> u32 {
    psn.wrapping_sub(start) & PSN_MASK
}

/// Sub-segment life cycle. A Last fragment arriving outside `Partial`
/// is a protocol anomaly (warned, not fatal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubSegState {
    Opened,
    Partial,
    Complete,
}

/// PSN-delimited portion of a segment, sized by the DMA length of the
/// First/Only operation (or read request) that opened it.
#[derive(Debug)]
struct SubSeg {
    start_psn: u32,
    end_psn: Option<u32>,
    dma_len: u32,
    /// Target byte position within the owning segment.
    base: u64,
    /// Fragment slots indexed by `psn - start_psn`; missing slots are
    /// holes to be back-filled by out-of-order arrivals.
    frags: Vec<Option<Vec<u8>>>,
    state: SubSegState,
}

impl SubSeg {
    fn new(start_psn: u32, dma_len: u32, base: u64) -> Self {
        Self { start_psn, end_psn: None, dma_len, base, frags: Vec::new(), state: SubSegState::Opened }
    }

    fn contains(&self, psn: u32) -> Option<u32> {
        let delta = psn_delta(self.start_psn, psn);
        match self.end_psn {
            Some(end) => (delta <= psn_delta(self.start_psn, end)).then_some(delta),
            None => (delta < MAX_WINDOW).then_some(delta),
        }
    }

    fn insert(&mut self, psn: u32, data: Vec<u8>, last: bool) {
        let delta = psn_delta(self.start_psn, psn) as usize;
        if last {
            if self.state != SubSegState::Partial && delta != 0 {
                warn!(psn, "last RDMA fragment without preceding fragments");
            }
            self.end_psn = Some(psn);
            self.frags.truncate(delta + 1);
        }
        if self.frags.len() <= delta {
            self.frags.resize_with(delta + 1, || None);
        }
        if self.frags[delta].is_some() {
            trace!(psn, "duplicate RDMA fragment replaced");
        }
        self.frags[delta] = Some(data);
        self.state = if self.is_complete() { SubSegState::Complete } else { SubSegState::Partial };
    }

    fn total_bytes(&self) -> usize {
        self.frags.iter().flatten().map(Vec::len).sum()
    }

    fn is_complete(&self) -> bool {
        self.end_psn.is_some()
            && self.frags.iter().all(Option::is_some)
            && self.total_bytes() >= self.dma_len as usize
    }

    /// Fragment bytes in PSN order, bounded to the declared DMA length.
    fn assemble(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.dma_len as usize);
        for frag in self.frags.drain(..).flatten() {
            out.extend_from_slice(&frag);
        }
        if out.len() != self.dma_len as usize {
            warn!(
                got = out.len(),
                declared = self.dma_len,
                "sub-segment byte count differs from DMA length"
            );
            out.truncate(self.dma_len as usize);
        }
        out
    }
}

/// Registered memory region addressed by an STag/R_Key handle.
#[derive(Debug)]
pub struct Segment {
    pub handle: u32,
    /// Base offset from the chunk registration; fragment placement is
    /// relative to it.
    pub offset: u64,
    pub length: u32,
    pub xdr_position: u32,
    data: Vec<u8>,
    /// Merged `[start, end)` coverage intervals of `data`.
    coverage: BTreeMap<usize, usize>,
    subsegs: Vec<SubSeg>,
}

impl Segment {
    fn new(handle: u32, offset: u64, length: u32, xdr_position: u32) -> Self {
        Self {
            handle,
            offset,
            length,
            xdr_position,
            data: vec![0; length as usize],
            coverage: BTreeMap::new(),
            subsegs: Vec::new(),
        }
    }

    /// Places bytes at an absolute intra-segment position.
    fn place(&mut self, pos: usize, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let Some(end) = pos.checked_add(bytes.len()).filter(|&e| e <= MAX_SEGMENT_BYTES) else {
            warn!(handle = self.handle, pos, "RDMA placement address out of range");
            return;
        };
        if end > self.data.len() {
            warn!(
                handle = self.handle,
                pos,
                len = bytes.len(),
                declared = self.length,
                "RDMA placement beyond declared segment length"
            );
            self.data.resize(end, 0);
        }
        self.data[pos..end].copy_from_slice(bytes);

        // merge [pos, end) into the coverage set
        let mut start = pos;
        let mut stop = end;
        let overlapping: Vec<usize> = self
            .coverage
            .range(..=stop)
            .filter(|&(&s, &e)| e >= start && s <= stop)
            .map(|(&s, _)| s)
            .collect();
        for s in overlapping {
            if let Some(e) = self.coverage.remove(&s) {
                start = start.min(s);
                stop = stop.max(e);
            }
        }
        self.coverage.insert(start, stop);
    }

    fn is_complete(&self) -> bool {
        self.coverage.get(&0).is_some_and(|&end| end >= self.length as usize)
    }

    fn into_bytes(mut self) -> Vec<u8> {
        if !self.is_complete() {
            warn!(handle = self.handle, "consuming incomplete RDMA segment");
        }
        self.data.truncate(self.length as usize);
        self.data
    }
}

/// Read chunk of a saved reduced message: the segments sharing one XDR
/// position, in list order.
#[derive(Debug)]
struct PendingChunk {
    xdr_position: u32,
    handles: Vec<u32>,
}

/// Reduced Send payload parked until its read chunks complete.
#[derive(Debug)]
struct PendingReduced {
    reduced: Vec<u8>,
    chunks: Vec<PendingChunk>,
}

/// Write/reply chunk declarations remembered per call XID so the reply
/// can find its delivered data.
#[derive(Debug, Default)]
struct XidChunks {
    writes: Vec<Vec<u32>>,
    reply: Vec<u32>,
}

/// Fragments of one iWARP Send keyed by DDP message offset.
#[derive(Debug, Default)]
struct UntaggedSend {
    frags: BTreeMap<u32, Vec<u8>>,
}

/// Fragments of one InfiniBand Send on a queue pair.
#[derive(Debug, Default)]
struct IbSend {
    frags: BTreeMap<u32, Vec<u8>>,
}

/// The reassembly tables. Owned by [`crate::trace::state::ReassemblyState`].
#[derive(Debug, Default)]
pub struct RdmaReassembly {
    segments: HashMap<u32, Segment>,
    /// iWARP read responses address the sink STag; this maps it back to
    /// the registered chunk handle.
    sink_to_source: HashMap<u32, u32>,
    /// iWARP Send reassembly keyed by DDP (queue, msn).
    sends: HashMap<(u32, u32), UntaggedSend>,
    /// InfiniBand Send reassembly keyed by destination QP.
    ib_sends: HashMap<u32, IbSend>,
    pending: HashMap<u32, PendingReduced>,
    handle_to_xid: HashMap<u32, u32>,
    xid_chunks: HashMap<u32, XidChunks>,
    /// Shared accessor: write chunk data of the most recent reply, in
    /// the order declared by its call. Upper-layer decoders read large
    /// reply opaques from here instead of the wire buffer.
    pub write_chunks: Vec<Vec<Vec<u8>>>,
}

impl RdmaReassembly {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
            && self.sends.is_empty()
            && self.ib_sends.is_empty()
            && self.pending.is_empty()
    }

    /// Registers a chunk segment. A duplicate handle updates the length
    /// but keeps accumulated data.
    pub fn register_segment(&mut self, handle: u32, offset: u64, length: u32, xdr_position: u32) {
        if length as usize > MAX_SEGMENT_BYTES {
            warn!(handle, length, "implausible segment length ignored");
            return;
        }
        match self.segments.get_mut(&handle) {
            Some(seg) => {
                trace!(handle, length, "re-registered RDMA segment");
                seg.length = length;
                seg.xdr_position = xdr_position;
                if seg.data.len() < length as usize {
                    seg.data.resize(length as usize, 0);
                }
            }
            None => {
                trace!(handle, offset, length, xdr_position, "registered RDMA segment");
                self.segments.insert(handle, Segment::new(handle, offset, length, xdr_position));
            }
        }
    }

    /// Parks a reduced message until every read chunk completes.
    /// `chunks` holds `(xdr_position, handles)` groups in list order.
    pub fn save_pending(&mut self, xid: u32, reduced: Vec<u8>, chunks: Vec<(u32, Vec<u32>)>) {
        for (_, handles) in &chunks {
            for &h in handles {
                self.handle_to_xid.insert(h, xid);
            }
        }
        let chunks = chunks
            .into_iter()
            .map(|(xdr_position, handles)| PendingChunk { xdr_position, handles })
            .collect();
        self.pending.insert(xid, PendingReduced { reduced, chunks });
    }

    /// Remembers a call's declared write and reply chunks for its reply.
    pub fn declare_chunks(&mut self, xid: u32, writes: Vec<Vec<u32>>, reply: Vec<u32>) {
        if writes.is_empty() && reply.is_empty() {
            return;
        }
        self.xid_chunks.insert(xid, XidChunks { writes, reply });
    }

    pub fn has_declared_chunks(&self, xid: u32) -> bool {
        self.xid_chunks.contains_key(&xid)
    }

    /// Collects the write chunk data declared by `xid`'s call, in
    /// declaration order, consuming the segments. Also publishes it on
    /// the shared accessor.
    pub fn collect_write_chunks(&mut self, xid: u32) -> Vec<Vec<Vec<u8>>> {
        let Some(chunks) = self.xid_chunks.get(&xid).map(|c| c.writes.clone()) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(chunks.len());
        for handles in chunks {
            let mut chunk = Vec::with_capacity(handles.len());
            for handle in handles {
                match self.segments.remove(&handle) {
                    Some(seg) => chunk.push(seg.into_bytes()),
                    None => {
                        warn!(handle, xid, "write chunk segment was never registered");
                        chunk.push(Vec::new());
                    }
                }
            }
            out.push(chunk);
        }
        self.write_chunks = out.clone();
        out
    }

    /// Materializes a long reply delivered entirely through the reply
    /// chunk (`RDMA_NOMSG`).
    pub fn materialize_reply(&mut self, xid: u32) -> Option<Vec<u8>> {
        let handles = {
            let chunks = self.xid_chunks.get_mut(&xid)?;
            if chunks.reply.is_empty() {
                return None;
            }
            std::mem::take(&mut chunks.reply)
        };
        let mut out = Vec::new();
        for handle in handles {
            match self.segments.remove(&handle) {
                Some(seg) => out.extend_from_slice(&seg.into_bytes()),
                None => warn!(handle, xid, "reply chunk segment was never registered"),
            }
        }
        self.xid_chunks.remove(&xid);
        Some(out)
    }

    pub fn release_xid(&mut self, xid: u32) {
        self.xid_chunks.remove(&xid);
    }

    // --- InfiniBand paths -------------------------------------------------

    /// Send fragment on a queue pair. Returns the whole Send payload
    /// once the Last (or Only) fragment is in.
    pub fn ib_send_fragment(
        &mut self,
        qp: u32,
        psn: u32,
        data: Vec<u8>,
        last: bool,
    ) -> Option<Vec<u8>> {
        let entry = self.ib_sends.entry(qp).or_default();
        entry.frags.insert(psn, data);
        if !last {
            return None;
        }
        let send = self.ib_sends.remove(&qp)?;
        let mut out = Vec::new();
        for (_, frag) in send.frags {
            out.extend_from_slice(&frag);
        }
        Some(out)
    }

    /// RDMA Write First/Only: the RETH names the target and opens a
    /// sub-segment at the write's PSN.
    pub fn ib_write_open(&mut self, rkey: u32, va: u64, dma_len: u32, psn: u32, data: Vec<u8>, only: bool) {
        let Some(seg) = self.segments.get_mut(&rkey) else {
            warn!(rkey, "RDMA write for unknown handle");
            return;
        };
        let base = va.wrapping_sub(seg.offset);
        let mut sub = SubSeg::new(psn, dma_len, base);
        sub.insert(psn, data, only);
        seg.subsegs.push(sub);
        self.fold_complete(rkey);
    }

    /// RDMA Write Middle/Last: located by PSN containment.
    pub fn ib_write_cont(&mut self, psn: u32, data: Vec<u8>, last: bool) {
        match self.locate(psn) {
            Some(handle) => {
                if let Some(seg) = self.segments.get_mut(&handle) {
                    if let Some(sub) = seg.subsegs.iter_mut().find(|s| s.contains(psn).is_some()) {
                        sub.insert(psn, data, last);
                    }
                }
                self.fold_complete(handle);
            }
            None => warn!(psn, "RDMA write fragment outside any sub-segment"),
        }
    }

    /// Read request: opens the response PSN window against the source
    /// handle.
    pub fn ib_read_request(&mut self, rkey: u32, va: u64, dma_len: u32, psn: u32) {
        let Some(seg) = self.segments.get_mut(&rkey) else {
            warn!(rkey, "RDMA read request for unknown handle");
            return;
        };
        let base = va.wrapping_sub(seg.offset);
        debug!(rkey, psn, dma_len, "read request opened PSN window");
        seg.subsegs.push(SubSeg::new(psn, dma_len, base));
    }

    /// Read response fragment. On the Last/Only fragment, if every
    /// segment of the owning message's chunk list is complete, the
    /// reconstructed RPC message is returned for decoding.
    pub fn ib_read_response(&mut self, psn: u32, data: Vec<u8>, last: bool) -> Option<Vec<u8>> {
        let handle = match self.locate(psn) {
            Some(h) => h,
            None => {
                warn!(psn, "read response outside any sub-segment");
                return None;
            }
        };
        if let Some(seg) = self.segments.get_mut(&handle) {
            if let Some(sub) = seg.subsegs.iter_mut().find(|s| s.contains(psn).is_some()) {
                sub.insert(psn, data, last);
            }
        }
        self.fold_complete(handle);
        if last {
            return self.check_pending(handle);
        }
        None
    }

    // --- iWARP paths ------------------------------------------------------

    /// DDP tagged RDMA Write: direct placement by STag and offset.
    pub fn tagged_write(&mut self, stag: u32, to: u64, data: &[u8]) {
        let Some(seg) = self.segments.get_mut(&stag) else {
            warn!(stag, "tagged write for unknown STag");
            return;
        };
        let pos = to.wrapping_sub(seg.offset) as usize;
        seg.place(pos, data);
    }

    /// iWARP read request: binds the sink STag so responses addressed to
    /// it reach the registered source chunk.
    pub fn iwarp_read_request(&mut self, sink_stag: u32, sink_to: u64, len: u32, source_stag: u32, source_to: u64) {
        if !self.segments.contains_key(&source_stag) {
            warn!(source_stag, "read request for unregistered source STag");
            return;
        }
        debug!(sink_stag, source_stag, len, "read response binding established");
        let _ = (sink_to, source_to);
        self.sink_to_source.insert(sink_stag, source_stag);
    }

    /// DDP tagged read response addressed to a sink STag.
    pub fn tagged_read_response(&mut self, stag: u32, to: u64, data: &[u8], last: bool) -> Option<Vec<u8>> {
        let source = match self.sink_to_source.get(&stag) {
            Some(&s) => s,
            None => {
                warn!(stag, "read response for unbound sink STag");
                return None;
            }
        };
        if let Some(seg) = self.segments.get_mut(&source) {
            let pos = to.wrapping_sub(seg.offset) as usize;
            seg.place(pos, data);
        }
        if last {
            self.sink_to_source.remove(&stag);
            return self.check_pending(source);
        }
        None
    }

    /// iWARP Send fragment keyed by DDP (queue, msn); offsets order the
    /// fragments and the table entry clears on Last.
    pub fn untagged_send_fragment(
        &mut self,
        queue: u32,
        msn: u32,
        mo: u32,
        data: Vec<u8>,
        last: bool,
    ) -> Option<Vec<u8>> {
        let entry = self.sends.entry((queue, msn)).or_default();
        entry.frags.insert(mo, data);
        if !last {
            return None;
        }
        let send = self.sends.remove(&(queue, msn))?;
        let mut out = Vec::new();
        for (_, frag) in send.frags {
            out.extend_from_slice(&frag);
        }
        Some(out)
    }

    // --- completion plumbing ----------------------------------------------

    /// Segment owning the sub-segment whose PSN window contains `psn`.
    fn locate(&self, psn: u32) -> Option<u32> {
        let mut best: Option<(u32, u32)> = None;
        for (&handle, seg) in &self.segments {
            for sub in &seg.subsegs {
                if let Some(delta) = sub.contains(psn) {
                    if best.map_or(true, |(_, d)| delta < d) {
                        best = Some((handle, delta));
                    }
                }
            }
        }
        best.map(|(h, _)| h)
    }

    /// Folds completed sub-segments into their segment's byte image.
    fn fold_complete(&mut self, handle: u32) {
        let Some(seg) = self.segments.get_mut(&handle) else { return };
        let mut i = 0;
        while i < seg.subsegs.len() {
            if seg.subsegs[i].state == SubSegState::Complete {
                let mut sub = seg.subsegs.remove(i);
                let bytes = sub.assemble();
                let pos = sub.base as usize;
                seg.place(pos, &bytes);
                trace!(handle, pos, len = bytes.len(), "sub-segment folded");
            } else {
                i += 1;
            }
        }
    }

    /// If the message waiting on `handle` now has every chunk segment
    /// complete, splices the read chunks into the reduced message and
    /// returns the rebuilt RPC message.
    fn check_pending(&mut self, handle: u32) -> Option<Vec<u8>> {
        let xid = *self.handle_to_xid.get(&handle)?;
        let pending = self.pending.get(&xid)?;
        let all_complete = pending
            .chunks
            .iter()
            .flat_map(|c| c.handles.iter())
            .all(|h| self.segments.get(h).is_some_and(Segment::is_complete));
        if !all_complete {
            return None;
        }
        let pending = self.pending.remove(&xid)?;
        for chunk in &pending.chunks {
            for h in &chunk.handles {
                self.handle_to_xid.remove(h);
            }
        }
        Some(self.reconstruct(pending))
    }

    /// Splices completed read chunks into the reduced message. Chunks go
    /// in ascending XDR position; each segment is padded to the 4-byte
    /// boundary before the next, except in the Position-Zero Read Chunk
    /// which is delivered without any added padding.
    fn reconstruct(&mut self, pending: PendingReduced) -> Vec<u8> {
        let mut chunks = pending.chunks;
        chunks.sort_by_key(|c| c.xdr_position);

        let reduced = pending.reduced;
        let mut out = Vec::new();
        let mut cursor = 0usize;
        for chunk in chunks {
            let pos = (chunk.xdr_position as usize).min(reduced.len());
            if cursor < pos {
                out.extend_from_slice(&reduced[cursor..pos]);
                cursor = pos;
            }
            let position_zero = chunk.xdr_position == 0;
            for handle in chunk.handles {
                let Some(seg) = self.segments.remove(&handle) else {
                    warn!(handle, "chunk segment vanished before reconstruction");
                    continue;
                };
                let bytes = seg.into_bytes();
                out.extend_from_slice(&bytes);
                if !position_zero {
                    let pad = (4 - bytes.len() % 4) % 4;
                    out.extend(std::iter::repeat(0u8).take(pad));
                }
            }
        }
        out.extend_from_slice(&reduced[cursor..]);
        debug!(len = out.len(), "reconstructed reduced message with read chunks");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psn_delta_wraps() {
        assert_eq!(psn_delta(10, 12), 2);
        assert_eq!(psn_delta(0x00FF_FFFE, 1), 3);
        assert_eq!(psn_delta(5, 5), 0);
    }

    #[test]
    fn out_of_order_write_fragments_complete() {
        let mut rdma = RdmaReassembly::default();
        rdma.register_segment(0xB, 0, 12, 0);
        rdma.ib_write_open(0xB, 0, 12, 100, vec![1, 2, 3, 4], false);
        // last arrives before the middle fragment
        rdma.ib_write_cont(102, vec![9, 10, 11, 12], true);
        assert!(!rdma.segments[&0xB].is_complete());
        rdma.ib_write_cont(101, vec![5, 6, 7, 8], false);
        assert!(rdma.segments[&0xB].is_complete());
        assert_eq!(rdma.segments[&0xB].data, (1..=12).collect::<Vec<u8>>());
    }

    #[test]
    fn position_zero_chunk_gets_no_padding() {
        let mut rdma = RdmaReassembly::default();
        rdma.register_segment(0xA, 0, 5, 0);
        rdma.save_pending(7, Vec::new(), vec![(0, vec![0xA])]);
        rdma.ib_read_request(0xA, 0, 5, 50);
        let msg = rdma.ib_read_response(50, vec![1, 2, 3, 4, 5], true);
        // five bytes, unpadded, nothing appended
        assert_eq!(msg.unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn nonzero_chunk_splices_into_reduced() {
        let mut rdma = RdmaReassembly::default();
        rdma.register_segment(0xC, 0, 6, 8);
        rdma.save_pending(9, vec![0xAA; 12], vec![(8, vec![0xC])]);
        rdma.ib_read_request(0xC, 0, 6, 20);
        let msg = rdma.ib_read_response(20, vec![1, 2, 3, 4, 5, 6], true).unwrap();
        let mut expect = vec![0xAA; 8];
        expect.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        expect.extend_from_slice(&[0, 0]); // pad to 4
        expect.extend_from_slice(&[0xAA; 4]);
        assert_eq!(msg, expect);
    }
}
