//! RPC-over-RDMA transport header (RFC 8166).
//!
//! Every RDMA Send carrying RPC traffic starts with this header: the
//! transaction id, credits, a message class and three chunk lists. The
//! chunk lists drive the reassembly engine: read chunks pull large call
//! payloads from the sender, write chunks are pre-posted reply targets,
//! and the reply chunk carries an entire long reply.

use std::io;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use tracing::{debug, trace};

use crate::layers::{rpc, DecodeContext};
use crate::matcher::Value;
use crate::pkt::{DataLayer, Layer, LayerKind, Packet};
use crate::unpack::Unpacker;

pub const RPCRDMA_VERSION: u32 = 1;

/// Message classes of the RPC-over-RDMA header.
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum rdma_proc {
    RDMA_MSG = 0,
    RDMA_NOMSG = 1,
    RDMA_MSGP = 2,
    RDMA_DONE = 3,
    RDMA_ERROR = 4,
}

/// One plain chunk segment: `(handle, length, offset)`.
#[derive(Debug, Clone)]
pub struct RdmaSegment {
    pub handle: u32,
    pub length: u32,
    pub offset: u64,
}

/// One read list entry; entries sharing an XDR position form a chunk.
#[derive(Debug, Clone)]
pub struct ReadSegment {
    pub xdr_position: u32,
    pub handle: u32,
    pub length: u32,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct RpcOrdma {
    pub xid: u32,
    pub vers: u32,
    pub credit: u32,
    pub procedure: rdma_proc,
    pub reads: Vec<ReadSegment>,
    pub writes: Vec<Vec<RdmaSegment>>,
    pub reply: Option<Vec<RdmaSegment>>,
}

fn segment_value(seg: &RdmaSegment) -> Value {
    Value::from_entries([
        ("handle", Value::Int(seg.handle as i64)),
        ("length", Value::Int(seg.length as i64)),
        ("offset", Value::Int(seg.offset as i64)),
    ])
}

impl RpcOrdma {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "xid" => Some(Value::Int(self.xid as i64)),
            "vers" => Some(Value::Int(self.vers as i64)),
            "credit" => Some(Value::Int(self.credit as i64)),
            "proc" | "procedure" => Some(Value::Int(self.procedure as i64)),
            "reads" => Some(Value::List(
                self.reads
                    .iter()
                    .map(|r| {
                        Value::from_entries([
                            ("position", Value::Int(r.xdr_position as i64)),
                            ("handle", Value::Int(r.handle as i64)),
                            ("length", Value::Int(r.length as i64)),
                            ("offset", Value::Int(r.offset as i64)),
                        ])
                    })
                    .collect(),
            )),
            "writes" => Some(Value::List(
                self.writes
                    .iter()
                    .map(|chunk| Value::List(chunk.iter().map(segment_value).collect()))
                    .collect(),
            )),
            "reply" => self
                .reply
                .as_ref()
                .map(|chunk| Value::List(chunk.iter().map(segment_value).collect())),
            _ => None,
        }
    }
}

fn read_segment_array(u: &mut Unpacker) -> io::Result<Vec<RdmaSegment>> {
    let count = u.unpack_u32()?;
    if count > 256 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "implausible chunk segment count"));
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(RdmaSegment {
            handle: u.unpack_u32()?,
            length: u.unpack_u32()?,
            offset: u.unpack_u64()?,
        });
    }
    Ok(out)
}

/// Decodes the header from a completed Send payload and routes the
/// message through the reassembly engine.
pub fn decode(u: &mut Unpacker, pkt: &mut Packet, ctx: &mut DecodeContext<'_>) -> io::Result<()> {
    let xid = u.unpack_u32()?;
    let vers = u.unpack_u32()?;
    if vers != RPCRDMA_VERSION {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "RPC-over-RDMA version is not 1"));
    }
    let credit = u.unpack_u32()?;
    let proc_raw = u.unpack_u32()?;
    let procedure = rdma_proc::from_u32(proc_raw)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown rdma_proc"))?;

    // read list: optional entries of (position, segment)
    let mut reads = Vec::new();
    while u.unpack_u32()? == 1 {
        reads.push(ReadSegment {
            xdr_position: u.unpack_u32()?,
            handle: u.unpack_u32()?,
            length: u.unpack_u32()?,
            offset: u.unpack_u64()?,
        });
        if reads.len() > 256 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "read list runs away"));
        }
    }
    // write list: optional entries of segment arrays
    let mut writes = Vec::new();
    while u.unpack_u32()? == 1 {
        writes.push(read_segment_array(u)?);
        if writes.len() > 256 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "write list runs away"));
        }
    }
    // reply chunk: at most one segment array
    let reply = if u.unpack_u32()? == 1 { Some(read_segment_array(u)?) } else { None };

    trace!(
        xid,
        ?procedure,
        reads = reads.len(),
        writes = writes.len(),
        has_reply = reply.is_some(),
        "RPC-over-RDMA header"
    );

    let layer = RpcOrdma { xid, vers, credit, procedure, reads, writes, reply };
    register(&layer, ctx);
    pkt.push(Layer::RpcOrdma(layer.clone()));

    match layer.procedure {
        rdma_proc::RDMA_MSG => {
            if !layer.reads.is_empty() {
                // park the reduced message until the read chunks land
                let reduced = u.read_all();
                let chunks = group_read_chunks(&layer.reads);
                debug!(xid, len = reduced.len(), "reduced message parked for read chunks");
                ctx.state.rdma.save_pending(xid, reduced, chunks);
                return Ok(());
            }
            // direction by the RPC message type in the reduced payload
            let is_reply = u.peek(8).map(|b| b[4..8] == [0, 0, 0, 1]).unwrap_or(false);
            if is_reply && ctx.state.rdma.has_declared_chunks(xid) {
                let chunks = ctx.state.rdma.collect_write_chunks(xid);
                debug!(xid, chunks = chunks.len(), "write chunk data exposed to reply decoder");
            }
            if rpc::decode(u, pkt, ctx).is_err() && u.remaining() > 0 && !pkt.has(LayerKind::Data) {
                pkt.push(Layer::Data(DataLayer { data: u.read_all() }));
            }
            if is_reply {
                ctx.state.rdma.release_xid(xid);
            }
        }
        rdma_proc::RDMA_NOMSG => {
            if !layer.reads.is_empty() {
                let chunks = group_read_chunks(&layer.reads);
                ctx.state.rdma.save_pending(xid, Vec::new(), chunks);
            } else if let Some(reply_bytes) = ctx.state.rdma.materialize_reply(xid) {
                debug!(xid, len = reply_bytes.len(), "long reply materialized from reply chunk");
                u.insert(&reply_bytes);
                if rpc::decode(u, pkt, ctx).is_err() && !pkt.has(LayerKind::Data) {
                    pkt.push(Layer::Data(DataLayer { data: u.read_all() }));
                }
                ctx.state.rdma.release_xid(xid);
            }
        }
        rdma_proc::RDMA_MSGP | rdma_proc::RDMA_DONE | rdma_proc::RDMA_ERROR => {
            if u.remaining() > 0 && !pkt.has(LayerKind::Data) {
                pkt.push(Layer::Data(DataLayer { data: u.read_all() }));
            }
        }
    }
    Ok(())
}

/// Registers every declared segment and remembers write/reply chunk
/// declarations for the reply's XID lookup.
fn register(layer: &RpcOrdma, ctx: &mut DecodeContext<'_>) {
    let rdma = &mut ctx.state.rdma;
    for seg in &layer.reads {
        rdma.register_segment(seg.handle, seg.offset, seg.length, seg.xdr_position);
    }
    for chunk in &layer.writes {
        for seg in chunk {
            rdma.register_segment(seg.handle, seg.offset, seg.length, 0);
        }
    }
    if let Some(chunk) = &layer.reply {
        for seg in chunk {
            rdma.register_segment(seg.handle, seg.offset, seg.length, 0);
        }
    }
    let writes: Vec<Vec<u32>> =
        layer.writes.iter().map(|c| c.iter().map(|s| s.handle).collect()).collect();
    let reply: Vec<u32> =
        layer.reply.as_ref().map(|c| c.iter().map(|s| s.handle).collect()).unwrap_or_default();
    rdma.declare_chunks(layer.xid, writes, reply);
}

/// Groups read list entries by XDR position, preserving list order
/// within each chunk.
fn group_read_chunks(reads: &[ReadSegment]) -> Vec<(u32, Vec<u32>)> {
    let mut out: Vec<(u32, Vec<u32>)> = Vec::new();
    for seg in reads {
        match out.iter_mut().find(|(pos, _)| *pos == seg.xdr_position) {
            Some((_, handles)) => handles.push(seg.handle),
            None => out.push((seg.xdr_position, vec![seg.handle])),
        }
    }
    out
}
