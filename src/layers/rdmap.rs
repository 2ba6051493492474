//! RDMAP (RFC 5040) decoding over DDP.
//!
//! One control byte selects the operation; tagged messages place bytes
//! (writes and read responses), untagged messages carry sends, read
//! requests and terminates. Placement and reassembly are delegated to
//! the RDMA engine; completed messages come back here for upper-layer
//! decoding.

use std::io;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use tracing::warn;

use crate::layers::ddp::Ddp;
use crate::layers::{deliver_rpc_message, deliver_send_message, DecodeContext};
use crate::matcher::Value;
use crate::pkt::{Layer, Packet};
use crate::unpack::Unpacker;

/// DDP queue numbers RDMAP assigns to untagged messages.
const QN_SEND: u32 = 0;
const QN_READ_REQUEST: u32 = 1;
const QN_TERMINATE: u32 = 2;

#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum rdmap_opcode {
    RDMA_WRITE = 0x0,
    RDMA_READ_REQUEST = 0x1,
    RDMA_READ_RESPONSE = 0x2,
    SEND = 0x3,
    SEND_INVALIDATE = 0x4,
    SEND_SE = 0x5,
    SEND_SE_INVALIDATE = 0x6,
    TERMINATE = 0x7,
}

/// Read request body carried on queue 1.
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest {
    pub sink_stag: u32,
    pub sink_offset: u64,
    pub dma_len: u32,
    pub source_stag: u32,
    pub source_offset: u64,
}

/// Terminate control fields; the optional terminated-header echo stays
/// raw.
#[derive(Debug, Clone)]
pub struct Terminate {
    pub layer: u8,
    pub etype: u8,
    pub ecode: u8,
    pub hdrct: u8,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Rdmap {
    pub version: u8,
    pub opcode: rdmap_opcode,
    pub read_request: Option<ReadRequest>,
    pub terminate: Option<Terminate>,
}

impl Rdmap {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "version" => Some(Value::Int(self.version as i64)),
            "opcode" => Some(Value::Int(self.opcode as i64)),
            "opname" => Some(Value::Str(format!("{:?}", self.opcode))),
            "sink_stag" => self.read_request.map(|r| Value::Int(r.sink_stag as i64)),
            "sink_offset" => self.read_request.map(|r| Value::Int(r.sink_offset as i64)),
            "dma_len" => self.read_request.map(|r| Value::Int(r.dma_len as i64)),
            "source_stag" => self.read_request.map(|r| Value::Int(r.source_stag as i64)),
            "source_offset" => self.read_request.map(|r| Value::Int(r.source_offset as i64)),
            "term_layer" => self.terminate.as_ref().map(|t| Value::Int(t.layer as i64)),
            "term_etype" => self.terminate.as_ref().map(|t| Value::Int(t.etype as i64)),
            "term_ecode" => self.terminate.as_ref().map(|t| Value::Int(t.ecode as i64)),
            _ => None,
        }
    }
}

pub fn decode(
    u: &mut Unpacker,
    pkt: &mut Packet,
    ctx: &mut DecodeContext<'_>,
    control: u8,
    ddp: &Ddp,
) -> io::Result<()> {
    let version = control >> 6;
    let opcode = rdmap_opcode::from_u8(control & 0x0F)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown RDMAP opcode"))?;

    let mut layer = Rdmap { version, opcode, read_request: None, terminate: None };

    use rdmap_opcode::*;
    match opcode {
        RDMA_WRITE => {
            let (Some(stag), Some(to)) = (ddp.stag, ddp.to) else {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "untagged RDMA write"));
            };
            let payload = u.read_all();
            pkt.push(Layer::Rdmap(layer));
            ctx.state.rdma.tagged_write(stag, to, &payload);
        }
        RDMA_READ_RESPONSE => {
            let (Some(stag), Some(to)) = (ddp.stag, ddp.to) else {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "untagged read response"));
            };
            let payload = u.read_all();
            pkt.push(Layer::Rdmap(layer));
            if let Some(message) =
                ctx.state.rdma.tagged_read_response(stag, to, &payload, ddp.last)
            {
                deliver_rpc_message(message, u, pkt, ctx);
            }
        }
        RDMA_READ_REQUEST => {
            if ddp.queue != Some(QN_READ_REQUEST) {
                warn!(queue = ?ddp.queue, "read request on unexpected DDP queue");
            }
            let request = ReadRequest {
                sink_stag: u.unpack_u32()?,
                sink_offset: u.unpack_u64()?,
                dma_len: u.unpack_u32()?,
                source_stag: u.unpack_u32()?,
                source_offset: u.unpack_u64()?,
            };
            layer.read_request = Some(request);
            pkt.push(Layer::Rdmap(layer));
            ctx.state.rdma.iwarp_read_request(
                request.sink_stag,
                request.sink_offset,
                request.dma_len,
                request.source_stag,
                request.source_offset,
            );
        }
        SEND | SEND_INVALIDATE | SEND_SE | SEND_SE_INVALIDATE => {
            if ddp.queue != Some(QN_SEND) {
                warn!(queue = ?ddp.queue, "send on unexpected DDP queue");
            }
            let (queue, msn, mo) = (
                ddp.queue.unwrap_or(QN_SEND),
                ddp.msn.unwrap_or(0),
                ddp.mo.unwrap_or(0),
            );
            let payload = u.read_all();
            pkt.push(Layer::Rdmap(layer));
            if let Some(message) =
                ctx.state.rdma.untagged_send_fragment(queue, msn, mo, payload, ddp.last)
            {
                deliver_send_message(message, u, pkt, ctx);
            }
        }
        TERMINATE => {
            if ddp.queue != Some(QN_TERMINATE) {
                warn!(queue = ?ddp.queue, "terminate on unexpected DDP queue");
            }
            let word = u.unpack_u32()?;
            layer.terminate = Some(Terminate {
                layer: (word >> 28) as u8,
                etype: ((word >> 24) & 0xF) as u8,
                ecode: ((word >> 16) & 0xFF) as u8,
                hdrct: ((word >> 13) & 0x7) as u8,
                raw: u.read_all(),
            });
            pkt.push(Layer::Rdmap(layer));
        }
    }
    Ok(())
}
