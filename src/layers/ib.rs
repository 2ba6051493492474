//! InfiniBand transport decoding: BTH, RETH and AETH.
//!
//! Reached two ways: RoCEv2 (BTH directly after UDP port 4791) and ERF
//! type-21 records, where a Local Route Header precedes the BTH. The
//! PSN in the BTH is the ordering key the reassembly engine uses to
//! place RDMA fragments.

use std::io;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use tracing::debug;

use crate::layers::{deliver_rpc_message, deliver_send_message, DecodeContext};
use crate::matcher::Value;
use crate::pkt::{Layer, Packet};
use crate::unpack::Unpacker;

/// Reliable-connection opcodes of the IBA base transport header.
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ib_opcode {
    SEND_FIRST = 0x00,
    SEND_MIDDLE = 0x01,
    SEND_LAST = 0x02,
    SEND_LAST_IMM = 0x03,
    SEND_ONLY = 0x04,
    SEND_ONLY_IMM = 0x05,
    RDMA_WRITE_FIRST = 0x06,
    RDMA_WRITE_MIDDLE = 0x07,
    RDMA_WRITE_LAST = 0x08,
    RDMA_WRITE_LAST_IMM = 0x09,
    RDMA_WRITE_ONLY = 0x0A,
    RDMA_WRITE_ONLY_IMM = 0x0B,
    RDMA_READ_REQUEST = 0x0C,
    RDMA_READ_RESPONSE_FIRST = 0x0D,
    RDMA_READ_RESPONSE_MIDDLE = 0x0E,
    RDMA_READ_RESPONSE_LAST = 0x0F,
    RDMA_READ_RESPONSE_ONLY = 0x10,
    ACKNOWLEDGE = 0x11,
    ATOMIC_ACKNOWLEDGE = 0x12,
    COMPARE_SWAP = 0x13,
    FETCH_ADD = 0x14,
}

/// RDMA extended transport header carried by writes and read requests.
#[derive(Debug, Clone, Copy)]
pub struct Reth {
    pub va: u64,
    pub rkey: u32,
    pub dma_len: u32,
}

/// ACK extended transport header carried by read responses and acks.
#[derive(Debug, Clone, Copy)]
pub struct Aeth {
    pub syndrome: u8,
    pub msn: u32,
}

#[derive(Debug, Clone)]
pub struct Ib {
    pub opcode: ib_opcode,
    pub se: bool,
    pub migreq: bool,
    pub pad: u8,
    pub tver: u8,
    pub pkey: u16,
    pub dest_qp: u32,
    pub ackreq: bool,
    pub psn: u32,
    pub reth: Option<Reth>,
    pub aeth: Option<Aeth>,
    pub immediate: Option<u32>,
}

impl Ib {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "opcode" => Some(Value::Int(self.opcode as i64)),
            "opname" => Some(Value::Str(format!("{:?}", self.opcode))),
            "se" => Some(Value::Bool(self.se)),
            "pad" => Some(Value::Int(self.pad as i64)),
            "pkey" => Some(Value::Int(self.pkey as i64)),
            "dest_qp" => Some(Value::Int(self.dest_qp as i64)),
            "ackreq" => Some(Value::Bool(self.ackreq)),
            "psn" => Some(Value::Int(self.psn as i64)),
            "va" => self.reth.map(|r| Value::Int(r.va as i64)),
            "rkey" => self.reth.map(|r| Value::Int(r.rkey as i64)),
            "dma_len" => self.reth.map(|r| Value::Int(r.dma_len as i64)),
            "syndrome" => self.aeth.map(|a| Value::Int(a.syndrome as i64)),
            "msn" => self.aeth.map(|a| Value::Int(a.msn as i64)),
            "immediate" => self.immediate.map(|v| Value::Int(v as i64)),
            _ => None,
        }
    }
}

/// ERF InfiniBand records start with an 8-byte Local Route Header.
pub fn decode_lrh(u: &mut Unpacker, pkt: &mut Packet, ctx: &mut DecodeContext<'_>) -> io::Result<()> {
    let b0 = u.unpack_u8()?;
    let b1 = u.unpack_u8()?;
    let _dlid = u.unpack_u16()?;
    let _len = u.unpack_u16()?;
    let _slid = u.unpack_u16()?;
    let _vl = b0 >> 4;
    let lnh = b1 & 0x3;
    if lnh != 2 {
        // only IBA local (BTH next) traffic is interesting here
        return Err(io::Error::new(io::ErrorKind::InvalidData, "LRH next header is not BTH"));
    }
    decode(u, pkt, ctx)
}

pub fn decode(u: &mut Unpacker, pkt: &mut Packet, ctx: &mut DecodeContext<'_>) -> io::Result<()> {
    let opcode_raw = u.unpack_u8()?;
    let opcode = ib_opcode::from_u8(opcode_raw)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unsupported BTH opcode"))?;
    let b1 = u.unpack_u8()?;
    let pkey = u.unpack_u16()?;
    let _resv = u.unpack_u8()?;
    let dest_qp = u.unpack_u24()?;
    let a = u.unpack_u8()?;
    let psn = u.unpack_u24()?;

    let mut layer = Ib {
        opcode,
        se: b1 & 0x80 != 0,
        migreq: b1 & 0x40 != 0,
        pad: (b1 >> 4) & 0x3,
        tver: b1 & 0xF,
        pkey,
        dest_qp,
        ackreq: a & 0x80 != 0,
        psn,
        reth: None,
        aeth: None,
        immediate: None,
    };

    use ib_opcode::*;
    match opcode {
        RDMA_WRITE_FIRST | RDMA_WRITE_ONLY | RDMA_WRITE_ONLY_IMM | RDMA_READ_REQUEST => {
            layer.reth = Some(Reth {
                va: u.unpack_u64()?,
                rkey: u.unpack_u32()?,
                dma_len: u.unpack_u32()?,
            });
        }
        RDMA_READ_RESPONSE_FIRST | RDMA_READ_RESPONSE_LAST | RDMA_READ_RESPONSE_ONLY
        | ACKNOWLEDGE | ATOMIC_ACKNOWLEDGE => {
            let syndrome = u.unpack_u8()?;
            let msn = u.unpack_u24()?;
            layer.aeth = Some(Aeth { syndrome, msn });
        }
        _ => {}
    }
    if matches!(opcode, SEND_LAST_IMM | SEND_ONLY_IMM | RDMA_WRITE_LAST_IMM | RDMA_WRITE_ONLY_IMM) {
        layer.immediate = Some(u.unpack_u32()?);
    }

    // payload is what remains minus the ICRC and the BTH pad count
    let mut payload = u.read_all();
    if payload.len() >= 4 {
        payload.truncate(payload.len() - 4);
    }
    let pad = layer.pad as usize;
    if pad > 0 && payload.len() >= pad {
        payload.truncate(payload.len() - pad);
    }

    let reth = layer.reth;
    pkt.push(Layer::Ib(layer));

    match opcode {
        SEND_FIRST | SEND_MIDDLE => {
            let _ = ctx.state.rdma.ib_send_fragment(dest_qp, psn, payload, false);
        }
        SEND_LAST | SEND_LAST_IMM | SEND_ONLY | SEND_ONLY_IMM => {
            if let Some(message) = ctx.state.rdma.ib_send_fragment(dest_qp, psn, payload, true) {
                deliver_send_message(message, u, pkt, ctx);
            }
        }
        RDMA_WRITE_FIRST => {
            if let Some(r) = reth {
                ctx.state.rdma.ib_write_open(r.rkey, r.va, r.dma_len, psn, payload, false);
            }
        }
        RDMA_WRITE_ONLY | RDMA_WRITE_ONLY_IMM => {
            if let Some(r) = reth {
                ctx.state.rdma.ib_write_open(r.rkey, r.va, r.dma_len, psn, payload, true);
            }
        }
        RDMA_WRITE_MIDDLE => ctx.state.rdma.ib_write_cont(psn, payload, false),
        RDMA_WRITE_LAST | RDMA_WRITE_LAST_IMM => ctx.state.rdma.ib_write_cont(psn, payload, true),
        RDMA_READ_REQUEST => {
            if let Some(r) = reth {
                ctx.state.rdma.ib_read_request(r.rkey, r.va, r.dma_len, psn);
            }
        }
        RDMA_READ_RESPONSE_FIRST | RDMA_READ_RESPONSE_MIDDLE => {
            let _ = ctx.state.rdma.ib_read_response(psn, payload, false);
        }
        RDMA_READ_RESPONSE_LAST | RDMA_READ_RESPONSE_ONLY => {
            if let Some(message) = ctx.state.rdma.ib_read_response(psn, payload, true) {
                debug!(len = message.len(), "delivering reconstructed RPC message");
                deliver_rpc_message(message, u, pkt, ctx);
            }
        }
        ACKNOWLEDGE | ATOMIC_ACKNOWLEDGE | COMPARE_SWAP | FETCH_ADD => {}
    }
    Ok(())
}

