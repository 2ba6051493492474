//! RPC message decoding as specified in RFC 5531.
//!
//! The trace engine decodes the RPC envelope (xid, call/reply bodies,
//! auth flavors) and keeps an XID map pairing calls with replies. The
//! program payload itself is handed to a pluggable [`ProgramDecoder`]
//! keyed by `(program, version, procedure)`; NFS and the auxiliary
//! programs live behind that seam rather than in this crate.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use tracing::{debug, trace, warn};

use crate::layers::DecodeContext;
use crate::matcher::Value;
use crate::pkt::{AppLayer, DataLayer, Layer, LayerKind, Packet};
use crate::unpack::Unpacker;

pub const RPC_VERSION: u32 = 2;
const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
/// Largest auth body accepted before the message is declared non-RPC.
const MAX_AUTH_BODY: u32 = 400;

/// Authentication flavors of RFC 5531 plus RPCSEC_GSS.
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum auth_flavor {
    #[default]
    AUTH_NULL = 0,
    AUTH_UNIX = 1,
    AUTH_SHORT = 2,
    AUTH_DES = 3,
    RPCSEC_GSS = 6,
}

/// Decoded RPC envelope. Call-only and reply-only fields are optional.
#[derive(Debug, Clone)]
pub struct Rpc {
    pub xid: u32,
    /// 0 = call, 1 = reply.
    pub mtype: u32,
    pub program: Option<u32>,
    pub version: Option<u32>,
    pub procedure: Option<u32>,
    pub cred_flavor: Option<auth_flavor>,
    pub verf_flavor: Option<auth_flavor>,
    pub reply_stat: Option<u32>,
    pub accept_stat: Option<u32>,
}

impl Rpc {
    pub fn is_call(&self) -> bool {
        self.mtype == MSG_CALL
    }

    pub fn is_reply(&self) -> bool {
        self.mtype == MSG_REPLY
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "xid" => Some(Value::Int(self.xid as i64)),
            "type" | "mtype" => Some(Value::Int(self.mtype as i64)),
            "program" => self.program.map(|v| Value::Int(v as i64)),
            "version" => self.version.map(|v| Value::Int(v as i64)),
            "procedure" | "proc" => self.procedure.map(|v| Value::Int(v as i64)),
            "cred_flavor" => self.cred_flavor.map(|v| Value::Int(v as i64)),
            "verf_flavor" => self.verf_flavor.map(|v| Value::Int(v as i64)),
            "reply_stat" => self.reply_stat.map(|v| Value::Int(v as i64)),
            "accept_stat" => self.accept_stat.map(|v| Value::Int(v as i64)),
            _ => None,
        }
    }
}

/// What the XID map remembers about a call until its reply shows up.
#[derive(Debug, Clone)]
pub struct XidEntry {
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    /// Packet index of the call.
    pub call_index: u64,
    pub call_frame: u64,
}

/// `xid → call` map used for reply decoding and call/reply pairing.
#[derive(Debug, Default)]
pub struct XidMap {
    entries: HashMap<u32, XidEntry>,
}

impl XidMap {
    pub fn record_call(&mut self, xid: u32, entry: XidEntry) {
        if self.entries.insert(xid, entry).is_some() {
            trace!(xid, "xid reused before its reply was seen");
        }
    }

    pub fn lookup(&self, xid: u32) -> Option<&XidEntry> {
        self.entries.get(&xid)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Program info passed to pluggable decoders.
#[derive(Debug, Clone, Copy)]
pub struct ProgramInfo {
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
}

/// Extra context for pluggable decoders: RDMA write chunk data exposed
/// in declaration order, for replies whose large opaques were delivered
/// by RDMA Write instead of inline bytes.
pub struct DecodeAux<'a> {
    pub write_chunks: &'a [Vec<Vec<u8>>],
}

/// Upper-layer XDR decoding seam. Implementations decode one or more
/// RPC programs into application layers; the engine supplies the
/// envelope and the payload cursor.
pub trait ProgramDecoder: Send + Sync {
    /// Decodes a call body. `Ok(None)` means the program is not handled
    /// by this decoder.
    fn decode_call(
        &self,
        info: &ProgramInfo,
        u: &mut Unpacker,
        aux: &DecodeAux<'_>,
    ) -> io::Result<Option<AppLayer>>;

    /// Decodes a reply body for a call previously seen with `info`.
    fn decode_reply(
        &self,
        info: &ProgramInfo,
        u: &mut Unpacker,
        aux: &DecodeAux<'_>,
    ) -> io::Result<Option<AppLayer>>;
}

/// Ordered set of registered program decoders.
#[derive(Clone, Default)]
pub struct ProgramRegistry {
    decoders: Vec<Arc<dyn ProgramDecoder>>,
}

impl ProgramRegistry {
    pub fn register(&mut self, decoder: Arc<dyn ProgramDecoder>) {
        self.decoders.push(decoder);
    }

    fn decode_call(
        &self,
        info: &ProgramInfo,
        u: &mut Unpacker,
        aux: &DecodeAux<'_>,
    ) -> Option<AppLayer> {
        for decoder in &self.decoders {
            let entry = u.tell();
            match decoder.decode_call(info, u, aux) {
                Ok(Some(layer)) => return Some(layer),
                Ok(None) => {}
                Err(e) => {
                    debug!(program = info.program, error = %e, "program call decode rejected");
                    let _ = u.seek(io::SeekFrom::Start(entry as u64));
                }
            }
        }
        None
    }

    fn decode_reply(
        &self,
        info: &ProgramInfo,
        u: &mut Unpacker,
        aux: &DecodeAux<'_>,
    ) -> Option<AppLayer> {
        for decoder in &self.decoders {
            let entry = u.tell();
            match decoder.decode_reply(info, u, aux) {
                Ok(Some(layer)) => return Some(layer),
                Ok(None) => {}
                Err(e) => {
                    debug!(program = info.program, error = %e, "program reply decode rejected");
                    let _ = u.seek(io::SeekFrom::Start(entry as u64));
                }
            }
        }
        None
    }
}

fn bad(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Reads an opaque_auth, rejecting implausible values so non-RPC
/// payloads dispatched here by guesswork fall out early.
fn read_auth(u: &mut Unpacker) -> io::Result<auth_flavor> {
    let flavor_raw = u.unpack_u32()?;
    let length = u.unpack_u32()?;
    if length > MAX_AUTH_BODY {
        return Err(bad("auth body too long"));
    }
    let _body = u.read(length as usize)?;
    Ok(auth_flavor::from_u32(flavor_raw).unwrap_or_default())
}

/// Decodes one RPC message from `u`. On sanity failure the cursor is
/// restored and the caller keeps the payload raw.
pub fn decode(u: &mut Unpacker, pkt: &mut Packet, ctx: &mut DecodeContext<'_>) -> io::Result<()> {
    let entry = u.tell();
    let result = decode_inner(u, pkt, ctx);
    if result.is_err() {
        let _ = u.seek(io::SeekFrom::Start(entry as u64));
    }
    result
}

fn decode_inner(
    u: &mut Unpacker,
    pkt: &mut Packet,
    ctx: &mut DecodeContext<'_>,
) -> io::Result<()> {
    let xid = u.unpack_u32()?;
    let mtype = u.unpack_u32()?;

    let mut layer = Rpc {
        xid,
        mtype,
        program: None,
        version: None,
        procedure: None,
        cred_flavor: None,
        verf_flavor: None,
        reply_stat: None,
        accept_stat: None,
    };

    match mtype {
        MSG_CALL => {
            let rpcvers = u.unpack_u32()?;
            if rpcvers != RPC_VERSION {
                return Err(bad("RPC version is not 2"));
            }
            let program = u.unpack_u32()?;
            let version = u.unpack_u32()?;
            let procedure = u.unpack_u32()?;
            layer.program = Some(program);
            layer.version = Some(version);
            layer.procedure = Some(procedure);
            layer.cred_flavor = Some(read_auth(u)?);
            layer.verf_flavor = Some(read_auth(u)?);

            ctx.state.xid_map.record_call(
                xid,
                XidEntry {
                    program,
                    version,
                    procedure,
                    call_index: pkt.index,
                    call_frame: pkt.record.frame,
                },
            );
            trace!(xid, program, procedure, "RPC call");
            pkt.push(Layer::Rpc(layer));

            let info = ProgramInfo { program, version, procedure };
            let aux = DecodeAux { write_chunks: &ctx.state.rdma.write_chunks };
            if let Some(app) = ctx.programs.decode_call(&info, u, &aux) {
                pkt.push(Layer::App(app));
            }
        }
        MSG_REPLY => {
            let reply_stat = u.unpack_u32()?;
            if reply_stat > 1 {
                return Err(bad("implausible RPC reply_stat"));
            }
            layer.reply_stat = Some(reply_stat);
            if reply_stat == 0 {
                layer.verf_flavor = Some(read_auth(u)?);
                layer.accept_stat = Some(u.unpack_u32()?);
            }
            let call = ctx.state.xid_map.lookup(xid).cloned();
            if call.is_none() {
                debug!(xid, "reply without a recorded call");
            }
            if let Some(ref entry) = call {
                layer.program = Some(entry.program);
                layer.version = Some(entry.version);
                layer.procedure = Some(entry.procedure);
            }
            let accepted = layer.accept_stat == Some(0);
            trace!(xid, accepted, "RPC reply");
            pkt.push(Layer::Rpc(layer));

            if let Some(entry) = call {
                if accepted {
                    let info = ProgramInfo {
                        program: entry.program,
                        version: entry.version,
                        procedure: entry.procedure,
                    };
                    let aux = DecodeAux { write_chunks: &ctx.state.rdma.write_chunks };
                    if let Some(app) = ctx.programs.decode_reply(&info, u, &aux) {
                        pkt.push(Layer::App(app));
                    }
                }
            }
        }
        other => {
            warn!(xid, mtype = other, "not an RPC message type");
            return Err(bad("unknown RPC message type"));
        }
    }

    // whatever the program decoder left behind stays visible as data
    if u.remaining() > 0 && !pkt.has(LayerKind::Data) {
        pkt.push(Layer::Data(DataLayer { data: u.read_all() }));
    }
    Ok(())
}
