//! DDP (Direct Data Placement, RFC 5041) decoding.
//!
//! A DDP message is either tagged (placed directly by STag and tagged
//! offset) or untagged (delivered to a queue by message sequence
//! number). The RDMAP control byte rides in DDP's reserved-ULP octet
//! and is handed onward to the RDMAP decoder.

use std::io;

use crate::layers::{rdmap, DecodeContext};
use crate::matcher::Value;
use crate::pkt::{Layer, Packet};
use crate::unpack::Unpacker;

#[derive(Debug, Clone)]
pub struct Ddp {
    pub tagged: bool,
    pub last: bool,
    pub version: u8,
    /// Tagged variant.
    pub stag: Option<u32>,
    pub to: Option<u64>,
    /// Untagged variant.
    pub queue: Option<u32>,
    pub msn: Option<u32>,
    pub mo: Option<u32>,
}

impl Ddp {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "tagged" => Some(Value::Bool(self.tagged)),
            "last" => Some(Value::Bool(self.last)),
            "version" => Some(Value::Int(self.version as i64)),
            "stag" => self.stag.map(|v| Value::Int(v as i64)),
            "to" => self.to.map(|v| Value::Int(v as i64)),
            "queue" => self.queue.map(|v| Value::Int(v as i64)),
            "msn" => self.msn.map(|v| Value::Int(v as i64)),
            "mo" => self.mo.map(|v| Value::Int(v as i64)),
            _ => None,
        }
    }
}

pub fn decode(u: &mut Unpacker, pkt: &mut Packet, ctx: &mut DecodeContext<'_>) -> io::Result<()> {
    let control = u.unpack_u8()?;
    let tagged = control & 0x80 != 0;
    let last = control & 0x40 != 0;
    let version = control & 0x03;
    if version != 1 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported DDP version"));
    }
    // RDMAP control byte lives in the reserved ULP octet
    let rdmap_control = u.unpack_u8()?;

    let layer = if tagged {
        let stag = u.unpack_u32()?;
        let to = u.unpack_u64()?;
        Ddp { tagged, last, version, stag: Some(stag), to: Some(to), queue: None, msn: None, mo: None }
    } else {
        let queue = u.unpack_u32()?;
        let msn = u.unpack_u32()?;
        let mo = u.unpack_u32()?;
        Ddp {
            tagged,
            last,
            version,
            stag: None,
            to: None,
            queue: Some(queue),
            msn: Some(msn),
            mo: Some(mo),
        }
    };
    let info = layer.clone();
    pkt.push(Layer::Ddp(layer));
    rdmap::decode(u, pkt, ctx, rdmap_control, &info)
}
