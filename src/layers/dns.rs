//! Minimal DNS decoder: header, section counts and the first question.
//!
//! Just enough structure for trace predicates over DNS traffic; resource
//! record bodies are not decoded.

use std::io;

use crate::matcher::Value;
use crate::pkt::{Layer, Packet};
use crate::unpack::Unpacker;

#[derive(Debug, Clone)]
pub struct Dns {
    pub id: u16,
    pub qr: bool,
    pub opcode: u8,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub rcode: u8,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
    pub qname: Option<String>,
    pub qtype: Option<u16>,
    pub qclass: Option<u16>,
}

impl Dns {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::Int(self.id as i64)),
            "qr" => Some(Value::Bool(self.qr)),
            "opcode" => Some(Value::Int(self.opcode as i64)),
            "aa" => Some(Value::Bool(self.aa)),
            "tc" => Some(Value::Bool(self.tc)),
            "rd" => Some(Value::Bool(self.rd)),
            "ra" => Some(Value::Bool(self.ra)),
            "rcode" => Some(Value::Int(self.rcode as i64)),
            "qdcount" => Some(Value::Int(self.qdcount as i64)),
            "ancount" => Some(Value::Int(self.ancount as i64)),
            "nscount" => Some(Value::Int(self.nscount as i64)),
            "arcount" => Some(Value::Int(self.arcount as i64)),
            "qname" => self.qname.clone().map(Value::Str),
            "qtype" => self.qtype.map(|v| Value::Int(v as i64)),
            "qclass" => self.qclass.map(|v| Value::Int(v as i64)),
            _ => None,
        }
    }
}

/// Reads a DNS name. Compression pointers are followed at most once,
/// which is all a question section can legally need.
fn read_name(u: &mut Unpacker) -> io::Result<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut hops = 0;
    let mut return_to: Option<usize> = None;
    loop {
        let len = u.unpack_u8()?;
        if len == 0 {
            break;
        }
        if len & 0xC0 == 0xC0 {
            let low = u.unpack_u8()?;
            let target = ((len as usize & 0x3F) << 8) | low as usize;
            hops += 1;
            if hops > 8 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "DNS pointer loop"));
            }
            if return_to.is_none() {
                return_to = Some(u.tell());
            }
            u.seek(io::SeekFrom::Start(target as u64))?;
            continue;
        }
        if len > 63 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "DNS label too long"));
        }
        let bytes = u.read(len as usize)?;
        labels.push(String::from_utf8_lossy(&bytes).into_owned());
    }
    if let Some(pos) = return_to {
        u.seek(io::SeekFrom::Start(pos as u64))?;
    }
    Ok(labels.join("."))
}

pub fn decode(u: &mut Unpacker, pkt: &mut Packet) -> io::Result<()> {
    let id = u.unpack_u16()?;
    let flags = u.unpack_u16()?;
    let qdcount = u.unpack_u16()?;
    let ancount = u.unpack_u16()?;
    let nscount = u.unpack_u16()?;
    let arcount = u.unpack_u16()?;

    let mut layer = Dns {
        id,
        qr: flags & 0x8000 != 0,
        opcode: ((flags >> 11) & 0xF) as u8,
        aa: flags & 0x0400 != 0,
        tc: flags & 0x0200 != 0,
        rd: flags & 0x0100 != 0,
        ra: flags & 0x0080 != 0,
        rcode: (flags & 0xF) as u8,
        qdcount,
        ancount,
        nscount,
        arcount,
        qname: None,
        qtype: None,
        qclass: None,
    };
    if qdcount > 0 {
        layer.qname = Some(read_name(u)?);
        layer.qtype = Some(u.unpack_u16()?);
        layer.qclass = Some(u.unpack_u16()?);
    }
    pkt.push(Layer::Dns(layer));
    Ok(())
}
