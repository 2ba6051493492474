//! Minimal NTP decoder: the 48-byte header of RFC 5905.

use std::io;

use crate::matcher::Value;
use crate::pkt::{Layer, Packet};
use crate::unpack::Unpacker;

#[derive(Debug, Clone)]
pub struct Ntp {
    pub leap: u8,
    pub version: u8,
    pub mode: u8,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: u32,
    pub root_dispersion: u32,
    pub reference_id: u32,
    pub reference_ts: u64,
    pub origin_ts: u64,
    pub receive_ts: u64,
    pub transmit_ts: u64,
}

impl Ntp {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "leap" => Some(Value::Int(self.leap as i64)),
            "version" => Some(Value::Int(self.version as i64)),
            "mode" => Some(Value::Int(self.mode as i64)),
            "stratum" => Some(Value::Int(self.stratum as i64)),
            "poll" => Some(Value::Int(self.poll as i64)),
            "precision" => Some(Value::Int(self.precision as i64)),
            "root_delay" => Some(Value::Int(self.root_delay as i64)),
            "root_dispersion" => Some(Value::Int(self.root_dispersion as i64)),
            "reference_id" => Some(Value::Int(self.reference_id as i64)),
            "reference_ts" => Some(Value::Int(self.reference_ts as i64)),
            "origin_ts" => Some(Value::Int(self.origin_ts as i64)),
            "receive_ts" => Some(Value::Int(self.receive_ts as i64)),
            "transmit_ts" => Some(Value::Int(self.transmit_ts as i64)),
            _ => None,
        }
    }
}

pub fn decode(u: &mut Unpacker, pkt: &mut Packet) -> io::Result<()> {
    let li_vn_mode = u.unpack_u8()?;
    let stratum = u.unpack_u8()?;
    let poll = u.unpack_u8()? as i8;
    let precision = u.unpack_u8()? as i8;
    let root_delay = u.unpack_u32()?;
    let root_dispersion = u.unpack_u32()?;
    let reference_id = u.unpack_u32()?;
    let reference_ts = u.unpack_u64()?;
    let origin_ts = u.unpack_u64()?;
    let receive_ts = u.unpack_u64()?;
    let transmit_ts = u.unpack_u64()?;
    pkt.push(Layer::Ntp(Ntp {
        leap: li_vn_mode >> 6,
        version: (li_vn_mode >> 3) & 0x7,
        mode: li_vn_mode & 0x7,
        stratum,
        poll,
        precision,
        root_delay,
        root_dispersion,
        reference_id,
        reference_ts,
        origin_ts,
        receive_ts,
        transmit_ts,
    }));
    Ok(())
}
