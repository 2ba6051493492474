//! UDP decoding and port-based application dispatch.

use std::io;

use tracing::debug;

use crate::layers::{dns, ib, ntp, rpc, DecodeContext};
use crate::matcher::Value;
use crate::pkt::{AppLayer, DataLayer, Layer, Packet};
use crate::unpack::Unpacker;

const PORT_DNS: u16 = 53;
const PORT_KRB5: u16 = 88;
const PORT_NTP: u16 = 123;
/// RoCEv2: InfiniBand BTH directly over UDP.
const PORT_ROCE_V2: u16 = 4791;

/// UDP header.
#[derive(Debug, Clone)]
pub struct Udp {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl Udp {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "src_port" => Some(Value::Int(self.src_port as i64)),
            "dst_port" => Some(Value::Int(self.dst_port as i64)),
            "length" => Some(Value::Int(self.length as i64)),
            "checksum" => Some(Value::Int(self.checksum as i64)),
            _ => None,
        }
    }
}

pub fn decode(u: &mut Unpacker, pkt: &mut Packet, ctx: &mut DecodeContext<'_>) -> io::Result<()> {
    let src_port = u.unpack_u16()?;
    let dst_port = u.unpack_u16()?;
    let length = u.unpack_u16()?;
    let checksum = u.unpack_u16()?;
    pkt.push(Layer::Udp(Udp { src_port, dst_port, length, checksum }));
    u.truncate((length as usize).saturating_sub(8));

    let entry = u.tell();
    let port_match = |p: u16| src_port == p || dst_port == p;
    let result = if port_match(PORT_ROCE_V2) {
        ib::decode(u, pkt, ctx)
    } else if port_match(PORT_DNS) {
        dns::decode(u, pkt)
    } else if port_match(PORT_NTP) {
        ntp::decode(u, pkt)
    } else if port_match(PORT_KRB5) {
        // Kerberos is recognized but not decoded here
        let data = u.read_all();
        pkt.push(Layer::App(AppLayer {
            name: "krb".to_string(),
            fields: Value::from_entries([("len", Value::Int(data.len() as i64))]),
        }));
        pkt.push(Layer::Data(DataLayer { data }));
        Ok(())
    } else {
        // anything else might be RPC; the decoder's sanity checks reject
        // unrelated traffic
        rpc::decode(u, pkt, ctx)
    };

    if let Err(e) = result {
        debug!(src_port, dst_port, error = %e, "UDP payload kept raw");
        let _ = u.seek(io::SeekFrom::Start(entry as u64));
    }
    Ok(())
}
