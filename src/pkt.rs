//! The decoded packet object.
//!
//! A [`Packet`] owns the frame record plus the stack of decoded layers in
//! the order the decoders attached them. Layer membership is keyed by
//! [`LayerKind`] through a bitmask so "has layer X" is constant time; a
//! layer kind appears at most once per packet, except VLAN where stacked
//! tags get ordinal handles and `vlan` aliases the innermost tag.
//!
//! Application layers produced by pluggable program decoders carry their
//! own name (`nfs`, `portmap`, ...) and are matched by that name.

use smallvec::SmallVec;
use tracing::warn;

use crate::layers::ddp::Ddp;
use crate::layers::dns::Dns;
use crate::layers::ib::Ib;
use crate::layers::ip::{Arp, Ipv4, Ipv6};
use crate::layers::link::{Erf, Ethernet, Sll, Sll2, Vlan};
use crate::layers::mpa::Mpa;
use crate::layers::ntp::Ntp;
use crate::layers::rdmap::Rdmap;
use crate::layers::rpc::Rpc;
use crate::layers::rpcordma::RpcOrdma;
use crate::layers::tcp::Tcp;
use crate::layers::udp::Udp;
use crate::matcher::Value;

/// Immutable description of one pcap record.
///
/// `frame` is the 1-based pcap record ordinal, cumulative across a
/// multi-file trace. `index_in_file` is the 0-based record position in
/// its own file.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub frame: u64,
    pub index_in_file: u64,
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub captured_len: u32,
    pub original_len: u32,
    pub link_type: u32,
}

impl Record {
    /// Timestamp as fractional seconds.
    pub fn secs(&self) -> f64 {
        self.ts_sec as f64 + self.ts_usec as f64 / 1_000_000.0
    }
}

/// Identifies a layer slot within a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LayerKind {
    Ethernet,
    Sll,
    Sll2,
    Erf,
    Vlan,
    Arp,
    Ip,
    Tcp,
    Udp,
    Ib,
    Mpa,
    Ddp,
    Rdmap,
    RpcOrdma,
    Rpc,
    Dns,
    Ntp,
    App,
    Data,
}

impl LayerKind {
    /// Case-insensitive name lookup. Application layer names (for
    /// example `nfs`) are not fixed kinds and resolve to `App`.
    pub fn from_name(name: &str) -> Option<LayerKind> {
        let lower = name.to_ascii_lowercase();
        Some(match lower.as_str() {
            "ethernet" => LayerKind::Ethernet,
            "sll" => LayerKind::Sll,
            "sll2" => LayerKind::Sll2,
            "erf" => LayerKind::Erf,
            "vlan" => LayerKind::Vlan,
            "arp" => LayerKind::Arp,
            "ip" => LayerKind::Ip,
            "tcp" => LayerKind::Tcp,
            "udp" => LayerKind::Udp,
            "ib" => LayerKind::Ib,
            "mpa" => LayerKind::Mpa,
            "ddp" => LayerKind::Ddp,
            "rdmap" => LayerKind::Rdmap,
            "rpcordma" => LayerKind::RpcOrdma,
            "rpc" => LayerKind::Rpc,
            "dns" => LayerKind::Dns,
            "ntp" => LayerKind::Ntp,
            "data" => LayerKind::Data,
            _ => return None,
        })
    }
}

/// Raw payload no decoder claimed.
#[derive(Debug, Clone)]
pub struct DataLayer {
    pub data: Vec<u8>,
}

impl DataLayer {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "len" => Some(Value::Int(self.data.len() as i64)),
            "data" => Some(Value::Bytes(self.data.clone())),
            _ => None,
        }
    }
}

/// Application layer decoded by a pluggable program decoder.
#[derive(Debug, Clone)]
pub struct AppLayer {
    /// Lower-case layer name the matcher resolves against (`nfs`, ...).
    pub name: String,
    /// Decoded fields as a matcher value, normally a map.
    pub fields: Value,
}

impl AppLayer {
    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields.get(name).cloned()
    }
}

/// One decoded protocol layer.
#[derive(Debug, Clone)]
pub enum Layer {
    Ethernet(Ethernet),
    Sll(Sll),
    Sll2(Sll2),
    Erf(Erf),
    Vlan(Vlan),
    Arp(Arp),
    Ipv4(Ipv4),
    Ipv6(Ipv6),
    Tcp(Tcp),
    Udp(Udp),
    Ib(Ib),
    Mpa(Mpa),
    Ddp(Ddp),
    Rdmap(Rdmap),
    RpcOrdma(RpcOrdma),
    Rpc(Rpc),
    Dns(Dns),
    Ntp(Ntp),
    App(AppLayer),
    Data(DataLayer),
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Ethernet(_) => LayerKind::Ethernet,
            Layer::Sll(_) => LayerKind::Sll,
            Layer::Sll2(_) => LayerKind::Sll2,
            Layer::Erf(_) => LayerKind::Erf,
            Layer::Vlan(_) => LayerKind::Vlan,
            Layer::Arp(_) => LayerKind::Arp,
            Layer::Ipv4(_) | Layer::Ipv6(_) => LayerKind::Ip,
            Layer::Tcp(_) => LayerKind::Tcp,
            Layer::Udp(_) => LayerKind::Udp,
            Layer::Ib(_) => LayerKind::Ib,
            Layer::Mpa(_) => LayerKind::Mpa,
            Layer::Ddp(_) => LayerKind::Ddp,
            Layer::Rdmap(_) => LayerKind::Rdmap,
            Layer::RpcOrdma(_) => LayerKind::RpcOrdma,
            Layer::Rpc(_) => LayerKind::Rpc,
            Layer::Dns(_) => LayerKind::Dns,
            Layer::Ntp(_) => LayerKind::Ntp,
            Layer::App(_) => LayerKind::App,
            Layer::Data(_) => LayerKind::Data,
        }
    }

    /// Field access for the matcher.
    pub fn field(&self, name: &str) -> Option<Value> {
        match self {
            Layer::Ethernet(l) => l.field(name),
            Layer::Sll(l) => l.field(name),
            Layer::Sll2(l) => l.field(name),
            Layer::Erf(l) => l.field(name),
            Layer::Vlan(l) => l.field(name),
            Layer::Arp(l) => l.field(name),
            Layer::Ipv4(l) => l.field(name),
            Layer::Ipv6(l) => l.field(name),
            Layer::Tcp(l) => l.field(name),
            Layer::Udp(l) => l.field(name),
            Layer::Ib(l) => l.field(name),
            Layer::Mpa(l) => l.field(name),
            Layer::Ddp(l) => l.field(name),
            Layer::Rdmap(l) => l.field(name),
            Layer::RpcOrdma(l) => l.field(name),
            Layer::Rpc(l) => l.field(name),
            Layer::Dns(l) => l.field(name),
            Layer::Ntp(l) => l.field(name),
            Layer::App(l) => l.field(name),
            Layer::Data(l) => l.field(name),
        }
    }
}

/// Record plus decoded layer stack.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    /// Cumulative packet index, 0-based. Distinct from `record.frame`
    /// because one TCP record can carve several RPC messages.
    pub index: u64,
    pub record: Record,
    layers: SmallVec<[Layer; 8]>,
    kind_mask: u32,
}

impl Packet {
    pub fn new(record: Record) -> Self {
        Self { index: 0, record, layers: SmallVec::new(), kind_mask: 0 }
    }

    /// Attaches a layer. A second layer of the same kind is illegal and
    /// dropped with a warning, except for stacked VLAN tags.
    pub(crate) fn push(&mut self, layer: Layer) {
        let kind = layer.kind();
        let bit = 1u32 << kind as u32;
        if self.kind_mask & bit != 0 && kind != LayerKind::Vlan && kind != LayerKind::App {
            warn!(frame = self.record.frame, ?kind, "duplicate layer dropped");
            return;
        }
        self.kind_mask |= bit;
        self.layers.push(layer);
    }

    /// Constant-time membership test by kind.
    pub fn has(&self, kind: LayerKind) -> bool {
        self.kind_mask & (1u32 << kind as u32) != 0
    }

    /// Membership by case-insensitive layer name, including `record`,
    /// ordinal VLAN handles and application layer names.
    pub fn has_name(&self, name: &str) -> bool {
        self.layer_value_root(name).is_some() || name.eq_ignore_ascii_case("record")
    }

    /// First layer of the given kind.
    pub fn get(&self, kind: LayerKind) -> Option<&Layer> {
        if !self.has(kind) {
            return None;
        }
        self.layers.iter().find(|l| l.kind() == kind)
    }

    pub fn ethernet(&self) -> Option<&Ethernet> {
        match self.get(LayerKind::Ethernet) {
            Some(Layer::Ethernet(l)) => Some(l),
            _ => None,
        }
    }

    pub fn tcp(&self) -> Option<&Tcp> {
        match self.get(LayerKind::Tcp) {
            Some(Layer::Tcp(l)) => Some(l),
            _ => None,
        }
    }

    pub fn udp(&self) -> Option<&Udp> {
        match self.get(LayerKind::Udp) {
            Some(Layer::Udp(l)) => Some(l),
            _ => None,
        }
    }

    pub fn rpc(&self) -> Option<&Rpc> {
        match self.get(LayerKind::Rpc) {
            Some(Layer::Rpc(l)) => Some(l),
            _ => None,
        }
    }

    pub fn rpcordma(&self) -> Option<&RpcOrdma> {
        match self.get(LayerKind::RpcOrdma) {
            Some(Layer::RpcOrdma(l)) => Some(l),
            _ => None,
        }
    }

    /// Application layer by its registered name.
    pub fn app(&self, name: &str) -> Option<&AppLayer> {
        self.layers.iter().find_map(|l| match l {
            Layer::App(a) if a.name.eq_ignore_ascii_case(name) => Some(a),
            _ => None,
        })
    }

    /// `n`-th VLAN tag, 1-based, outermost first.
    pub fn vlan(&self, n: usize) -> Option<&Vlan> {
        self.layers
            .iter()
            .filter_map(|l| match l {
                Layer::Vlan(v) => Some(v),
                _ => None,
            })
            .nth(n.checked_sub(1)?)
    }

    /// Innermost VLAN tag, the `vlan` alias.
    pub fn vlan_inner(&self) -> Option<&Vlan> {
        self.layers
            .iter()
            .rev()
            .find_map(|l| match l {
                Layer::Vlan(v) => Some(v),
                _ => None,
            })
    }

    /// Layers in the order the decoders attached them.
    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    /// Resolves a layer name for the matcher: fixed kinds, `vlanN`
    /// ordinals, or an application layer name.
    fn layer_value_root(&self, name: &str) -> Option<&Layer> {
        let lower = name.to_ascii_lowercase();
        if lower == "vlan" {
            return self
                .layers
                .iter()
                .rev()
                .find(|l| matches!(l, Layer::Vlan(_)));
        }
        if let Some(ordinal) = lower.strip_prefix("vlan").and_then(|s| s.parse::<usize>().ok()) {
            let mut seen = 0usize;
            return self.layers.iter().find(|l| {
                if matches!(l, Layer::Vlan(_)) {
                    seen += 1;
                    seen == ordinal
                } else {
                    false
                }
            });
        }
        if let Some(kind) = LayerKind::from_name(&lower) {
            return self.get(kind);
        }
        self.layers.iter().find(|l| match l {
            Layer::App(a) => a.name.eq_ignore_ascii_case(&lower),
            _ => false,
        })
    }

    /// Field lookup by `(layer, field)` for the matcher. `record` fields
    /// resolve against the frame record.
    pub fn field(&self, layer: &str, field: &str) -> Option<Value> {
        if layer.eq_ignore_ascii_case("record") {
            return match field {
                "frame" => Some(Value::Int(self.record.frame as i64)),
                "index" => Some(Value::Int(self.index as i64)),
                "index_in_file" => Some(Value::Int(self.record.index_in_file as i64)),
                "ts_sec" => Some(Value::Int(self.record.ts_sec as i64)),
                "ts_usec" => Some(Value::Int(self.record.ts_usec as i64)),
                "secs" => Some(Value::Float(self.record.secs())),
                "captured_len" => Some(Value::Int(self.record.captured_len as i64)),
                "original_len" => Some(Value::Int(self.record.original_len as i64)),
                "link_type" => Some(Value::Int(self.record.link_type as i64)),
                _ => None,
            };
        }
        self.layer_value_root(layer)?.field(field)
    }
}
