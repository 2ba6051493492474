//! NFS Trace - a packet-trace analysis engine for NFS traffic in Rust
//!
//! This library reads libpcap capture files containing NFS traffic over
//! TCP, UDP or RDMA, reconstructs each frame into a stack of decoded
//! protocol layers, reassembles messages that span multiple transport
//! segments, and exposes an expression matcher that locates packets by
//! predicate.
//!
//! ## Supported Features
//!
//! - Plain and gzip-compressed pcap files, either endianness
//! - Multi-file traces merged by timestamp, with reassembly state
//!   carried across file rotations, and live-tail following
//! - Link layers: Ethernet II, stacked VLANs, Linux cooked capture
//!   v1/v2, ERF (Ethernet and InfiniBand records)
//! - IPv4 with fragment reassembly, IPv6, ARP
//! - TCP stream reassembly carving RPC record-marked messages
//! - UDP application dispatch (DNS, NTP, Kerberos, RPC, RoCEv2)
//! - The full RDMA stack: InfiniBand BTH/RETH/AETH, iWARP MPA/DDP/RDMAP,
//!   RPC-over-RDMA chunk lists and message reconstruction
//! - An expression matcher with call/reply pairing and rewind semantics
//!
//! ## Main Components
//!
//! - `trace`: The [`trace::PacketTrace`] driver - open capture files,
//!   iterate packets, match predicates, rewind.
//!
//! - `pkt`: The decoded packet object, addressable by layer name.
//!
//! - `layers`: The decoder pipeline, including TCP stream and RDMA
//!   reassembly. Upper-layer XDR decoding (NFS itself) is pluggable
//!   through the [`layers::rpc::ProgramDecoder`] trait.
//!
//! - `matcher`: The predicate language - parsed to an AST and evaluated
//!   against each packet, never through a host-language eval.
//!
//! ## Standards Compliance
//!
//! This implementation follows these RFCs:
//! - RFC 5531: RPC: Remote Procedure Call Protocol Specification Version 2
//! - RFC 8166: Remote Direct Memory Access Transport for RPC (RPC-over-RDMA)
//! - RFC 5040/5041/5044: RDMAP, DDP and MPA (iWARP)
//! - RFC 791/2460/9293/768: IPv4, IPv6, TCP, UDP
//!
//! ## Usage
//!
//! Open a trace with [`trace::PacketTrace::open`], then either iterate
//! with `next()` or search with `match_with()`:
//!
//! ```ignore
//! let mut trace = PacketTrace::open("nfs.pcap")?;
//! while let Some(pkt) = trace.match_next("TCP.flags.SYN == 1")? {
//!     println!("connection setup at frame {}", pkt.record.frame);
//! }
//! ```

pub mod layers;
pub mod matcher;
pub mod pcap;
pub mod pkt;
pub mod trace;
pub mod unpack;

pub use matcher::Value;
pub use pkt::{Layer, LayerKind, Packet, Record};
pub use trace::{MatchOpts, PacketTrace, TraceOptions};
pub use unpack::Unpacker;
