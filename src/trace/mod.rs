//! The packet trace: multi-file driver and engine API.
//!
//! A [`PacketTrace`] merges an ordered list of capture files (advancing
//! whichever file has the earliest frame at its head), runs every frame
//! through the decoder pipeline against one shared reassembly state,
//! and stamps cumulative `index`/`frame` counters on the packets it
//! yields. On top of iteration it provides the expression matcher,
//! rewind-with-replay, a buffered packet-list mode and the accessor for
//! RDMA write chunk data.

pub mod state;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{debug, info};

use crate::layers::rpc::{ProgramDecoder, ProgramRegistry};
use crate::layers::{self, DecodeContext};
use crate::matcher::{self, MatcherConfig};
use crate::pcap::{PcapReader, RawFrame};
use crate::pkt::{Packet, Record};
use state::ReassemblyState;

/// Trace-wide configuration, carried explicitly on the handle.
#[derive(Debug, Clone)]
pub struct TraceOptions {
    /// Follow a growing capture, rolling over to `basename.N+1`.
    pub live: bool,
    /// How long a live read waits for new data before giving up.
    pub live_timeout: Duration,
    /// Track calls in the XID map so `reply` matching works.
    pub rpc_replies: bool,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self { live: false, live_timeout: Duration::from_secs(2), rpc_replies: true }
    }
}

/// Options for one `match` invocation.
#[derive(Debug, Clone)]
pub struct MatchOpts {
    /// Stop searching once the cursor reaches this index.
    pub maxindex: Option<u64>,
    /// Restore the position the search started at when nothing matches.
    pub rewind: bool,
    /// Also yield any RPC reply whose XID matches a previously matched
    /// call.
    pub reply: bool,
}

impl Default for MatchOpts {
    fn default() -> Self {
        Self { maxindex: None, rewind: true, reply: false }
    }
}

struct ReaderSlot {
    reader: PcapReader,
    head: Option<RawFrame>,
    done: bool,
    records_read: u64,
}

/// One analysis pipeline over one or more capture files.
pub struct PacketTrace {
    slots: Vec<ReaderSlot>,
    options: TraceOptions,
    programs: ProgramRegistry,
    matcher_config: MatcherConfig,
    state: ReassemblyState,
    next_index: u64,
    frames_consumed: u64,
    pktlist: Option<Vec<Packet>>,
    pktlist_cursor: usize,
    /// XIDs of matched calls awaiting their reply.
    awaiting: HashSet<u32>,
}

impl PacketTrace {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_many(&[path], TraceOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, options: TraceOptions) -> Result<Self> {
        Self::open_many(&[path], options)
    }

    /// Opens an ordered list of capture files as one logical trace.
    pub fn open_many<P: AsRef<Path>>(paths: &[P], options: TraceOptions) -> Result<Self> {
        if paths.is_empty() {
            bail!("no capture files given");
        }
        let mut slots = Vec::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            let mut reader = PcapReader::open(path)?;
            if options.live && i == paths.len() - 1 {
                reader.set_live(true, options.live_timeout);
            }
            slots.push(ReaderSlot { reader, head: None, done: false, records_read: 0 });
        }
        info!(files = slots.len(), "trace opened");
        Ok(Self {
            slots,
            options,
            programs: ProgramRegistry::default(),
            matcher_config: MatcherConfig::default(),
            state: ReassemblyState::default(),
            next_index: 0,
            frames_consumed: 0,
            pktlist: None,
            pktlist_cursor: 0,
            awaiting: HashSet::new(),
        })
    }

    /// Registers an upper-layer program decoder (NFS, portmap, ...).
    pub fn register_program_decoder(&mut self, decoder: Arc<dyn ProgramDecoder>) {
        self.programs.register(decoder);
    }

    /// Defines a named constant usable in match expressions; this is how
    /// an operation-name map is plugged in.
    pub fn define_constant(&mut self, name: &str, value: i64) {
        self.matcher_config.constants.insert(name.to_string(), value);
    }

    /// Mean consumption fraction across the trace's files.
    pub fn progress(&self) -> f64 {
        if self.slots.is_empty() {
            return 1.0;
        }
        self.slots.iter().map(|s| s.reader.progress()).sum::<f64>() / self.slots.len() as f64
    }

    /// Index the next yielded packet will get; doubles as "how many
    /// packets have been delivered".
    pub fn index(&self) -> u64 {
        if self.pktlist.is_some() {
            self.pktlist_cursor as u64
        } else {
            self.next_index
        }
    }

    /// RDMA write chunk data of the most recent RPC-over-RDMA reply, as
    /// a list of chunks of segment byte strings, in the order declared
    /// by the call.
    pub fn rdma_write_chunks(&self) -> &[Vec<Vec<u8>>] {
        &self.state.rdma.write_chunks
    }

    /// Toggles buffered mode: with a list installed, iteration and
    /// matching run over it with a private cursor and the underlying
    /// readers are untouched.
    pub fn set_pktlist(&mut self, list: Option<Vec<Packet>>) {
        self.pktlist = list;
        self.pktlist_cursor = 0;
    }

    fn fill_heads(&mut self) -> Result<()> {
        for slot in &mut self.slots {
            if slot.head.is_none() && !slot.done {
                match slot.reader.next_record()? {
                    Some(frame) => slot.head = Some(frame),
                    None => {
                        slot.done = true;
                        if !self.state.is_empty() {
                            // streams straddling the boundary keep their
                            // state; the next file decodes against it
                            debug!(
                                path = %slot.reader.path().display(),
                                "file finished with reassembly state carried forward"
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Yields the next packet, or `None` at the end of the trace.
    pub fn next(&mut self) -> Result<Option<Packet>> {
        if let Some(list) = &self.pktlist {
            let Some(pkt) = list.get(self.pktlist_cursor) else { return Ok(None) };
            self.pktlist_cursor += 1;
            return Ok(Some(pkt.clone()));
        }

        if let Some(mut pkt) = self.state.pending_pkts.pop_front() {
            pkt.index = self.next_index;
            self.next_index += 1;
            return Ok(Some(pkt));
        }

        self.fill_heads()?;
        let best = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.head.as_ref().map(|h| (i, (h.ts_sec, h.ts_usec))))
            .min_by_key(|&(_, ts)| ts)
            .map(|(i, _)| i);
        let Some(i) = best else { return Ok(None) };
        let slot = &mut self.slots[i];
        let Some(frame) = slot.head.take() else { return Ok(None) };

        let record = Record {
            frame: self.frames_consumed + 1,
            index_in_file: slot.records_read,
            ts_sec: frame.ts_sec,
            ts_usec: frame.ts_usec,
            captured_len: frame.captured_len,
            original_len: frame.original_len,
            link_type: slot.reader.link_type(),
        };
        self.frames_consumed += 1;
        slot.records_read += 1;

        let index = self.next_index;
        let mut ctx = DecodeContext { state: &mut self.state, programs: &self.programs };
        let pkt = layers::decode_frame(record, index, frame.data, &mut ctx);
        self.next_index += 1;
        Ok(Some(pkt))
    }

    /// Resets to packet `index`, replaying decode state from the start
    /// of the trace when the target precedes the current position.
    pub fn rewind(&mut self, index: u64) -> Result<()> {
        if self.pktlist.is_some() {
            self.pktlist_cursor = index as usize;
            return Ok(());
        }
        debug!(index, "rewinding trace");
        for slot in &mut self.slots {
            slot.reader.rewind()?;
            slot.head = None;
            slot.done = false;
            slot.records_read = 0;
        }
        // correctness over speed: reassembly state is rebuilt, never
        // partially undone
        self.state = ReassemblyState::default();
        self.next_index = 0;
        self.frames_consumed = 0;
        while self.next_index < index {
            if self.next()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    /// Returns the next packet satisfying `expr`, with default options.
    pub fn match_next(&mut self, expr: &str) -> Result<Option<Packet>> {
        self.match_with(expr, MatchOpts::default())
    }

    /// Returns the next packet satisfying `expr`. On no-match the
    /// position is restored (unless `opts.rewind` is off) so callers can
    /// probe without losing their place. With `opts.reply`, any RPC
    /// reply pairing a previously matched call is returned as well.
    pub fn match_with(&mut self, expr: &str, opts: MatchOpts) -> Result<Option<Packet>> {
        let compiled = matcher::compile(expr, &self.matcher_config)?;
        let start = self.index();
        loop {
            if let Some(max) = opts.maxindex {
                if self.index() >= max {
                    break;
                }
            }
            let Some(pkt) = self.next()? else { break };

            if opts.reply {
                if let Some(rpc) = pkt.rpc() {
                    if rpc.is_reply() && self.awaiting.remove(&rpc.xid) {
                        return Ok(Some(pkt));
                    }
                }
            }
            if compiled.matches(&pkt, &self.matcher_config) {
                if self.options.rpc_replies {
                    if let Some(rpc) = pkt.rpc() {
                        if rpc.is_call() {
                            self.awaiting.insert(rpc.xid);
                        }
                    }
                }
                return Ok(Some(pkt));
            }
        }
        if opts.rewind {
            self.rewind(start)?;
        }
        Ok(None)
    }

    /// Quote-safe literal escape for embedding opaque bytes in a match
    /// expression.
    pub fn escape(data: &[u8]) -> String {
        let mut out = String::with_capacity(data.len() + 2);
        out.push('\'');
        for &b in data {
            match b {
                b'\\' => out.push_str("\\\\"),
                b'\'' => out.push_str("\\'"),
                b'\n' => out.push_str("\\n"),
                b'\t' => out.push_str("\\t"),
                b'\r' => out.push_str("\\r"),
                0x20..=0x7E => out.push(b as char),
                _ => out.push_str(&format!("\\x{b:02x}")),
            }
        }
        out.push('\'');
        out
    }
}
