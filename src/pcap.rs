//! Libpcap capture file reader.
//!
//! Opens one capture file (plain or gzip-compressed), detects the header
//! endianness from the magic number and yields raw record frames. In
//! live-tail mode a short read probes for a rotated successor file
//! (`basename.N+1`) and otherwise waits for the file to grow.
//!
//! Only the classic libpcap format is handled here; pcap-ng is not.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::read::GzDecoder;
use tracing::{debug, info, warn};

/// Pcap magic in file order for a big-endian writer.
const MAGIC_BE: u32 = 0xA1B2_C3D4;
/// Pcap magic in file order for a little-endian writer.
const MAGIC_LE: u32 = 0xD4C3_B2A1;
/// First two bytes of a gzip stream.
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Global pcap header length.
const GLOBAL_HEADER_LEN: usize = 24;
/// Per-record header length.
const RECORD_HEADER_LEN: usize = 16;

/// Upper bound on a single captured frame. Anything larger is treated as
/// stream corruption rather than a frame.
const MAX_CAPTURED_LEN: u32 = 1 << 26;

/// Poll interval while waiting for a live capture file to grow.
const LIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One pcap record as stored in the file.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub captured_len: u32,
    pub original_len: u32,
    pub data: Vec<u8>,
}

enum Input {
    Plain(BufReader<File>),
    Gzip(Box<GzDecoder<BufReader<File>>>),
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Input::Plain(r) => r.read(buf),
            Input::Gzip(r) => r.read(buf),
        }
    }
}

/// Reader over a single capture file.
pub struct PcapReader {
    path: PathBuf,
    input: Input,
    big_endian: bool,
    version: (u16, u16),
    snaplen: u32,
    link_type: u32,
    file_size: u64,
    consumed: u64,
    records_read: u64,
    /// Partially read record bytes kept across live-mode retries.
    carry: Vec<u8>,
    live: bool,
    live_timeout: Duration,
}

fn open_input(path: &Path) -> anyhow::Result<(Input, u64)> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let file_size = file.metadata()?.len();
    if file_size == 0 {
        bail!("{}: empty capture file", path.display());
    }
    let mut reader = BufReader::with_capacity(64 * 1024, file);
    let mut probe = [0u8; 2];
    reader.read_exact(&mut probe).with_context(|| format!("{}: empty capture file", path.display()))?;
    if probe == GZIP_MAGIC {
        // restart the stream through a gzip decoder
        let file = File::open(path)?;
        let reader = BufReader::with_capacity(64 * 1024, file);
        return Ok((Input::Gzip(Box::new(GzDecoder::new(reader))), file_size));
    }
    // restart so the global header parse sees the magic again
    let file = File::open(path)?;
    let reader = BufReader::with_capacity(64 * 1024, file);
    Ok((Input::Plain(reader), file_size))
}

impl PcapReader {
    /// Opens a capture file and consumes its global header.
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (mut input, file_size) = open_input(&path)?;

        let mut header = [0u8; GLOBAL_HEADER_LEN];
        input
            .read_exact(&mut header)
            .with_context(|| format!("{}: truncated pcap global header", path.display()))?;

        let magic = BigEndian::read_u32(&header[0..4]);
        let big_endian = match magic {
            MAGIC_BE => true,
            MAGIC_LE => false,
            other => bail!("{}: unrecognized pcap magic {:#010x}", path.display(), other),
        };
        let (version, snaplen, link_type) = if big_endian {
            (
                (BigEndian::read_u16(&header[4..6]), BigEndian::read_u16(&header[6..8])),
                BigEndian::read_u32(&header[16..20]),
                BigEndian::read_u32(&header[20..24]),
            )
        } else {
            (
                (LittleEndian::read_u16(&header[4..6]), LittleEndian::read_u16(&header[6..8])),
                LittleEndian::read_u32(&header[16..20]),
                LittleEndian::read_u32(&header[20..24]),
            )
        };
        debug!(
            path = %path.display(),
            big_endian,
            link_type,
            snaplen,
            "opened capture v{}.{}",
            version.0,
            version.1
        );

        Ok(Self {
            path,
            input,
            big_endian,
            version,
            snaplen,
            link_type,
            file_size,
            consumed: GLOBAL_HEADER_LEN as u64,
            records_read: 0,
            carry: Vec::new(),
            live: false,
            live_timeout: Duration::from_secs(2),
        })
    }

    /// Enables live-tail mode: short reads wait for more data or roll
    /// over to the next capture file in the rotation.
    pub fn set_live(&mut self, live: bool, timeout: Duration) {
        self.live = live;
        self.live_timeout = timeout;
    }

    pub fn link_type(&self) -> u32 {
        self.link_type
    }

    pub fn snaplen(&self) -> u32 {
        self.snaplen
    }

    pub fn version(&self) -> (u16, u16) {
        self.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fraction of the file consumed so far. An estimate: for gzip input
    /// the numerator counts decompressed bytes, so the value is clamped.
    pub fn progress(&self) -> f64 {
        if self.file_size == 0 {
            return 1.0;
        }
        (self.consumed as f64 / self.file_size as f64).min(1.0)
    }

    fn read_u32_at(&self, buf: &[u8]) -> u32 {
        if self.big_endian {
            BigEndian::read_u32(buf)
        } else {
            LittleEndian::read_u32(buf)
        }
    }

    /// Tops `self.carry` up to `want` bytes. Returns false when the
    /// stream ended first; the partial bytes stay in `carry` so a live
    /// retry can continue where this read stopped.
    fn fill(&mut self, want: usize) -> io::Result<bool> {
        let mut chunk = [0u8; 8192];
        while self.carry.len() < want {
            let need = (want - self.carry.len()).min(chunk.len());
            let got = self.input.read(&mut chunk[..need])?;
            if got == 0 {
                return Ok(false);
            }
            self.carry.extend_from_slice(&chunk[..got]);
        }
        Ok(true)
    }

    /// Switches to a rotated successor file, if one exists.
    fn try_rollover(&mut self) -> anyhow::Result<bool> {
        let next = next_rollover_path(&self.path);
        if !next.exists() {
            return Ok(false);
        }
        if !self.carry.is_empty() {
            warn!(
                path = %self.path.display(),
                partial = self.carry.len(),
                "capture rotated mid-record, dropping partial record"
            );
            self.carry.clear();
        }
        info!(from = %self.path.display(), to = %next.display(), "live capture rollover");
        let mut replacement = PcapReader::open(&next)?;
        replacement.set_live(self.live, self.live_timeout);
        // cumulative frame accounting belongs to the caller; everything
        // else is per-file
        replacement.records_read = self.records_read;
        *self = replacement;
        Ok(true)
    }

    /// Reads the next record. `Ok(None)` is the clean end of the stream;
    /// a truncated record at EOF ends iteration without error.
    pub fn next_record(&mut self) -> anyhow::Result<Option<RawFrame>> {
        let deadline = Instant::now() + self.live_timeout;
        loop {
            let total_wanted = match self.pending_record_len() {
                Some(len) => RECORD_HEADER_LEN + len,
                None => RECORD_HEADER_LEN,
            };
            if !self.fill(total_wanted)? {
                // stream ended short of a full header or payload
                if self.live {
                    if self.try_rollover()? {
                        continue;
                    }
                    if Instant::now() < deadline {
                        std::thread::sleep(LIVE_POLL_INTERVAL);
                        continue;
                    }
                }
                if self.records_read == 0
                    && !self.carry.is_empty()
                    && self.carry.len() < RECORD_HEADER_LEN
                {
                    bail!(
                        "{}: unreadable record header at stream start",
                        self.path.display()
                    );
                }
                if !self.carry.is_empty() {
                    debug!(
                        path = %self.path.display(),
                        partial = self.carry.len(),
                        "truncated record at end of capture"
                    );
                }
                return Ok(None);
            }
            // with the header in hand the payload length is known; loop
            // once more if the payload is not buffered yet
            let captured_len = self.read_u32_at(&self.carry[8..12]);
            if captured_len > MAX_CAPTURED_LEN {
                warn!(
                    path = %self.path.display(),
                    captured_len,
                    "implausible record length, treating stream as corrupt"
                );
                return Ok(None);
            }
            if self.carry.len() < RECORD_HEADER_LEN + captured_len as usize {
                continue;
            }

            let ts_sec = self.read_u32_at(&self.carry[0..4]);
            let ts_usec = self.read_u32_at(&self.carry[4..8]);
            let original_len = self.read_u32_at(&self.carry[12..16]);
            let data =
                self.carry[RECORD_HEADER_LEN..RECORD_HEADER_LEN + captured_len as usize].to_vec();
            self.carry.drain(..RECORD_HEADER_LEN + captured_len as usize);
            self.consumed += (RECORD_HEADER_LEN + captured_len as usize) as u64;
            self.records_read += 1;
            return Ok(Some(RawFrame { ts_sec, ts_usec, captured_len, original_len, data }));
        }
    }

    /// Captured length of the record whose header is already in `carry`.
    fn pending_record_len(&self) -> Option<usize> {
        if self.carry.len() >= RECORD_HEADER_LEN {
            let len = self.read_u32_at(&self.carry[8..12]);
            if len <= MAX_CAPTURED_LEN {
                return Some(len as usize);
            }
        }
        None
    }

    /// Reopens the file at its first record.
    pub fn rewind(&mut self) -> anyhow::Result<()> {
        let mut fresh = PcapReader::open(&self.path)?;
        fresh.set_live(self.live, self.live_timeout);
        *self = fresh;
        Ok(())
    }
}

/// Rotation successor for a capture path: `trace.pcap` → `trace.pcap.1`,
/// `trace.pcap.3` → `trace.pcap.4`.
fn next_rollover_path(path: &Path) -> PathBuf {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if let Ok(n) = ext.parse::<u64>() {
            return path.with_extension((n + 1).to_string());
        }
    }
    let mut name = path.as_os_str().to_os_string();
    name.push(".1");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollover_naming() {
        assert_eq!(next_rollover_path(Path::new("a.pcap")), PathBuf::from("a.pcap.1"));
        assert_eq!(next_rollover_path(Path::new("a.pcap.1")), PathBuf::from("a.pcap.2"));
        assert_eq!(next_rollover_path(Path::new("a.pcap.9")), PathBuf::from("a.pcap.10"));
        assert_eq!(next_rollover_path(Path::new("nolayers")), PathBuf::from("nolayers.1"));
    }
}
