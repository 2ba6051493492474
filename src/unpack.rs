//! Byte-buffer cursor used by every layer decoder.
//!
//! An [`Unpacker`] owns the bytes of the frame (or of a reassembled
//! message) and tracks a read offset. Decoders consume a prefix of the
//! buffer and hand the rest to a child decoder; a decoder that rejects
//! its input seeks back to its entry offset so the parent can treat the
//! payload as opaque.
//!
//! All multi-byte integer reads are network byte order, matching the
//! protocols this crate decodes.

use std::io::{self, SeekFrom};

use byteorder::{BigEndian, ByteOrder};

/// Cursor over an owned byte buffer.
#[derive(Debug, Clone, Default)]
pub struct Unpacker {
    data: Vec<u8>,
    offset: usize,
}

fn eof(wanted: usize, available: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("short read: wanted {wanted} bytes, {available} available"),
    )
}

impl Unpacker {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, offset: 0 }
    }

    /// Total number of bytes in the buffer, including consumed ones.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes left between the cursor and the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    /// Current cursor position.
    pub fn tell(&self) -> usize {
        self.offset
    }

    /// Reads `n` bytes and advances the cursor.
    pub fn read(&mut self, n: usize) -> io::Result<Vec<u8>> {
        if n > self.remaining() {
            return Err(eof(n, self.remaining()));
        }
        let out = self.data[self.offset..self.offset + n].to_vec();
        self.offset += n;
        Ok(out)
    }

    /// Reads the rest of the buffer.
    pub fn read_all(&mut self) -> Vec<u8> {
        let out = self.data[self.offset..].to_vec();
        self.offset = self.data.len();
        out
    }

    /// Returns the next `n` bytes without advancing the cursor.
    pub fn peek(&self, n: usize) -> io::Result<&[u8]> {
        if n > self.remaining() {
            return Err(eof(n, self.remaining()));
        }
        Ok(&self.data[self.offset..self.offset + n])
    }

    pub fn unpack_u8(&mut self) -> io::Result<u8> {
        if self.remaining() < 1 {
            return Err(eof(1, 0));
        }
        let v = self.data[self.offset];
        self.offset += 1;
        Ok(v)
    }

    pub fn unpack_u16(&mut self) -> io::Result<u16> {
        let b = self.peek(2)?;
        let v = BigEndian::read_u16(b);
        self.offset += 2;
        Ok(v)
    }

    /// 24-bit read, used for InfiniBand QPNs and PSNs.
    pub fn unpack_u24(&mut self) -> io::Result<u32> {
        let b = self.peek(3)?;
        let v = u32::from(b[0]) << 16 | u32::from(b[1]) << 8 | u32::from(b[2]);
        self.offset += 3;
        Ok(v)
    }

    pub fn unpack_u32(&mut self) -> io::Result<u32> {
        let b = self.peek(4)?;
        let v = BigEndian::read_u32(b);
        self.offset += 4;
        Ok(v)
    }

    pub fn unpack_u64(&mut self) -> io::Result<u64> {
        let b = self.peek(8)?;
        let v = BigEndian::read_u64(b);
        self.offset += 8;
        Ok(v)
    }

    /// Reads a fixed-size array, the XDR fixed-opaque shape.
    pub fn unpack_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let b = self.peek(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(b);
        self.offset += N;
        Ok(out)
    }

    /// Moves the cursor. `SeekFrom::End` offsets are relative to the end
    /// of the buffer; seeking outside the buffer is an error.
    pub fn seek(&mut self, pos: SeekFrom) -> io::Result<usize> {
        let target: i64 = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(d) => self.offset as i64 + d,
            SeekFrom::End(d) => self.data.len() as i64 + d,
        };
        if target < 0 || target as usize > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek to {target} outside buffer of {} bytes", self.data.len()),
            ));
        }
        self.offset = target as usize;
        Ok(self.offset)
    }

    /// Drops everything past `n` bytes from the cursor. Used to bound a
    /// child decoder to a declared payload length (for example IPv4
    /// total length against Ethernet trailer padding).
    pub fn truncate(&mut self, n: usize) {
        let end = self.offset.saturating_add(n);
        if end < self.data.len() {
            self.data.truncate(end);
        }
    }

    /// Splices `prefix` in at the cursor. The cursor is left at the
    /// start of the inserted bytes, so subsequent reads behave as if the
    /// bytes had always been present. RDMA reassembly uses this to put a
    /// reconstructed message in front of the RPC decoder.
    pub fn insert(&mut self, prefix: &[u8]) {
        self.data.splice(self.offset..self.offset, prefix.iter().copied());
    }
}
