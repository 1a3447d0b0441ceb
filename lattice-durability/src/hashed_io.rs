//! Hashed framed I/O.
//!
//! [`HashedWriter`] wraps an append-only byte sink and maintains a 64-bit
//! rolling hash over all bytes ever written; [`HashedReader`] is its dual
//! over bytes consumed. Records end with the writer's current hash stored
//! literally, so a reader can verify every record against everything that
//! preceded it.
//!
//! The hash is FNV-1a (64-bit). Snapshot and WAL files carry digests
//! literally, so this function is fixed for the life of the on-disk format
//! and must never change.

use std::io::{Read, Write};

use crate::error::{DurabilityError, DurabilityResult};

/// FNV-1a 64-bit offset basis.
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime.
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Folds a byte slice into a rolling FNV-1a state.
#[inline]
fn fnv1a_fold(mut state: u64, bytes: &[u8]) -> u64 {
    for &byte in bytes {
        state ^= u64::from(byte);
        state = state.wrapping_mul(FNV_PRIME);
    }
    state
}

/// Append-only writer with a rolling hash over all bytes ever written.
#[derive(Debug)]
pub struct HashedWriter<W: Write> {
    inner: W,
    hash: u64,
    bytes_written: u64,
    closed: bool,
}

impl<W: Write> HashedWriter<W> {
    /// Creates a new hashed writer over a byte sink.
    #[must_use]
    pub const fn new(inner: W) -> Self {
        Self {
            inner,
            hash: FNV_OFFSET_BASIS,
            bytes_written: 0,
            closed: false,
        }
    }

    /// Returns the current digest over everything written so far.
    #[must_use]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    /// Returns the total number of bytes written.
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Writes raw bytes, updating the rolling hash.
    ///
    /// # Errors
    /// Returns an I/O error if the sink rejects the write.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> DurabilityResult<()> {
        assert!(!self.closed, "write after close");
        self.inner
            .write_all(bytes)
            .map_err(|e| DurabilityError::io("write", e))?;
        self.hash = fnv1a_fold(self.hash, bytes);
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Writes a single byte.
    ///
    /// # Errors
    /// Returns an I/O error if the sink rejects the write.
    pub fn write_u8(&mut self, value: u8) -> DurabilityResult<()> {
        self.write_bytes(&[value])
    }

    /// Writes a u64 in little-endian form.
    ///
    /// # Errors
    /// Returns an I/O error if the sink rejects the write.
    pub fn write_u64(&mut self, value: u64) -> DurabilityResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes an i64 in little-endian form.
    ///
    /// # Errors
    /// Returns an I/O error if the sink rejects the write.
    pub fn write_i64(&mut self, value: i64) -> DurabilityResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes an f64 in little-endian IEEE-754 form.
    ///
    /// # Errors
    /// Returns an I/O error if the sink rejects the write.
    pub fn write_f64(&mut self, value: f64) -> DurabilityResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Flushes buffered bytes to the sink.
    ///
    /// # Errors
    /// Returns an I/O error if the flush fails.
    pub fn flush(&mut self) -> DurabilityResult<()> {
        self.inner
            .flush()
            .map_err(|e| DurabilityError::io("flush", e))
    }

    /// Flushes and marks the writer closed. Idempotent.
    ///
    /// # Errors
    /// Returns an I/O error if the flush fails.
    pub fn close(&mut self) -> DurabilityResult<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        Ok(())
    }

    /// Returns a reference to the underlying sink.
    pub const fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Returns a mutable reference to the underlying sink.
    ///
    /// Bytes written through it bypass the hash; callers use this only for
    /// durability control (fsync), never for payload.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

/// Sequential reader maintaining the same rolling hash over bytes consumed.
#[derive(Debug)]
pub struct HashedReader<R: Read> {
    inner: R,
    hash: u64,
    bytes_read: u64,
}

impl<R: Read> HashedReader<R> {
    /// Creates a new hashed reader over a byte source.
    #[must_use]
    pub const fn new(inner: R) -> Self {
        Self {
            inner,
            hash: FNV_OFFSET_BASIS,
            bytes_read: 0,
        }
    }

    /// Returns the current digest over everything consumed so far.
    #[must_use]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    /// Returns the total number of bytes consumed.
    #[must_use]
    pub const fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Reads exactly `buf.len()` bytes, updating the rolling hash.
    ///
    /// # Errors
    /// Returns [`DurabilityError::Truncated`] on a short read.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> DurabilityResult<()> {
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                DurabilityError::Truncated { needed: buf.len() }
            } else {
                DurabilityError::io("read", e)
            }
        })?;
        self.hash = fnv1a_fold(self.hash, buf);
        self.bytes_read += buf.len() as u64;
        Ok(())
    }

    /// Reads a single byte.
    ///
    /// # Errors
    /// Returns [`DurabilityError::Truncated`] at end of stream.
    pub fn read_u8(&mut self) -> DurabilityResult<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf)?;
        Ok(buf[0])
    }

    /// Reads a little-endian u64.
    ///
    /// # Errors
    /// Returns [`DurabilityError::Truncated`] on a short read.
    pub fn read_u64(&mut self) -> DurabilityResult<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a little-endian i64.
    ///
    /// # Errors
    /// Returns [`DurabilityError::Truncated`] on a short read.
    pub fn read_i64(&mut self) -> DurabilityResult<i64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    /// Reads a little-endian IEEE-754 f64.
    ///
    /// # Errors
    /// Returns [`DurabilityError::Truncated`] on a short read.
    pub fn read_f64(&mut self) -> DurabilityResult<f64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }

    /// Returns true if the source has no more bytes.
    ///
    /// Peeks one byte ahead without folding it into the hash; an inner
    /// `BufRead` makes this cheap.
    pub fn at_eof(&mut self) -> bool
    where
        R: std::io::BufRead,
    {
        self.inner.fill_buf().map_or(true, <[u8]>::is_empty)
    }
}

/// Computes the format's rolling hash over a standalone byte slice.
///
/// Used by readers that must verify a file digest before sequential
/// decoding (snapshot trailers).
#[must_use]
pub fn digest(bytes: &[u8]) -> u64 {
    fnv1a_fold(FNV_OFFSET_BASIS, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_reader_hashes_agree() {
        let mut writer = HashedWriter::new(Vec::new());
        writer.write_u64(42).unwrap();
        writer.write_i64(-7).unwrap();
        writer.write_bytes(b"lattice").unwrap();
        let written_hash = writer.hash();

        let buf = writer.get_ref().clone();
        let mut reader = HashedReader::new(&buf[..]);
        assert_eq!(reader.read_u64().unwrap(), 42);
        assert_eq!(reader.read_i64().unwrap(), -7);
        let mut name = [0u8; 7];
        reader.read_bytes(&mut name).unwrap();
        assert_eq!(&name, b"lattice");

        assert_eq!(reader.hash(), written_hash);
    }

    #[test]
    fn test_hash_is_order_sensitive() {
        let mut a = HashedWriter::new(Vec::new());
        a.write_u8(1).unwrap();
        a.write_u8(2).unwrap();

        let mut b = HashedWriter::new(Vec::new());
        b.write_u8(2).unwrap();
        b.write_u8(1).unwrap();

        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_short_read_is_truncated() {
        let buf = [1u8, 2, 3];
        let mut reader = HashedReader::new(&buf[..]);

        let result = reader.read_u64();
        assert!(matches!(result, Err(DurabilityError::Truncated { .. })));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut writer = HashedWriter::new(Vec::new());
        writer.write_u8(1).unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
    }

    #[test]
    #[should_panic(expected = "write after close")]
    fn test_write_after_close_panics() {
        let mut writer = HashedWriter::new(Vec::new());
        writer.close().unwrap();
        let _ = writer.write_u8(1);
    }

    #[test]
    fn test_digest_matches_streaming() {
        let mut writer = HashedWriter::new(Vec::new());
        writer.write_bytes(b"some payload").unwrap();

        assert_eq!(digest(b"some payload"), writer.hash());
    }

    #[test]
    fn test_at_eof() {
        let buf = [9u8];
        let mut reader = HashedReader::new(std::io::BufReader::new(&buf[..]));
        assert!(!reader.at_eof());
        reader.read_u8().unwrap();
        assert!(reader.at_eof());
    }
}
