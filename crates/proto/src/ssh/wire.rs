//! SSH wire data types (RFC 4251 Section 5).
//!
//! Readers never panic on truncated input: every accessor checks the
//! remaining length and reports a protocol error instead.

use bytes::BufMut;
use tether_platform::{TetherError, TetherResult};

/// Cursor over an SSH message payload.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Returns `true` when every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the unread tail without consuming it.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Reads `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> TetherResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(TetherError::Protocol(format!(
                "Truncated message: need {} bytes, have {}",
                len,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Reads a `byte`.
    pub fn read_u8(&mut self) -> TetherResult<u8> {
        Ok(self.read_raw(1)?[0])
    }

    /// Reads a `boolean`; any non-zero value is true.
    pub fn read_bool(&mut self) -> TetherResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a `uint32`.
    pub fn read_u32(&mut self) -> TetherResult<u32> {
        let b = self.read_raw(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a `string` as raw bytes.
    pub fn read_string(&mut self) -> TetherResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_raw(len)
    }

    /// Reads a `string` that must be valid UTF-8.
    pub fn read_utf8(&mut self) -> TetherResult<String> {
        let raw = self.read_string()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| TetherError::protocol("Invalid UTF-8 in string field"))
    }

    /// Reads a `name-list`.
    pub fn read_name_list(&mut self) -> TetherResult<Vec<String>> {
        let text = self.read_utf8()?;
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(text.split(',').map(str::to_string).collect())
    }

    /// Reads an `mpint` and returns its unsigned magnitude without leading zeros.
    ///
    /// Negative values are rejected; SSH never sends them in the fields we read.
    pub fn read_mpint(&mut self) -> TetherResult<&'a [u8]> {
        let raw = self.read_string()?;
        if let Some(first) = raw.first() {
            if first & 0x80 != 0 {
                return Err(TetherError::protocol("Negative mpint"));
            }
        }
        let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
        Ok(&raw[start..])
    }

    /// Fails unless the whole payload has been consumed.
    pub fn finish(&self) -> TetherResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(TetherError::Protocol(format!(
                "{} trailing bytes in message",
                self.remaining()
            )))
        }
    }
}

/// SSH data type encoders, available on every [`BufMut`].
pub trait WireWrite: BufMut {
    /// Writes a `boolean`.
    fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    /// Writes a `string`.
    fn put_string(&mut self, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        self.put_u32(data.len() as u32);
        self.put_slice(data);
    }

    /// Writes a `name-list`.
    fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) {
        let joined = names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.put_string(joined.as_bytes());
    }

    /// Writes an unsigned big-endian magnitude as an `mpint`.
    fn put_mpint(&mut self, magnitude: &[u8]) {
        let start = magnitude
            .iter()
            .position(|&b| b != 0)
            .unwrap_or(magnitude.len());
        let trimmed = &magnitude[start..];
        if trimmed.first().map_or(false, |b| b & 0x80 != 0) {
            self.put_u32(trimmed.len() as u32 + 1);
            self.put_u8(0);
        } else {
            self.put_u32(trimmed.len() as u32);
        }
        self.put_slice(trimmed);
    }
}

impl<B: BufMut + ?Sized> WireWrite for B {}

/// Encodes an unsigned magnitude as a standalone `mpint` (length prefix included).
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(magnitude.len() + 5);
    out.put_mpint(magnitude);
    out
}
