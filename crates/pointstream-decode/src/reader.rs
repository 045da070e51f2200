//! Little-endian cursor over a byte slice.

use crate::error::{DecodeError, DecodeResult};

/// Sequential little-endian reader.
///
/// Every read checks the remaining length and reports the caller-supplied
/// context on failure rather than panicking.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    /// Create a reader positioned at the start of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Current byte offset.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of bytes left to read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take<const N: usize>(&mut self, context: &'static str) -> DecodeResult<[u8; N]> {
        let end = self.offset + N;
        let Some(bytes) = self.data.get(self.offset..end) else {
            return Err(DecodeError::UnexpectedEof { context });
        };
        self.offset = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Read one byte.
    pub fn read_u8(&mut self, context: &'static str) -> DecodeResult<u8> {
        Ok(self.take::<1>(context)?[0])
    }

    /// Read a little-endian `u16`.
    pub fn read_u16(&mut self, context: &'static str) -> DecodeResult<u16> {
        Ok(u16::from_le_bytes(self.take(context)?))
    }

    /// Read a little-endian `u32`.
    pub fn read_u32(&mut self, context: &'static str) -> DecodeResult<u32> {
        Ok(u32::from_le_bytes(self.take(context)?))
    }

    /// Read a little-endian `f32`.
    pub fn read_f32(&mut self, context: &'static str) -> DecodeResult<f32> {
        Ok(f32::from_le_bytes(self.take(context)?))
    }

    /// Skip `count` bytes.
    pub fn skip(&mut self, count: usize, context: &'static str) -> DecodeResult<()> {
        if count > self.remaining() {
            return Err(DecodeError::UnexpectedEof { context });
        }
        self.offset += count;
        Ok(())
    }
}
