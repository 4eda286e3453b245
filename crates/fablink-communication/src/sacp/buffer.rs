//! Payload encoding helpers
//!
//! Integers are little-endian. Strings and byte blobs carry a `u16` length
//! prefix. Physical quantities travel as `i32` thousandths.

use bytes::{BufMut, BytesMut};
use fablink_core::ProtocolError;

/// Scale between physical units and their wire representation
pub const MILLI: f64 = 1000.0;

/// Convert a physical value to wire thousandths
pub fn to_milli(value: f64) -> i32 {
    (value * MILLI).round() as i32
}

/// Convert wire thousandths to a physical value
pub fn from_milli(value: i32) -> f64 {
    f64::from(value) / MILLI
}

/// Builds a request or response payload
#[derive(Debug, Default, Clone)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    /// Create an empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a byte
    pub fn u8(mut self, value: u8) -> Self {
        self.buf.put_u8(value);
        self
    }

    /// Append a boolean as one byte
    pub fn bool(self, value: bool) -> Self {
        self.u8(u8::from(value))
    }

    /// Append a `u16`
    pub fn u16(mut self, value: u16) -> Self {
        self.buf.put_u16_le(value);
        self
    }

    /// Append a `u32`
    pub fn u32(mut self, value: u32) -> Self {
        self.buf.put_u32_le(value);
        self
    }

    /// Append an `i32`
    pub fn i32(mut self, value: i32) -> Self {
        self.buf.put_i32_le(value);
        self
    }

    /// Append a physical value as thousandths
    pub fn milli(self, value: f64) -> Self {
        self.i32(to_milli(value))
    }

    /// Append a length-prefixed string, truncated to `u16::MAX` bytes
    pub fn string(self, value: &str) -> Self {
        let bytes = value.as_bytes();
        let end = floor_char_boundary(value, usize::from(u16::MAX).min(bytes.len()));
        self.bytes(&bytes[..end])
    }

    /// Append a length-prefixed byte blob, truncated to `u16::MAX` bytes
    pub fn bytes(mut self, value: &[u8]) -> Self {
        let len = value.len().min(usize::from(u16::MAX));
        self.buf.put_u16_le(len as u16);
        self.buf.put_slice(&value[..len]);
        self
    }

    /// Append raw bytes without a prefix
    pub fn raw(mut self, value: &[u8]) -> Self {
        self.buf.put_slice(value);
        self
    }

    /// Finish the payload
    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Reads a payload field by field
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    /// Read from the start of a payload
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Whether every byte was consumed
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, count: usize, what: &str) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < count {
            return Err(ProtocolError::MalformedPayload {
                reason: format!(
                    "{} needs {} bytes at offset {}, {} left",
                    what,
                    count,
                    self.pos,
                    self.remaining()
                ),
            });
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    /// Read a byte
    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1, "u8")?[0])
    }

    /// Read a boolean byte
    pub fn bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.u8()? != 0)
    }

    /// Read a `u16`
    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2, "u16")?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a `u32`
    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read an `i32`
    pub fn i32(&mut self) -> Result<i32, ProtocolError> {
        let b = self.take(4, "i32")?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read thousandths as a physical value
    pub fn milli(&mut self) -> Result<f64, ProtocolError> {
        Ok(from_milli(self.i32()?))
    }

    /// Read a length-prefixed byte blob
    pub fn bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = usize::from(self.u16()?);
        self.take(len, "blob")
    }

    /// Read a length-prefixed UTF-8 string; invalid sequences are replaced
    pub fn string(&mut self) -> Result<String, ProtocolError> {
        Ok(String::from_utf8_lossy(self.bytes()?).into_owned())
    }

    /// Everything not yet read
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_layout() {
        let payload = PayloadWriter::new()
            .u8(1)
            .u16(0x0203)
            .i32(-2)
            .string("G28")
            .finish();
        assert_eq!(
            payload,
            vec![1, 0x03, 0x02, 0xFE, 0xFF, 0xFF, 0xFF, 3, 0, b'G', b'2', b'8']
        );
    }

    #[test]
    fn test_reader_walks_fields() {
        let payload = PayloadWriter::new()
            .u8(7)
            .u32(123_456)
            .milli(-12.5)
            .string("Snapmaker")
            .bool(true)
            .finish();
        let mut reader = PayloadReader::new(&payload);
        assert_eq!(reader.u8().unwrap(), 7);
        assert_eq!(reader.u32().unwrap(), 123_456);
        assert_eq!(reader.milli().unwrap(), -12.5);
        assert_eq!(reader.string().unwrap(), "Snapmaker");
        assert!(reader.bool().unwrap());
        assert!(reader.is_empty());
    }

    #[test]
    fn test_reader_reports_short_payload() {
        let mut reader = PayloadReader::new(&[5, 0, b'a']);
        let err = reader.string().unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPayload { .. }));
    }

    #[test]
    fn test_milli_rounding() {
        assert_eq!(to_milli(0.1234), 123);
        assert_eq!(to_milli(210.0), 210_000);
        assert_eq!(from_milli(-1500), -1.5);
    }

    #[test]
    fn test_string_truncation_respects_char_boundaries() {
        let long = "é".repeat(40_000);
        let payload = PayloadWriter::new().string(&long).finish();
        let len = usize::from(u16::from_le_bytes([payload[0], payload[1]]));
        assert_eq!(len % 2, 0);
        assert!(len <= usize::from(u16::MAX));
        let mut reader = PayloadReader::new(&payload);
        assert!(reader.string().unwrap().chars().all(|c| c == 'é'));
    }
}
