//! Canonical byte codec.
//!
//! Every consensus hash is computed over this encoding, so the field order
//! and widths are part of the protocol: integers are big-endian and
//! fixed-width, variable byte strings carry a u32 length prefix, sequences a
//! u32 count prefix. Storage and the wire reuse the same bytes, which keeps
//! `hash(decode(encode(x))) == hash(x)` trivially true.

use primitive_types::U256;
use thiserror::Error;

/// Errors surfaced while decoding canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Input ended before the announced field width.
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEnd { offset: usize },

    /// A length prefix exceeds the remaining input.
    #[error("declared length {declared} exceeds remaining {remaining} bytes")]
    LengthOverflow { declared: usize, remaining: usize },

    /// An enum tag byte is outside the known range.
    #[error("invalid tag byte {tag} for {type_name}")]
    InvalidTag { tag: u8, type_name: &'static str },

    /// Input has bytes left over after a complete value was read.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}

/// Append-only writer producing canonical bytes.
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u256(&mut self, value: &U256) {
        let mut word = [0u8; 32];
        value.to_big_endian(&mut word);
        self.buf.extend_from_slice(&word);
    }

    /// Fixed-width field: no length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Variable-width field: u32 length prefix followed by the bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Cursor reader over canonical bytes.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEnd { offset: self.pos });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u256(&mut self) -> Result<U256, CodecError> {
        let word = self.take(32)?;
        Ok(U256::from_big_endian(word))
    }

    pub fn read_raw(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.take(n)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let declared = self.read_u32()? as usize;
        if declared > self.remaining() {
            return Err(CodecError::LengthOverflow {
                declared,
                remaining: self.remaining(),
            });
        }
        Ok(self.take(declared)?.to_vec())
    }
}

/// Types with a canonical byte form.
pub trait CanonicalEncode {
    fn encode(&self, writer: &mut ByteWriter);

    fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        self.encode(&mut writer);
        writer.finish()
    }
}

/// Types decodable from their canonical byte form.
pub trait CanonicalDecode: Sized {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError>;

    /// Decode a complete value, rejecting trailing garbage.
    fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let value = Self::decode(&mut reader)?;
        if reader.remaining() != 0 {
            return Err(CodecError::TrailingBytes(reader.remaining()));
        }
        Ok(value)
    }
}

/// Encode a sequence with its u32 count prefix.
pub fn encode_seq<T: CanonicalEncode>(items: &[T], writer: &mut ByteWriter) {
    writer.write_u32(items.len() as u32);
    for item in items {
        item.encode(writer);
    }
}

/// Decode a sequence written by [`encode_seq`].
pub fn decode_seq<T: CanonicalDecode>(reader: &mut ByteReader<'_>) -> Result<Vec<T>, CodecError> {
    let count = reader.read_u32()? as usize;
    // An element takes at least one byte; bound the preallocation by input.
    let mut items = Vec::with_capacity(count.min(reader.remaining()));
    for _ in 0..count {
        items.push(T::decode(reader)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_round_trip() {
        let mut writer = ByteWriter::new();
        writer.write_u8(7);
        writer.write_u32(0xDEAD_BEEF);
        writer.write_u64(u64::MAX);
        writer.write_u256(&U256::from(123_456_789u64));
        let bytes = writer.finish();

        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX);
        assert_eq!(reader.read_u256().unwrap(), U256::from(123_456_789u64));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn variable_bytes_round_trip() {
        let mut writer = ByteWriter::new();
        writer.write_bytes(b"payload");
        writer.write_bytes(b"");
        let bytes = writer.finish();

        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_bytes().unwrap(), b"payload");
        assert_eq!(reader.read_bytes().unwrap(), b"");
    }

    #[test]
    fn truncated_input_is_rejected() {
        let mut writer = ByteWriter::new();
        writer.write_u64(42);
        let mut bytes = writer.finish();
        bytes.truncate(3);

        let mut reader = ByteReader::new(&bytes);
        assert!(matches!(
            reader.read_u64(),
            Err(CodecError::UnexpectedEnd { .. })
        ));
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut writer = ByteWriter::new();
        writer.write_u32(1_000_000);
        writer.write_raw(b"abc");
        let bytes = writer.finish();

        let mut reader = ByteReader::new(&bytes);
        assert!(matches!(
            reader.read_bytes(),
            Err(CodecError::LengthOverflow { .. })
        ));
    }
}
