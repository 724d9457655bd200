//! Self-describing tag-struct payload codec.
//!
//! Every message payload is a flat sequence of `(tag, value)` pairs consumed
//! in write order. Readers fail cleanly on tag mismatch or truncation and
//! never hand back a partial value. Strings and byte arrays are u32
//! length-prefixed; all integers little-endian.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

pub const TAG_END: u8 = 0;
pub const TAG_BOOL: u8 = 1;
pub const TAG_U16: u8 = 2;
pub const TAG_U32: u8 = 3;
pub const TAG_U64: u8 = 4;
pub const TAG_I32: u8 = 5;
pub const TAG_STRING: u8 = 6;
pub const TAG_BYTES: u8 = 7;

#[derive(Debug, Eq, PartialEq)]
pub enum TagError {
    /// Stream ended inside a tag or value.
    Truncated,
    /// The next element does not have the requested type.
    Mismatch { expected: u8, found: u8 },
    /// String bytes are not valid UTF-8.
    BadString,
}

impl fmt::Display for TagError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TagError::Truncated => write!(f, "truncated tag stream"),
            TagError::Mismatch { expected, found } => {
                write!(f, "tag mismatch: expected {}, found {}", expected, found)
            }
            TagError::BadString => write!(f, "string is not valid utf-8"),
        }
    }
}

pub type TagResult<T> = Result<T, TagError>;

/// Appends typed values to a payload buffer.
pub struct TagWriter {
    buf: Vec<u8>,
}

impl TagWriter {
    pub fn new() -> TagWriter {
        TagWriter { buf: Vec::new() }
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.buf.push(TAG_BOOL);
        self.buf.push(value as u8);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.push(TAG_U16);
        let mut raw = [0u8; 2];
        LittleEndian::write_u16(&mut raw, value);
        self.buf.extend_from_slice(&raw);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.push(TAG_U32);
        let mut raw = [0u8; 4];
        LittleEndian::write_u32(&mut raw, value);
        self.buf.extend_from_slice(&raw);
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.push(TAG_U64);
        let mut raw = [0u8; 8];
        LittleEndian::write_u64(&mut raw, value);
        self.buf.extend_from_slice(&raw);
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.push(TAG_I32);
        let mut raw = [0u8; 4];
        LittleEndian::write_i32(&mut raw, value);
        self.buf.extend_from_slice(&raw);
        self
    }

    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.buf.push(TAG_STRING);
        let mut raw = [0u8; 4];
        LittleEndian::write_u32(&mut raw, value.len() as u32);
        self.buf.extend_from_slice(&raw);
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.push(TAG_BYTES);
        let mut raw = [0u8; 4];
        LittleEndian::write_u32(&mut raw, value.len() as u32);
        self.buf.extend_from_slice(&raw);
        self.buf.extend_from_slice(value);
        self
    }

    /// Finish the stream with the end-of-stream tag.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(TAG_END);
        self.buf
    }
}

/// Consumes typed values from a payload buffer in write order.
pub struct TagReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TagReader<'a> {
    pub fn new(data: &'a [u8]) -> TagReader<'a> {
        TagReader { data, pos: 0 }
    }

    /// True once the stream is exhausted or positioned at the end tag.
    pub fn at_end(&self) -> bool {
        match self.data.get(self.pos) {
            Some(&tag) => tag == TAG_END,
            None => true,
        }
    }

    fn expect_tag(&mut self, expected: u8) -> TagResult<()> {
        match self.data.get(self.pos) {
            Some(&found) if found == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(&found) => Err(TagError::Mismatch { expected, found }),
            None => Err(TagError::Truncated),
        }
    }

    fn raw(&mut self, len: usize) -> TagResult<&'a [u8]> {
        if self.data.len() - self.pos < len {
            return Err(TagError::Truncated);
        }

        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn get_bool(&mut self) -> TagResult<bool> {
        self.expect_tag(TAG_BOOL)?;
        Ok(self.raw(1)?[0] != 0)
    }

    pub fn get_u16(&mut self) -> TagResult<u16> {
        self.expect_tag(TAG_U16)?;
        Ok(LittleEndian::read_u16(self.raw(2)?))
    }

    pub fn get_u32(&mut self) -> TagResult<u32> {
        self.expect_tag(TAG_U32)?;
        Ok(LittleEndian::read_u32(self.raw(4)?))
    }

    pub fn get_u64(&mut self) -> TagResult<u64> {
        self.expect_tag(TAG_U64)?;
        Ok(LittleEndian::read_u64(self.raw(8)?))
    }

    pub fn get_i32(&mut self) -> TagResult<i32> {
        self.expect_tag(TAG_I32)?;
        Ok(LittleEndian::read_i32(self.raw(4)?))
    }

    pub fn get_string(&mut self) -> TagResult<String> {
        self.expect_tag(TAG_STRING)?;
        let len = LittleEndian::read_u32(self.raw(4)?) as usize;
        let raw = self.raw(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| TagError::BadString)
    }

    pub fn get_bytes(&mut self) -> TagResult<Vec<u8>> {
        self.expect_tag(TAG_BYTES)?;
        let len = LittleEndian::read_u32(self.raw(4)?) as usize;
        Ok(self.raw(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_sequence_roundtrip() {
        let mut writer = TagWriter::new();
        writer
            .put_u32(7)
            .put_string("system.shutdown")
            .put_bool(true)
            .put_u16(0xBEEF)
            .put_u64(u64::max_value())
            .put_i32(-42)
            .put_bytes(&[0xDE, 0xAD]);
        let data = writer.finish();

        let mut reader = TagReader::new(&data);
        assert_eq!(reader.get_u32().unwrap(), 7);
        assert_eq!(reader.get_string().unwrap(), "system.shutdown");
        assert_eq!(reader.get_bool().unwrap(), true);
        assert_eq!(reader.get_u16().unwrap(), 0xBEEF);
        assert_eq!(reader.get_u64().unwrap(), u64::max_value());
        assert_eq!(reader.get_i32().unwrap(), -42);
        assert_eq!(reader.get_bytes().unwrap(), vec![0xDE, 0xAD]);
        assert!(reader.at_end());
    }

    #[test]
    fn test_type_mismatch() {
        let mut writer = TagWriter::new();
        writer.put_u32(1);
        let data = writer.finish();

        let mut reader = TagReader::new(&data);
        assert_eq!(
            reader.get_u16(),
            Err(TagError::Mismatch {
                expected: TAG_U16,
                found: TAG_U32
            })
        );
    }

    #[test]
    fn test_truncated_value_is_clean_failure() {
        let mut writer = TagWriter::new();
        writer.put_bytes(&[1, 2, 3, 4, 5]);
        let data = writer.finish();

        // Cut inside the byte payload.
        let mut reader = TagReader::new(&data[..6]);
        assert_eq!(reader.get_bytes(), Err(TagError::Truncated));
    }

    #[test]
    fn test_truncated_length_prefix() {
        let data = [TAG_STRING, 3, 0];
        let mut reader = TagReader::new(&data);
        assert_eq!(reader.get_string(), Err(TagError::Truncated));
    }

    #[test]
    fn test_read_past_end() {
        let data = TagWriter::new().finish();
        let mut reader = TagReader::new(&data);
        assert!(reader.at_end());
        assert!(reader.get_u32().is_err());
    }

    #[test]
    fn test_empty_string_and_bytes() {
        let mut writer = TagWriter::new();
        writer.put_string("").put_bytes(&[]);
        let data = writer.finish();

        let mut reader = TagReader::new(&data);
        assert_eq!(reader.get_string().unwrap(), "");
        assert_eq!(reader.get_bytes().unwrap(), Vec::<u8>::new());
        assert!(reader.at_end());
    }
}
