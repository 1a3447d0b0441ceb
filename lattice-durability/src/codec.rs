//! Primitive codec over hashed streams.
//!
//! Values are self-describing: a one-byte tag, then the payload. A reader
//! can dispatch on the tag without knowing the expected type, which is what
//! lets a single decoder drive both WAL records and snapshot bodies.
//!
//! # Wire Forms
//!
//! | Tag  | Value    | Payload |
//! |------|----------|---------|
//! | 0x00 | Null     | — |
//! | 0x01 | Bool     | 1 byte (0 or 1) |
//! | 0x02 | Int      | i64 LE |
//! | 0x03 | Float    | f64 LE |
//! | 0x04 | String   | u32 LE length + UTF-8 bytes |
//! | 0x05 | List     | u32 LE count + tagged values |
//! | 0x06 | Map      | u32 LE count + (String, tagged value) pairs |

use std::collections::BTreeMap;
use std::io::{Read, Write};

use lattice_core::limits::PROPERTY_DEPTH_MAX;
use lattice_core::PropertyValue;

use crate::error::{DurabilityError, DurabilityResult};
use crate::hashed_io::{HashedReader, HashedWriter};
use crate::limits::{CONTAINER_LENGTH_MAX, STRING_LENGTH_BYTES_MAX};

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STRING: u8 = 0x04;
const TAG_LIST: u8 = 0x05;
const TAG_MAP: u8 = 0x06;

/// Typed value encoder over a hashed byte sink.
#[derive(Debug)]
pub struct Encoder<'a, W: Write> {
    writer: &'a mut HashedWriter<W>,
}

impl<'a, W: Write> Encoder<'a, W> {
    /// Creates an encoder borrowing the hashed writer.
    pub fn new(writer: &'a mut HashedWriter<W>) -> Self {
        Self { writer }
    }

    /// Writes a tagged integer.
    ///
    /// # Errors
    /// Returns an I/O error if the sink rejects the write.
    pub fn write_int(&mut self, value: i64) -> DurabilityResult<()> {
        self.writer.write_u8(TAG_INT)?;
        self.writer.write_i64(value)
    }

    /// Writes a tagged UTF-8 string.
    ///
    /// # Errors
    /// Returns an I/O error if the sink rejects the write.
    ///
    /// # Panics
    /// Panics if the string exceeds [`STRING_LENGTH_BYTES_MAX`].
    pub fn write_string(&mut self, value: &str) -> DurabilityResult<()> {
        assert!(
            value.len() <= STRING_LENGTH_BYTES_MAX as usize,
            "string exceeds encoding limit"
        );
        self.writer.write_u8(TAG_STRING)?;
        #[allow(clippy::cast_possible_truncation)] // Bounded by the assert above.
        self.writer.write_bytes(&(value.len() as u32).to_le_bytes())?;
        self.writer.write_bytes(value.as_bytes())
    }

    /// Writes a tagged list of integers.
    ///
    /// # Errors
    /// Returns an I/O error if the sink rejects the write.
    pub fn write_int_list(&mut self, values: &[i64]) -> DurabilityResult<()> {
        self.write_container_header(TAG_LIST, values.len())?;
        for &value in values {
            self.write_int(value)?;
        }
        Ok(())
    }

    /// Writes a tagged list of strings.
    ///
    /// # Errors
    /// Returns an I/O error if the sink rejects the write.
    pub fn write_string_list(&mut self, values: &[String]) -> DurabilityResult<()> {
        self.write_container_header(TAG_LIST, values.len())?;
        for value in values {
            self.write_string(value)?;
        }
        Ok(())
    }

    /// Writes a tagged property value, recursively.
    ///
    /// # Errors
    /// Returns an I/O error if the sink rejects the write.
    pub fn write_value(&mut self, value: &PropertyValue) -> DurabilityResult<()> {
        match value {
            PropertyValue::Null => self.writer.write_u8(TAG_NULL),
            PropertyValue::Bool(b) => {
                self.writer.write_u8(TAG_BOOL)?;
                self.writer.write_u8(u8::from(*b))
            }
            PropertyValue::Int(i) => self.write_int(*i),
            PropertyValue::Float(x) => {
                self.writer.write_u8(TAG_FLOAT)?;
                self.writer.write_f64(*x)
            }
            PropertyValue::String(s) => self.write_string(s),
            PropertyValue::List(items) => {
                self.write_container_header(TAG_LIST, items.len())?;
                for item in items {
                    self.write_value(item)?;
                }
                Ok(())
            }
            PropertyValue::Map(entries) => {
                self.write_container_header(TAG_MAP, entries.len())?;
                for (key, item) in entries {
                    self.write_string(key)?;
                    self.write_value(item)?;
                }
                Ok(())
            }
        }
    }

    fn write_container_header(&mut self, tag: u8, len: usize) -> DurabilityResult<()> {
        assert!(
            len <= CONTAINER_LENGTH_MAX as usize,
            "container exceeds encoding limit"
        );
        self.writer.write_u8(tag)?;
        #[allow(clippy::cast_possible_truncation)] // Bounded by the assert above.
        self.writer.write_bytes(&(len as u32).to_le_bytes())
    }
}

/// Typed value decoder over a hashed byte source.
#[derive(Debug)]
pub struct Decoder<'a, R: Read> {
    reader: &'a mut HashedReader<R>,
}

impl<'a, R: Read> Decoder<'a, R> {
    /// Creates a decoder borrowing the hashed reader.
    pub fn new(reader: &'a mut HashedReader<R>) -> Self {
        Self { reader }
    }

    /// Reads any tagged value.
    ///
    /// # Errors
    /// Returns `Truncated` on short read, `BadTag` on unknown discriminator.
    pub fn read_value(&mut self) -> DurabilityResult<PropertyValue> {
        self.read_value_at_depth(0)
    }

    /// Reads a value that must be an integer.
    ///
    /// # Errors
    /// Returns `BadTag` if the next value is not an integer.
    pub fn read_int(&mut self) -> DurabilityResult<i64> {
        let tag = self.reader.read_u8()?;
        if tag != TAG_INT {
            return Err(DurabilityError::BadTag {
                tag,
                context: "int",
            });
        }
        self.reader.read_i64()
    }

    /// Reads a value that must be a string.
    ///
    /// # Errors
    /// Returns `BadTag` if the next value is not a string.
    pub fn read_string(&mut self) -> DurabilityResult<String> {
        let tag = self.reader.read_u8()?;
        if tag != TAG_STRING {
            return Err(DurabilityError::BadTag {
                tag,
                context: "string",
            });
        }
        self.read_string_body()
    }

    /// Reads a value that must be a list of integers.
    ///
    /// # Errors
    /// Returns `BadTag` if the next value is not a list of integers.
    pub fn read_int_list(&mut self) -> DurabilityResult<Vec<i64>> {
        let len = self.read_container_header(TAG_LIST, "int list")?;
        let mut values = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            values.push(self.read_int()?);
        }
        Ok(values)
    }

    /// Reads a value that must be a list of strings.
    ///
    /// # Errors
    /// Returns `BadTag` if the next value is not a list of strings.
    pub fn read_string_list(&mut self) -> DurabilityResult<Vec<String>> {
        let len = self.read_container_header(TAG_LIST, "string list")?;
        let mut values = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            values.push(self.read_string()?);
        }
        Ok(values)
    }

    fn read_value_at_depth(&mut self, depth: usize) -> DurabilityResult<PropertyValue> {
        if depth > PROPERTY_DEPTH_MAX {
            return Err(DurabilityError::BadTag {
                tag: TAG_LIST,
                context: "value nested too deep",
            });
        }

        let tag = self.reader.read_u8()?;
        match tag {
            TAG_NULL => Ok(PropertyValue::Null),
            TAG_BOOL => match self.reader.read_u8()? {
                0 => Ok(PropertyValue::Bool(false)),
                1 => Ok(PropertyValue::Bool(true)),
                other => Err(DurabilityError::BadTag {
                    tag: other,
                    context: "bool",
                }),
            },
            TAG_INT => Ok(PropertyValue::Int(self.reader.read_i64()?)),
            TAG_FLOAT => Ok(PropertyValue::Float(self.reader.read_f64()?)),
            TAG_STRING => Ok(PropertyValue::String(self.read_string_body()?)),
            TAG_LIST => {
                let len = self.read_len()?;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(self.read_value_at_depth(depth + 1)?);
                }
                Ok(PropertyValue::List(items))
            }
            TAG_MAP => {
                let len = self.read_len()?;
                let mut entries = BTreeMap::new();
                for _ in 0..len {
                    let key = self.read_string()?;
                    let value = self.read_value_at_depth(depth + 1)?;
                    entries.insert(key, value);
                }
                Ok(PropertyValue::Map(entries))
            }
            tag => Err(DurabilityError::BadTag {
                tag,
                context: "value",
            }),
        }
    }

    fn read_string_body(&mut self) -> DurabilityResult<String> {
        let len = self.read_len()?;
        let mut buf = vec![0u8; len];
        self.reader.read_bytes(&mut buf)?;
        String::from_utf8(buf).map_err(|_| DurabilityError::BadTag {
            tag: TAG_STRING,
            context: "non-UTF-8 string",
        })
    }

    fn read_container_header(
        &mut self,
        expected: u8,
        context: &'static str,
    ) -> DurabilityResult<usize> {
        let tag = self.reader.read_u8()?;
        if tag != expected {
            return Err(DurabilityError::BadTag { tag, context });
        }
        self.read_len()
    }

    fn read_len(&mut self) -> DurabilityResult<usize> {
        let mut buf = [0u8; 4];
        self.reader.read_bytes(&mut buf)?;
        let len = u32::from_le_bytes(buf);
        if len > CONTAINER_LENGTH_MAX.max(STRING_LENGTH_BYTES_MAX) {
            return Err(DurabilityError::BadTag {
                tag: 0,
                context: "length exceeds maximum",
            });
        }
        Ok(len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: &PropertyValue) -> PropertyValue {
        let mut writer = HashedWriter::new(Vec::new());
        Encoder::new(&mut writer).write_value(value).unwrap();
        let buf = writer.get_ref().clone();

        let mut reader = HashedReader::new(&buf[..]);
        Decoder::new(&mut reader).read_value().unwrap()
    }

    #[test]
    fn test_scalar_roundtrips() {
        for value in [
            PropertyValue::Null,
            PropertyValue::Bool(true),
            PropertyValue::Bool(false),
            PropertyValue::Int(-42),
            PropertyValue::Int(i64::MAX),
            PropertyValue::Float(3.5),
            PropertyValue::from("hello"),
            PropertyValue::from(""),
        ] {
            assert_eq!(roundtrip(&value), value);
        }
    }

    #[test]
    fn test_nested_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert("name".to_owned(), PropertyValue::from("ada"));
        map.insert(
            "scores".to_owned(),
            PropertyValue::List(vec![PropertyValue::Int(1), PropertyValue::Float(2.5)]),
        );
        let value = PropertyValue::Map(map);

        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn test_typed_readers_reject_wrong_tag() {
        let mut writer = HashedWriter::new(Vec::new());
        Encoder::new(&mut writer).write_string("oops").unwrap();
        let buf = writer.get_ref().clone();

        let mut reader = HashedReader::new(&buf[..]);
        let result = Decoder::new(&mut reader).read_int();
        assert!(matches!(result, Err(DurabilityError::BadTag { .. })));
    }

    #[test]
    fn test_unknown_tag() {
        let buf = [0x7Fu8];
        let mut reader = HashedReader::new(&buf[..]);
        let result = Decoder::new(&mut reader).read_value();
        assert!(matches!(
            result,
            Err(DurabilityError::BadTag { tag: 0x7F, .. })
        ));
    }

    #[test]
    fn test_truncated_string() {
        let mut writer = HashedWriter::new(Vec::new());
        Encoder::new(&mut writer).write_string("truncate me").unwrap();
        let mut buf = writer.get_ref().clone();
        buf.truncate(buf.len() - 3);

        let mut reader = HashedReader::new(&buf[..]);
        let result = Decoder::new(&mut reader).read_string();
        assert!(matches!(result, Err(DurabilityError::Truncated { .. })));
    }

    #[test]
    fn test_int_list_roundtrip() {
        let mut writer = HashedWriter::new(Vec::new());
        Encoder::new(&mut writer)
            .write_int_list(&[1, -2, 3])
            .unwrap();
        let buf = writer.get_ref().clone();

        let mut reader = HashedReader::new(&buf[..]);
        assert_eq!(
            Decoder::new(&mut reader).read_int_list().unwrap(),
            vec![1, -2, 3]
        );
    }

    #[test]
    fn test_string_list_roundtrip() {
        let keys = vec!["L".to_owned(), "p".to_owned()];
        let mut writer = HashedWriter::new(Vec::new());
        Encoder::new(&mut writer).write_string_list(&keys).unwrap();
        let buf = writer.get_ref().clone();

        let mut reader = HashedReader::new(&buf[..]);
        assert_eq!(Decoder::new(&mut reader).read_string_list().unwrap(), keys);
    }

    #[test]
    fn test_reader_hash_tracks_writer() {
        let mut writer = HashedWriter::new(Vec::new());
        Encoder::new(&mut writer).write_int(99).unwrap();
        let expected = writer.hash();
        let buf = writer.get_ref().clone();

        let mut reader = HashedReader::new(&buf[..]);
        Decoder::new(&mut reader).read_int().unwrap();
        assert_eq!(reader.hash(), expected);
    }
}
