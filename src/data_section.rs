//! MMDB data section encoding and decoding
//!
//! Records attached to networks in a MaxMind DB live in the data section and
//! use the MMDB data format: a control byte (3 type bits, 5 size bits),
//! optional extended-type and size bytes, then the payload.
//!
//! # Supported Types
//!
//! - **Pointer** (1): reference into the data section, resolved on decode
//! - **String** (2), **Double** (3), **Bytes** (4)
//! - **Uint16** (5), **Uint32** (6), **Map** (7)
//! - **Int32** (8), **Uint64** (9), **Uint128** (10), **Array** (11)
//! - **Bool** (14), **Float** (15)
//!
//! Types 8 and above are "extended": the control byte carries type 0 and the
//! following byte holds `type - 7`.
//!
//! See: https://maxmind.github.io/MaxMind-DB/

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::collections::HashMap;

/// Maximum nesting of maps and arrays accepted by the decoder
const MAX_DEPTH: usize = 512;

/// Decoded MMDB value
///
/// Records returned by lookups and network scans are trees of this type.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    /// Pointer to another data item (only produced by the encoder; the
    /// decoder resolves pointers)
    Pointer(u32),
    /// UTF-8 string
    String(String),
    /// IEEE 754 double precision float
    Double(f64),
    /// Raw byte array
    Bytes(Vec<u8>),
    /// Unsigned 16-bit integer
    Uint16(u16),
    /// Unsigned 32-bit integer
    Uint32(u32),
    /// Key-value map (string keys only per MMDB spec)
    Map(HashMap<String, DataValue>),
    /// Signed 32-bit integer
    Int32(i32),
    /// Unsigned 64-bit integer
    Uint64(u64),
    /// Unsigned 128-bit integer
    Uint128(u128),
    /// Array of values
    Array(Vec<DataValue>),
    /// Boolean value
    Bool(bool),
    /// IEEE 754 single precision float
    Float(f32),
}

impl DataValue {
    /// Resolve a dot-separated path (`country.iso_code`) through nested maps.
    ///
    /// Returns `None` when a segment is missing or an intermediate value is
    /// not a map.
    pub fn get_path(&self, path: &str) -> Option<&DataValue> {
        path.split('.').try_fold(self, |value, segment| match value {
            DataValue::Map(map) => map.get(segment),
            _ => None,
        })
    }

    /// Borrow the string payload, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer payload widened to i128, for any integer type
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            DataValue::Uint16(n) => Some(*n as i128),
            DataValue::Uint32(n) => Some(*n as i128),
            DataValue::Int32(n) => Some(*n as i128),
            DataValue::Uint64(n) => Some(*n as i128),
            DataValue::Uint128(n) => i128::try_from(*n).ok(),
            _ => None,
        }
    }

    /// Unsigned integer payload, for metadata fields
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DataValue::Uint16(n) => Some(*n as u64),
            DataValue::Uint32(n) => Some(*n as u64),
            DataValue::Uint64(n) => Some(*n),
            DataValue::Uint128(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    /// Convert a JSON value into the narrowest matching MMDB type.
    ///
    /// Used when building databases from JSON input. `null` has no MMDB
    /// representation and is rejected.
    pub fn from_json(value: &serde_json::Value) -> Result<DataValue, String> {
        use serde_json::Value;

        Ok(match value {
            Value::Null => return Err("null values cannot be stored".to_string()),
            Value::Bool(b) => DataValue::Bool(*b),
            Value::String(s) => DataValue::String(s.clone()),
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    if let Ok(small) = u32::try_from(u) {
                        DataValue::Uint32(small)
                    } else {
                        DataValue::Uint64(u)
                    }
                } else if let Some(i) = n.as_i64() {
                    match i32::try_from(i) {
                        Ok(small) => DataValue::Int32(small),
                        Err(_) => DataValue::Double(i as f64),
                    }
                } else {
                    DataValue::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::Array(items) => DataValue::Array(
                items
                    .iter()
                    .map(DataValue::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => {
                let mut out = HashMap::with_capacity(map.len());
                for (key, item) in map {
                    let converted = DataValue::from_json(item)
                        .map_err(|e| format!("field '{}': {}", key, e))?;
                    out.insert(key.clone(), converted);
                }
                DataValue::Map(out)
            }
        })
    }
}

impl Serialize for DataValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DataValue::Pointer(p) => serializer.serialize_u32(*p),
            DataValue::String(s) => serializer.serialize_str(s),
            DataValue::Double(d) => serializer.serialize_f64(*d),
            DataValue::Bytes(bytes) => {
                let mut seq = serializer.serialize_seq(Some(bytes.len()))?;
                for b in bytes {
                    seq.serialize_element(b)?;
                }
                seq.end()
            }
            DataValue::Uint16(n) => serializer.serialize_u16(*n),
            DataValue::Uint32(n) => serializer.serialize_u32(*n),
            DataValue::Map(map) => {
                // Sorted keys keep tool output stable between calls
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
            DataValue::Int32(n) => serializer.serialize_i32(*n),
            DataValue::Uint64(n) => serializer.serialize_u64(*n),
            DataValue::Uint128(n) => serializer.serialize_u128(*n),
            DataValue::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            DataValue::Bool(b) => serializer.serialize_bool(*b),
            DataValue::Float(f) => serializer.serialize_f32(*f),
        }
    }
}

/// Error raised while decoding the data section
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at data offset {offset}")]
pub struct DecodeError {
    /// Offset (relative to the decoder's buffer) where decoding failed
    pub offset: usize,
    /// What went wrong
    pub message: &'static str,
}

/// Data section encoder
///
/// Builds a data section by encoding values and tracking offsets.
/// Identical values get the same offset.
pub struct DataEncoder {
    buffer: Vec<u8>,
    dedup_map: HashMap<Vec<u8>, u32>,
}

impl DataEncoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            dedup_map: HashMap::new(),
        }
    }

    /// Encode a value and return its offset
    ///
    /// If the value was previously encoded, returns the existing offset.
    pub fn encode(&mut self, value: &DataValue) -> u32 {
        let mut temp = Vec::new();
        Self::encode_to_buffer(value, &mut temp);

        if let Some(&offset) = self.dedup_map.get(&temp) {
            return offset;
        }

        let offset = self.buffer.len() as u32;
        self.buffer.extend_from_slice(&temp);
        self.dedup_map.insert(temp, offset);
        offset
    }

    /// Get the final encoded data section
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get current buffer size
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    fn encode_to_buffer(value: &DataValue, buffer: &mut Vec<u8>) {
        match value {
            DataValue::Pointer(offset) => Self::encode_pointer(*offset, buffer),
            DataValue::String(s) => {
                Self::write_control(2, s.len(), buffer);
                buffer.extend_from_slice(s.as_bytes());
            }
            DataValue::Double(d) => {
                Self::write_control(3, 8, buffer);
                buffer.extend_from_slice(&d.to_be_bytes());
            }
            DataValue::Bytes(b) => {
                Self::write_control(4, b.len(), buffer);
                buffer.extend_from_slice(b);
            }
            DataValue::Uint16(n) => Self::encode_uint(5, &n.to_be_bytes(), buffer),
            DataValue::Uint32(n) => Self::encode_uint(6, &n.to_be_bytes(), buffer),
            DataValue::Map(m) => {
                Self::write_control(7, m.len(), buffer);
                // Sorted by key for deterministic output
                let mut pairs: Vec<_> = m.iter().collect();
                pairs.sort_by_key(|(k, _)| *k);
                for (key, value) in pairs {
                    Self::encode_to_buffer(&DataValue::String(key.clone()), buffer);
                    Self::encode_to_buffer(value, buffer);
                }
            }
            DataValue::Int32(n) => {
                Self::write_control(8, 4, buffer);
                buffer.extend_from_slice(&n.to_be_bytes());
            }
            DataValue::Uint64(n) => Self::encode_uint(9, &n.to_be_bytes(), buffer),
            DataValue::Uint128(n) => Self::encode_uint(10, &n.to_be_bytes(), buffer),
            DataValue::Array(a) => {
                Self::write_control(11, a.len(), buffer);
                for value in a {
                    Self::encode_to_buffer(value, buffer);
                }
            }
            // Bool carries its value in the size field
            DataValue::Bool(b) => Self::write_control(14, *b as usize, buffer),
            DataValue::Float(f) => {
                Self::write_control(15, 4, buffer);
                buffer.extend_from_slice(&f.to_be_bytes());
            }
        }
    }

    // Type 1: the size bits select 1-4 payload bytes, the low three bits of
    // the control byte extend the first three forms.
    fn encode_pointer(offset: u32, buffer: &mut Vec<u8>) {
        if offset < 0x800 {
            buffer.push(0x20 | ((offset >> 8) & 0x7) as u8);
            buffer.push(offset as u8);
        } else if offset < 0x80800 {
            let adjusted = offset - 0x800;
            buffer.push(0x28 | ((adjusted >> 16) & 0x7) as u8);
            buffer.extend_from_slice(&(adjusted as u16).to_be_bytes());
        } else if offset < 0x0808_0800 {
            let adjusted = offset - 0x80800;
            buffer.push(0x30 | ((adjusted >> 24) & 0x7) as u8);
            buffer.extend_from_slice(&adjusted.to_be_bytes()[1..]);
        } else {
            buffer.push(0x38);
            buffer.extend_from_slice(&offset.to_be_bytes());
        }
    }

    /// Unsigned integers are stored with leading zero bytes stripped
    fn encode_uint(type_id: u8, be_bytes: &[u8], buffer: &mut Vec<u8>) {
        let first = be_bytes
            .iter()
            .position(|&b| b != 0)
            .unwrap_or(be_bytes.len());
        let payload = &be_bytes[first..];
        Self::write_control(type_id, payload.len(), buffer);
        buffer.extend_from_slice(payload);
    }

    /// Write the control byte, the extended type byte (types > 7) and any
    /// size extension bytes.
    fn write_control(type_id: u8, size: usize, buffer: &mut Vec<u8>) {
        let type_bits = if type_id > 7 { 0 } else { type_id << 5 };

        let (size_bits, extra): (u8, Vec<u8>) = if size < 29 {
            (size as u8, Vec::new())
        } else if size < 29 + 256 {
            (29, vec![(size - 29) as u8])
        } else if size < 29 + 256 + 65536 {
            (30, ((size - 285) as u16).to_be_bytes().to_vec())
        } else {
            (31, ((size - 65821) as u32).to_be_bytes()[1..].to_vec())
        };

        buffer.push(type_bits | size_bits);
        if type_id > 7 {
            buffer.push(type_id - 7);
        }
        buffer.extend_from_slice(&extra);
    }
}

impl Default for DataEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Data section decoder
///
/// Decodes values from an encoded data section buffer. Pointers are
/// followed and replaced by the value they reference.
pub struct DataDecoder<'a> {
    buffer: &'a [u8],
    base_offset: usize,
}

impl<'a> DataDecoder<'a> {
    /// Create a decoder for a data section
    ///
    /// # Arguments
    /// * `buffer` - The encoded data buffer
    /// * `base_offset` - Offset subtracted from offsets passed to `decode`
    pub fn new(buffer: &'a [u8], base_offset: usize) -> Self {
        Self {
            buffer,
            base_offset,
        }
    }

    /// Decode a value at the given offset
    pub fn decode(&self, offset: u32) -> Result<DataValue, DecodeError> {
        let mut cursor = (offset as usize)
            .checked_sub(self.base_offset)
            .ok_or(DecodeError {
                offset: offset as usize,
                message: "offset before base",
            })?;
        self.decode_at(&mut cursor, 0)
    }

    fn err(&self, offset: usize, message: &'static str) -> DecodeError {
        DecodeError { offset, message }
    }

    fn take(&self, cursor: &mut usize, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = cursor
            .checked_add(len)
            .filter(|&end| end <= self.buffer.len())
            .ok_or_else(|| self.err(*cursor, "data out of bounds"))?;
        let bytes = &self.buffer[*cursor..end];
        *cursor = end;
        Ok(bytes)
    }

    fn decode_at(&self, cursor: &mut usize, depth: usize) -> Result<DataValue, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(self.err(*cursor, "nesting too deep"));
        }

        let start = *cursor;
        let ctrl = self.take(cursor, 1)?[0];
        let mut type_id = ctrl >> 5;

        if type_id == 1 {
            let target = self.decode_pointer(cursor, ctrl)?;
            let mut target_cursor = target as usize;
            let value = self.decode_at(&mut target_cursor, depth + 1)?;
            if matches!(value, DataValue::Pointer(_)) {
                return Err(self.err(start, "pointer to pointer"));
            }
            return Ok(value);
        }

        if type_id == 0 {
            let ext = self.take(cursor, 1)?[0];
            type_id = ext
                .checked_add(7)
                .filter(|t| (8..=15).contains(t))
                .ok_or_else(|| self.err(start, "invalid extended type"))?;
        }

        let size = self.decode_size(cursor, ctrl & 0x1F)?;

        match type_id {
            2 => {
                let bytes = self.take(cursor, size)?;
                let s = std::str::from_utf8(bytes).map_err(|_| self.err(start, "invalid UTF-8"))?;
                Ok(DataValue::String(s.to_string()))
            }
            3 => {
                if size != 8 {
                    return Err(self.err(start, "double must be 8 bytes"));
                }
                let bytes = self.take(cursor, 8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Ok(DataValue::Double(f64::from_be_bytes(buf)))
            }
            4 => Ok(DataValue::Bytes(self.take(cursor, size)?.to_vec())),
            5 => Ok(DataValue::Uint16(self.read_uint(cursor, size, 2)? as u16)),
            6 => Ok(DataValue::Uint32(self.read_uint(cursor, size, 4)? as u32)),
            7 => {
                let mut map = HashMap::with_capacity(size.min(1024));
                for _ in 0..size {
                    let key = match self.decode_at(cursor, depth + 1)? {
                        DataValue::String(s) => s,
                        _ => return Err(self.err(*cursor, "map key must be a string")),
                    };
                    let value = self.decode_at(cursor, depth + 1)?;
                    map.insert(key, value);
                }
                Ok(DataValue::Map(map))
            }
            8 => Ok(DataValue::Int32(self.read_uint(cursor, size, 4)? as u32 as i32)),
            9 => Ok(DataValue::Uint64(self.read_uint(cursor, size, 8)? as u64)),
            10 => Ok(DataValue::Uint128(self.read_uint(cursor, size, 16)?)),
            11 => {
                let mut array = Vec::with_capacity(size.min(1024));
                for _ in 0..size {
                    array.push(self.decode_at(cursor, depth + 1)?);
                }
                Ok(DataValue::Array(array))
            }
            14 => match size {
                0 => Ok(DataValue::Bool(false)),
                1 => Ok(DataValue::Bool(true)),
                _ => Err(self.err(start, "invalid bool size")),
            },
            15 => {
                if size != 4 {
                    return Err(self.err(start, "float must be 4 bytes"));
                }
                let bytes = self.take(cursor, 4)?;
                let mut buf = [0u8; 4];
                buf.copy_from_slice(bytes);
                Ok(DataValue::Float(f32::from_be_bytes(buf)))
            }
            _ => Err(self.err(start, "unsupported data type")),
        }
    }

    fn decode_pointer(&self, cursor: &mut usize, ctrl: u8) -> Result<u32, DecodeError> {
        let size = (ctrl >> 3) & 0x3;
        let high = (ctrl & 0x7) as u32;
        let bytes = self.take(cursor, size as usize + 1)?;
        let value = bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);

        Ok(match size {
            0 => (high << 8) | value,
            1 => ((high << 16) | value) + 0x800,
            2 => ((high << 24) | value) + 0x80800,
            _ => value,
        })
    }

    fn read_uint(&self, cursor: &mut usize, size: usize, max: usize) -> Result<u128, DecodeError> {
        if size > max {
            return Err(self.err(*cursor, "integer too wide for its type"));
        }
        let bytes = self.take(cursor, size)?;
        Ok(bytes.iter().fold(0u128, |acc, &b| (acc << 8) | b as u128))
    }

    fn decode_size(&self, cursor: &mut usize, size_bits: u8) -> Result<usize, DecodeError> {
        match size_bits {
            0..=28 => Ok(size_bits as usize),
            29 => Ok(29 + self.take(cursor, 1)?[0] as usize),
            30 => {
                let b = self.take(cursor, 2)?;
                Ok(285 + u16::from_be_bytes([b[0], b[1]]) as usize)
            }
            _ => {
                let b = self.take(cursor, 3)?;
                Ok(65821 + ((b[0] as usize) << 16 | (b[1] as usize) << 8 | b[2] as usize))
            }
        }
    }
}
