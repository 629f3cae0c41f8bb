//! Canonical encoding for deterministic serialization.
//!
//! Pointers, node records, and bandwidth allocations are hashed, signed, or
//! stored by their byte representation, so the encoding must be deterministic:
//!
//! - Integers: little-endian
//! - Fixed arrays: raw bytes, no length prefix
//! - Variable sequences and strings: u32 length prefix
//! - Options: 0x00 for None, 0x01 followed by the value
//! - Structs: fields in declaration order
//! - Enums: u32 tag, then the payload fields

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors during canonical decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes remained to decode the next field.
    #[error("insufficient bytes: expected {expected}, got {available}")]
    InsufficientBytes {
        /// Bytes the field needed.
        expected: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// A string field held invalid UTF-8.
    #[error("invalid UTF-8 string: {0}")]
    InvalidUtf8(String),

    /// An enum tag did not match any known variant.
    #[error("invalid enum tag: {0}")]
    InvalidEnumTag(u32),

    /// Catch-all for type-specific decode failures.
    #[error("{0}")]
    Custom(String),
}

/// Types with a deterministic byte representation.
pub trait CanonicalEncode {
    /// Appends the canonical encoding to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Returns the canonical encoding as frozen bytes.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Returns the canonical encoding as a Vec.
    fn to_vec(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}

/// Types decodable from their canonical representation.
pub trait CanonicalDecode: Sized {
    /// Decodes a value, consuming bytes from `buf`.
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError>;

    /// Decodes a value from a byte slice.
    fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        Self::decode(&mut buf)
    }
}

fn need(buf: &Bytes, n: usize) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        return Err(DecodeError::InsufficientBytes {
            expected: n,
            available: buf.remaining(),
        });
    }
    Ok(())
}

impl CanonicalEncode for u8 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(*self);
    }
}

impl CanonicalDecode for u8 {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 1)?;
        Ok(buf.get_u8())
    }
}

impl CanonicalEncode for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(*self as u8);
    }
}

impl CanonicalDecode for bool {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u8::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidEnumTag(other as u32)),
        }
    }
}

impl CanonicalEncode for u32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(*self);
    }
}

impl CanonicalDecode for u32 {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 4)?;
        Ok(buf.get_u32_le())
    }
}

impl CanonicalEncode for u64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(*self);
    }
}

impl CanonicalDecode for u64 {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 8)?;
        Ok(buf.get_u64_le())
    }
}

impl CanonicalEncode for i64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(*self);
    }
}

impl CanonicalDecode for i64 {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 8)?;
        Ok(buf.get_i64_le())
    }
}

impl CanonicalEncode for f64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.to_bits());
    }
}

impl CanonicalDecode for f64 {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 8)?;
        Ok(f64::from_bits(buf.get_u64_le()))
    }
}

impl<const N: usize> CanonicalEncode for [u8; N] {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }
}

impl<const N: usize> CanonicalDecode for [u8; N] {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, N)?;
        let mut arr = [0u8; N];
        buf.copy_to_slice(&mut arr);
        Ok(arr)
    }
}

impl<T: CanonicalEncode> CanonicalEncode for Vec<T> {
    fn encode(&self, buf: &mut BytesMut) {
        assert!(self.len() <= u32::MAX as usize, "sequence length exceeds u32::MAX");
        (self.len() as u32).encode(buf);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: CanonicalDecode> CanonicalDecode for Vec<T> {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let len = u32::decode(buf)? as usize;
        let mut vec = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            vec.push(T::decode(buf)?);
        }
        Ok(vec)
    }
}

impl CanonicalEncode for String {
    fn encode(&self, buf: &mut BytesMut) {
        let bytes = self.as_bytes();
        assert!(bytes.len() <= u32::MAX as usize, "string length exceeds u32::MAX");
        (bytes.len() as u32).encode(buf);
        buf.put_slice(bytes);
    }
}

impl CanonicalDecode for String {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let len = u32::decode(buf)? as usize;
        need(buf, len)?;
        let bytes = buf.copy_to_bytes(len);
        String::from_utf8(bytes.to_vec()).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))
    }
}

impl<T: CanonicalEncode> CanonicalEncode for Option<T> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            None => buf.put_u8(0x00),
            Some(value) => {
                buf.put_u8(0x01);
                value.encode(buf);
            }
        }
    }
}

impl<T: CanonicalDecode> CanonicalDecode for Option<T> {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u8::decode(buf)? {
            0x00 => Ok(None),
            0x01 => Ok(Some(T::decode(buf)?)),
            tag => Err(DecodeError::InvalidEnumTag(tag as u32)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_encoding_is_little_endian() {
        let value: u32 = 1;
        assert_eq!(value.to_vec(), vec![0x01, 0x00, 0x00, 0x00]);

        let value: i64 = 1700000000000;
        assert_eq!(value.to_vec(), hex::decode("0068e5cf8b010000").unwrap());
    }

    #[test]
    fn test_vec_length_prefix() {
        let vec: Vec<u8> = vec![0xAA, 0xBB, 0xCC];
        assert_eq!(vec.to_vec(), vec![0x03, 0x00, 0x00, 0x00, 0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_option_tags() {
        let none: Option<u32> = None;
        assert_eq!(none.to_vec(), vec![0x00]);

        let some: Option<u32> = Some(0x12345678);
        assert_eq!(some.to_vec(), vec![0x01, 0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_string_roundtrip() {
        let s = String::from("bucket/söng1.mp3");
        let decoded = String::from_bytes(&s.to_vec()).unwrap();
        assert_eq!(s, decoded);
    }

    #[test]
    fn test_roundtrip_primitives() {
        let val: u64 = 0xDEADBEEF;
        assert_eq!(u64::from_bytes(&val.to_vec()).unwrap(), val);

        let val: i64 = -1234567890;
        assert_eq!(i64::from_bytes(&val.to_vec()).unwrap(), val);

        let val: Vec<u32> = vec![1, 2, 3, 4, 5];
        assert_eq!(Vec::<u32>::from_bytes(&val.to_vec()).unwrap(), val);
    }

    #[test]
    fn test_truncated_input_errors() {
        let err = u64::from_bytes(&[0x01, 0x02]).unwrap_err();
        assert!(matches!(err, DecodeError::InsufficientBytes { expected: 8, available: 2 }));
    }

    #[test]
    fn test_bool_rejects_other_tags() {
        assert!(bool::from_bytes(&[0x02]).is_err());
        assert!(bool::from_bytes(&[0x01]).unwrap());
        assert!(!bool::from_bytes(&[0x00]).unwrap());
    }
}
