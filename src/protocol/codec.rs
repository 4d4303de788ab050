//! Wire codec for primitive protocol fields
//!
//! Integers are 4-byte big-endian. Strings are a length field followed by raw
//! bytes with no terminator; the width of the length field depends on where the
//! string appears (see [`LengthField`]).

use bytes::{Buf, BufMut};
use thiserror::Error;

use super::{MessageKind, MAX_STRING_LEN};

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Buffer truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("String too long: {len} bytes (limit: {limit})")]
    StringTooLong { len: usize, limit: usize },

    #[error("Description too long: {0} bytes")]
    DescriptionTooLong(usize),

    #[error("Unknown message kind: {0}")]
    UnknownKind(u32),

    #[error("Message kind {0:?} has no payload layout")]
    UnsupportedKind(MessageKind),

    #[error("Unknown variable kind: {0}")]
    UnknownVarKind(u32),

    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("String is not valid UTF-8")]
    InvalidUtf8,

    #[error("Variable name is empty")]
    EmptyName,

    #[error("Variable name {0:?} contains whitespace")]
    WhitespaceInName(String),
}

impl CodecError {
    /// Whether this error means the bytes on the wire could not be understood.
    ///
    /// A version mismatch is a compatibility failure rather than garbage input,
    /// so it is the only variant that is not malformed.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, CodecError::VersionMismatch { .. })
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Width of the length field that precedes a string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthField {
    /// 2-byte length, used only by description payloads
    U16,
    /// 4-byte length, used by variable names and string values
    U32,
}

impl LengthField {
    /// Bytes taken by the length field itself
    pub fn width(self) -> usize {
        match self {
            LengthField::U16 => 2,
            LengthField::U32 => 4,
        }
    }

    fn check(self, len: usize) -> CodecResult<()> {
        match self {
            LengthField::U16 if len > u16::MAX as usize => Err(CodecError::DescriptionTooLong(len)),
            LengthField::U32 if len >= MAX_STRING_LEN => Err(CodecError::StringTooLong {
                len,
                limit: MAX_STRING_LEN,
            }),
            _ => Ok(()),
        }
    }
}

/// Write a 4-byte big-endian integer
pub fn encode_u32(buf: &mut impl BufMut, value: u32) {
    buf.put_u32(value);
}

/// Read a 4-byte big-endian integer
pub fn decode_u32(buf: &mut impl Buf) -> CodecResult<u32> {
    ensure_remaining(buf.remaining(), 4)?;
    Ok(buf.get_u32())
}

/// Validate a string against the limit of its length field without writing it
pub fn check_string(s: &str, field: LengthField) -> CodecResult<()> {
    field.check(s.len())
}

/// Write a length-delimited string
///
/// Nothing is written if the string exceeds the limit for its length field.
pub fn encode_string(buf: &mut impl BufMut, s: &str, field: LengthField) -> CodecResult<()> {
    field.check(s.len())?;
    match field {
        LengthField::U16 => buf.put_u16(s.len() as u16),
        LengthField::U32 => buf.put_u32(s.len() as u32),
    }
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Read a length-delimited string
pub fn decode_string(buf: &mut impl Buf, field: LengthField) -> CodecResult<String> {
    ensure_remaining(buf.remaining(), field.width())?;
    let len = match field {
        LengthField::U16 => buf.get_u16() as usize,
        LengthField::U32 => buf.get_u32() as usize,
    };
    field.check(len)?;
    ensure_remaining(buf.remaining(), len)?;

    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

/// Encoded size of a string including its length field
pub fn string_size(s: &str, field: LengthField) -> usize {
    field.width() + s.len()
}

fn ensure_remaining(remaining: usize, needed: usize) -> CodecResult<()> {
    if remaining < needed {
        return Err(CodecError::Truncated { needed, remaining });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_u32_is_big_endian() {
        let mut buf = BytesMut::new();
        encode_u32(&mut buf, 0x0102_0304);
        assert_eq!(&buf[..], &[1, 2, 3, 4]);

        let mut slice = &buf[..];
        assert_eq!(decode_u32(&mut slice).unwrap(), 0x0102_0304);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_u32_truncated() {
        let mut slice: &[u8] = &[0, 1];
        assert_eq!(
            decode_u32(&mut slice),
            Err(CodecError::Truncated { needed: 4, remaining: 2 })
        );
    }

    #[test]
    fn test_string_has_no_terminator() {
        let mut buf = BytesMut::new();
        encode_string(&mut buf, "abc", LengthField::U32).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 3, b'a', b'b', b'c']);

        let mut buf = BytesMut::new();
        encode_string(&mut buf, "abc", LengthField::U16).unwrap();
        assert_eq!(&buf[..], &[0, 3, b'a', b'b', b'c']);
        assert_eq!(string_size("abc", LengthField::U16), buf.len());
    }

    #[test]
    fn test_string_limit() {
        let mut buf = BytesMut::new();
        let ok = "a".repeat(MAX_STRING_LEN - 1);
        encode_string(&mut buf, &ok, LengthField::U32).unwrap();
        let mut slice = &buf[..];
        assert_eq!(decode_string(&mut slice, LengthField::U32).unwrap(), ok);

        let mut buf = BytesMut::new();
        let too_long = "a".repeat(MAX_STRING_LEN);
        let err = encode_string(&mut buf, &too_long, LengthField::U32).unwrap_err();
        assert!(matches!(err, CodecError::StringTooLong { len: 2048, .. }));
        assert!(err.is_malformed());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        encode_u32(&mut buf, MAX_STRING_LEN as u32);
        let mut slice = &buf[..];
        assert!(matches!(
            decode_string(&mut slice, LengthField::U32),
            Err(CodecError::StringTooLong { .. })
        ));
    }

    #[test]
    fn test_decode_string_truncated_body() {
        let mut slice: &[u8] = &[0, 5, b'a', b'b'];
        assert_eq!(
            decode_string(&mut slice, LengthField::U16),
            Err(CodecError::Truncated { needed: 5, remaining: 2 })
        );
    }

    #[test]
    fn test_invalid_utf8() {
        let mut slice: &[u8] = &[0, 0, 0, 2, 0xff, 0xfe];
        assert_eq!(
            decode_string(&mut slice, LengthField::U32),
            Err(CodecError::InvalidUtf8)
        );
    }
}
