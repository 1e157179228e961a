//! Integer and slice encoding shared by the log, block and key formats.
//!
//! Varints are LEB128 (7 bits per byte, high bit = continuation, at most 10
//! bytes for a u64). Fixed-width integers are little-endian except for the
//! key suffix helpers, which are big-endian so that encoded numbers sort in
//! numeric order under a bytewise comparator.

use crate::error::{CodecError, Result};

/// Maximum encoded length of a u64 varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Appends `value` as a varint.
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Number of bytes `put_varint` produces for `value`.
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Decodes a varint from the front of `data`, advancing it.
pub fn get_varint(data: &mut &[u8]) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;

    for i in 0..MAX_VARINT_LEN {
        let Some(&byte) = data.get(i) else {
            return Err(CodecError::Incomplete {
                needed: i + 1,
                available: data.len(),
            });
        };

        let bits = (byte & 0x7F) as u64;
        // The tenth byte may only carry the single remaining bit.
        if shift == 63 && bits > 1 {
            return Err(CodecError::VarintOverflow);
        }
        result |= bits << shift;

        if byte & 0x80 == 0 {
            *data = &data[i + 1..];
            return Ok(result);
        }
        shift += 7;
    }

    Err(CodecError::VarintOverflow)
}

pub fn put_fixed32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn put_fixed64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Reads a little-endian u32 at `offset` without advancing.
pub fn decode_fixed32(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(CodecError::Incomplete {
            needed: offset + 4,
            available: data.len(),
        })?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn get_fixed32(data: &mut &[u8]) -> Result<u32> {
    let v = decode_fixed32(data, 0)?;
    *data = &data[4..];
    Ok(v)
}

pub fn get_fixed64(data: &mut &[u8]) -> Result<u64> {
    if data.len() < 8 {
        return Err(CodecError::Incomplete {
            needed: 8,
            available: data.len(),
        });
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[..8]);
    *data = &data[8..];
    Ok(u64::from_le_bytes(raw))
}

/// Appends `varint(len) || bytes`.
pub fn put_length_prefixed_slice(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub fn get_length_prefixed_slice<'a>(data: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = get_varint(data)? as usize;
    take(data, len)
}

/// Splits `len` bytes off the front of `data`.
pub fn take<'a>(data: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if data.len() < len {
        return Err(CodecError::Incomplete {
            needed: len,
            available: data.len(),
        });
    }
    let (head, tail) = data.split_at(len);
    *data = tail;
    Ok(head)
}

/// Builds `prefix || big-endian(n)`.
pub fn key_with_be_suffix(prefix: &[u8], n: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 8);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&n.to_be_bytes());
    key
}

/// Splits a key built by [`key_with_be_suffix`] into its prefix and number.
///
/// Returns `None` for keys shorter than eight bytes.
pub fn split_be_suffix(key: &[u8]) -> Option<(&[u8], u64)> {
    if key.len() < 8 {
        return None;
    }
    let (prefix, suffix) = key.split_at(key.len() - 8);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(suffix);
    Some((prefix, u64::from_be_bytes(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for v in [0u64, 1, 127, 128, 16383, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, v);
            assert_eq!(buf.len(), varint_len(v));
            let mut slice = buf.as_slice();
            assert_eq!(get_varint(&mut slice).unwrap(), v);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_varint_truncated() {
        let mut slice: &[u8] = &[0x80, 0x80];
        assert!(matches!(
            get_varint(&mut slice),
            Err(CodecError::Incomplete { .. })
        ));
    }

    #[test]
    fn test_varint_overlong_rejected() {
        let mut slice: &[u8] = &[0xFF; 11];
        assert_eq!(get_varint(&mut slice), Err(CodecError::VarintOverflow));

        // Ten bytes whose last byte overflows 64 bits.
        let mut bytes = vec![0xFF; 9];
        bytes.push(0x02);
        let mut slice = bytes.as_slice();
        assert_eq!(get_varint(&mut slice), Err(CodecError::VarintOverflow));
    }

    #[test]
    fn test_length_prefixed_slice() {
        let mut buf = Vec::new();
        put_length_prefixed_slice(&mut buf, b"hello");
        put_length_prefixed_slice(&mut buf, b"");
        let mut slice = buf.as_slice();
        assert_eq!(get_length_prefixed_slice(&mut slice).unwrap(), b"hello");
        assert_eq!(get_length_prefixed_slice(&mut slice).unwrap(), b"");
        assert!(slice.is_empty());
    }

    #[test]
    fn test_be_suffix_sorts_numerically() {
        let a = key_with_be_suffix(b"q", 255);
        let b = key_with_be_suffix(b"q", 256);
        assert!(a < b);
        assert_eq!(split_be_suffix(&b), Some((&b"q"[..], 256)));
        assert_eq!(split_be_suffix(b"short"), None);
    }
}
