//! Unsigned LEB128 varint used as the frame length prefix.

use bytes::{BufMut, BytesMut};

use crate::WireError;

/// Maximum encoded length of a u64 uvarint
pub const MAX_UVARINT_LEN: usize = 10;

/// Append a uvarint to the buffer
pub fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Decode a uvarint from the front of the slice.
///
/// Returns `Ok(None)` when more bytes are needed, `Ok(Some((value, len)))`
/// on success where `len` is the number of bytes consumed.
pub fn get_uvarint(buf: &[u8]) -> Result<Option<(u64, usize)>, WireError> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i >= MAX_UVARINT_LEN {
            return Err(WireError::Varint);
        }
        // The tenth byte may only hold the top bit of a u64
        if i == MAX_UVARINT_LEN - 1 && *byte > 1 {
            return Err(WireError::Varint);
        }
        let low = (byte & 0x7F) as u64;
        value = low
            .checked_shl(7 * i as u32)
            .and_then(|v| value.checked_add(v))
            .ok_or(WireError::Varint)?;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uvarint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            put_uvarint(&mut buf, value);
            let (decoded, len) = get_uvarint(&buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(len, buf.len());
        }
    }

    #[test]
    fn test_uvarint_incomplete() {
        // High bit set on every byte, nothing terminates
        assert!(get_uvarint(&[0x80, 0x80]).unwrap().is_none());
        assert!(get_uvarint(&[]).unwrap().is_none());
    }

    #[test]
    fn test_uvarint_overflow() {
        // 11 continuation bytes can never be a valid u64
        let bad = [0xFF; 11];
        assert!(get_uvarint(&bad).is_err());
    }
}
