//! LEB128 integers as used inside runestone payloads

use crate::error::{LaserError, Result};

/// Append `value` as unsigned LEB128
pub fn encode_to(mut value: u128, out: &mut Vec<u8>) {
    while value >> 7 > 0 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

pub fn encode(value: u128) -> Vec<u8> {
    let mut out = Vec::with_capacity(19);
    encode_to(value, &mut out);
    out
}

/// Decode one integer, returning it and the bytes consumed
pub fn decode(bytes: &[u8]) -> Result<(u128, usize)> {
    let mut value: u128 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        if i > 18 {
            return Err(LaserError::Codec("varint overflows u128".to_string()));
        }
        let low = u128::from(byte & 0x7f);
        if i == 18 && low > 0b11 {
            return Err(LaserError::Codec("varint overflows u128".to_string()));
        }
        value |= low << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(LaserError::Codec("truncated varint".to_string()))
}

/// Decode a whole buffer into integers
pub fn decode_all(mut bytes: &[u8]) -> Result<Vec<u128>> {
    let mut values = Vec::new();
    while !bytes.is_empty() {
        let (value, used) = decode(bytes)?;
        values.push(value);
        bytes = &bytes[used..];
    }
    Ok(values)
}

/// Encode a list of integers back to back
pub fn encode_all(values: &[u128]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        encode_to(*value, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_encodings() {
        assert_eq!(encode(0), vec![0x00]);
        assert_eq!(encode(127), vec![0x7f]);
        assert_eq!(encode(128), vec![0x80, 0x01]);
        assert_eq!(encode(300), vec![0xac, 0x02]);
    }

    #[test]
    fn test_boundaries() {
        for value in [0, 1, 127, 128, u64::MAX as u128, u128::MAX] {
            let bytes = encode(value);
            assert_eq!(decode(&bytes).unwrap(), (value, bytes.len()));
        }
        assert_eq!(encode(u128::MAX).len(), 19);
    }

    #[test]
    fn test_truncated_and_overlong() {
        assert!(decode(&[0x80]).is_err());
        assert!(decode(&[0xff; 20]).is_err());
        let mut overflow = vec![0xff; 18];
        overflow.push(0x04);
        assert!(decode(&overflow).is_err());
    }

    #[test]
    fn test_list() {
        let values = vec![22, 1, 0, 840000, 3, 1_000_000, 2];
        assert_eq!(decode_all(&encode_all(&values)).unwrap(), values);
        assert!(decode_all(&[]).unwrap().is_empty());
    }
}
