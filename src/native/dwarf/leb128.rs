//! LEB128 varints as used by DWARF expression bytecode.
//!
//! The engine decodes variable location expressions from raw section bytes,
//! so it needs its own readers rather than going through a section cursor.

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of data")]
    UnexpectedEndOfData,
    #[error("varint does not fit in 64 bits")]
    Overflow,
}

/// Read an unsigned LEB128 value, advancing `pos`.
pub fn read_uleb128(bytes: &[u8], pos: &mut usize) -> Result<u64, DecodeError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos).ok_or(DecodeError::UnexpectedEndOfData)?;
        *pos += 1;
        if shift == 63 && byte > 1 {
            return Err(DecodeError::Overflow);
        }
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift > 63 {
            return Err(DecodeError::Overflow);
        }
    }
}

/// Read a signed LEB128 value, advancing `pos`.
pub fn read_sleb128(bytes: &[u8], pos: &mut usize) -> Result<i64, DecodeError> {
    let mut result: i64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos).ok_or(DecodeError::UnexpectedEndOfData)?;
        *pos += 1;
        result |= i64::from(byte & 0x7f) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            return Ok(result);
        }
        if shift > 63 {
            return Err(DecodeError::Overflow);
        }
    }
}

pub fn write_uleb128(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return;
        }
    }
}

pub fn write_sleb128(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        let sign_clear = byte & 0x40 == 0;
        if (value == 0 && sign_clear) || (value == -1 && !sign_clear) {
            out.push(byte);
            return;
        }
        byte |= 0x80;
        out.push(byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_round_trip() {
        let values = [0u64, 1, 127, 128, 300, u64::from(u32::MAX)];
        let mut encoded = Vec::new();
        for v in values {
            write_uleb128(&mut encoded, v);
        }

        let mut pos = 0;
        let decoded: Vec<u64> = values
            .iter()
            .map(|_| read_uleb128(&encoded, &mut pos).unwrap())
            .collect();
        assert_eq!(decoded, values);
        assert_eq!(pos, encoded.len());
    }

    #[test]
    fn signed_round_trip() {
        let values = [0i64, 1, -1, 63, -64, 64, -65, 300, -300, i64::MIN, i64::MAX];
        let mut encoded = Vec::new();
        for v in values {
            write_sleb128(&mut encoded, v);
        }

        let mut pos = 0;
        for v in values {
            assert_eq!(read_sleb128(&encoded, &mut pos).unwrap(), v);
        }
        assert_eq!(pos, encoded.len());
    }

    #[test]
    fn known_encodings() {
        let mut out = Vec::new();
        write_uleb128(&mut out, 300);
        assert_eq!(out, [0xac, 0x02]);

        let mut pos = 0;
        assert_eq!(read_uleb128(&[0x7f], &mut pos).unwrap(), 127);
    }

    #[test]
    fn truncated_input_is_unexpected_end_of_data() {
        let mut pos = 0;
        assert_eq!(
            read_uleb128(&[], &mut pos),
            Err(DecodeError::UnexpectedEndOfData)
        );

        // continuation bit set but nothing follows
        let mut pos = 0;
        assert_eq!(
            read_uleb128(&[0xac], &mut pos),
            Err(DecodeError::UnexpectedEndOfData)
        );

        let mut pos = 0;
        assert_eq!(
            read_sleb128(&[0xff, 0x80], &mut pos),
            Err(DecodeError::UnexpectedEndOfData)
        );
    }

    #[test]
    fn oversized_varint_is_an_overflow() {
        let bytes = [0xff; 11];
        let mut pos = 0;
        assert_eq!(read_uleb128(&bytes, &mut pos), Err(DecodeError::Overflow));
    }
}
