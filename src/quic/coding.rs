//! QUIC variable-length integer encoding (RFC 9000 §16)

use bytes::{Buf, BufMut};

use crate::error::CodecError;

/// Largest value representable as a QUIC varint
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Number of bytes `value` occupies on the wire
pub fn varint_len(value: u64) -> usize {
    if value < (1 << 6) {
        1
    } else if value < (1 << 14) {
        2
    } else if value < (1 << 30) {
        4
    } else {
        8
    }
}

pub fn encode_varint<B: BufMut>(buf: &mut B, value: u64) {
    debug_assert!(value <= MAX_VARINT, "varint out of range: {}", value);
    let value = value & MAX_VARINT;
    match varint_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | value),
    }
}

pub fn decode_varint<B: Buf>(buf: &mut B) -> Result<u64, CodecError> {
    if !buf.has_remaining() {
        return Err(CodecError::UnexpectedEnd("varint"));
    }
    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return Err(CodecError::UnexpectedEnd("varint"));
    }
    let value = match len {
        1 => u64::from(buf.get_u8()),
        2 => u64::from(buf.get_u16() & 0x3fff),
        4 => u64::from(buf.get_u32() & 0x3fff_ffff),
        _ => buf.get_u64() & MAX_VARINT,
    };
    Ok(value)
}

/// Check that a value read from the application fits in a varint
pub fn checked_varint(value: u64) -> Result<u64, CodecError> {
    if value > MAX_VARINT {
        Err(CodecError::VarIntRange(value))
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_rfc_examples() {
        // RFC 9000 appendix A.1 sample encodings
        let samples: [(&[u8], u64); 4] = [
            (&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c], 151_288_809_941_952_652),
            (&[0x9d, 0x7f, 0x3e, 0x7d], 494_878_333),
            (&[0x7b, 0xbd], 15_293),
            (&[0x25], 37),
        ];
        for (wire, value) in samples {
            let mut buf = wire;
            assert_eq!(decode_varint(&mut buf).unwrap(), value);

            let mut out = BytesMut::new();
            encode_varint(&mut out, value);
            assert_eq!(&out[..], wire);
        }
    }

    #[test]
    fn test_two_byte_encoding_of_small_value() {
        let mut buf: &[u8] = &[0x40, 0x25];
        assert_eq!(decode_varint(&mut buf).unwrap(), 37);
    }

    #[test]
    fn test_truncated_input() {
        let mut buf: &[u8] = &[0x9d, 0x7f];
        assert_eq!(decode_varint(&mut buf), Err(CodecError::UnexpectedEnd("varint")));
    }

    #[test]
    fn test_range_check() {
        assert!(checked_varint(MAX_VARINT).is_ok());
        assert!(checked_varint(MAX_VARINT + 1).is_err());
    }
}
