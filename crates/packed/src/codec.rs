//! Value codecs for variable-length packed structures.

/// A byte codec for `u64` values.
///
/// `decode` must never read at or past `limit`; reading past the encoded
/// data of a structure means the structure is corrupted and panics.
pub trait Codec {
    /// Longest possible encoding in bytes.
    const MAX_LEN: usize;

    /// Encoded length of a value.
    fn length(value: u64) -> usize;

    /// Encodes a value at `pos`, returning the number of bytes written.
    fn encode(buf: &mut [u8], pos: usize, value: u64) -> usize;

    /// Decodes a value at `pos`, returning it with its encoded length.
    fn decode(buf: &[u8], pos: usize, limit: usize) -> (u64, usize);
}

/// LEB128 style variable-length integer codec: 7 bits per byte, the high
/// bit marks continuation.
#[derive(Clone, Copy, Debug, Default)]
pub struct VarintCodec;

impl Codec for VarintCodec {
    const MAX_LEN: usize = 10;

    fn length(value: u64) -> usize {
        let bits = 64 - value.leading_zeros() as usize;
        if bits == 0 {
            1
        } else {
            (bits + 6) / 7
        }
    }

    fn encode(buf: &mut [u8], pos: usize, value: u64) -> usize {
        let mut v = value;
        let mut p = pos;
        loop {
            let mut byte = (v & 0x7F) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            buf[p] = byte;
            p += 1;
            if v == 0 {
                break;
            }
        }
        p - pos
    }

    fn decode(buf: &[u8], pos: usize, limit: usize) -> (u64, usize) {
        let mut result = 0u64;
        let mut shift = 0;
        let mut p = pos;
        loop {
            assert!(
                p < limit,
                "varint at {} runs past the end of encoded data ({})",
                pos,
                limit
            );
            let byte = buf[p];
            p += 1;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            assert!(shift < 70, "varint at {} is longer than 10 bytes", pos);
        }
        (result, p - pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lengths() {
        assert_eq!(VarintCodec::length(0), 1);
        assert_eq!(VarintCodec::length(127), 1);
        assert_eq!(VarintCodec::length(128), 2);
        assert_eq!(VarintCodec::length(16_383), 2);
        assert_eq!(VarintCodec::length(16_384), 3);
        assert_eq!(VarintCodec::length(u64::MAX), 10);
    }

    #[test]
    fn test_encode_decode() {
        let mut buf = [0u8; 32];
        let mut pos = 0;
        for v in [0u64, 1, 300, u64::MAX] {
            let len = VarintCodec::encode(&mut buf, pos, v);
            assert_eq!(len, VarintCodec::length(v));
            pos += len;
        }

        let mut p = 0;
        for v in [0u64, 1, 300, u64::MAX] {
            let (decoded, len) = VarintCodec::decode(&buf, p, pos);
            assert_eq!(decoded, v);
            p += len;
        }
        assert_eq!(p, pos);
    }

    #[test]
    #[should_panic(expected = "runs past the end")]
    fn test_decode_past_limit_panics() {
        let mut buf = [0u8; 4];
        VarintCodec::encode(&mut buf, 0, 300);
        VarintCodec::decode(&buf, 0, 1);
    }
}
