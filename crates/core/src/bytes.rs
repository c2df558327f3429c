//! Little-endian field access and alignment helpers for packed byte images.
//!
//! Every accessor panics when the field does not fit in the buffer: callers
//! compute offsets from validated headers, so an out-of-range access means
//! the image is corrupted.

/// Alignment of every packed stream and structure, in bytes.
pub const ALIGNMENT: usize = 8;

/// Rounds `n` up to a multiple of `alignment` (a power of two).
#[inline]
pub const fn align_up(n: usize, alignment: usize) -> usize {
    (n + alignment - 1) & !(alignment - 1)
}

/// Rounds `n` up to [`ALIGNMENT`].
#[inline]
pub const fn align8(n: usize) -> usize {
    align_up(n, ALIGNMENT)
}

/// Integer division rounding up.
#[inline]
pub const fn div_up(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

#[inline]
pub fn read_u8(buf: &[u8], pos: usize) -> u8 {
    buf[pos]
}

#[inline]
pub fn write_u8(buf: &mut [u8], pos: usize, v: u8) {
    buf[pos] = v;
}

#[inline]
pub fn read_u32(buf: &[u8], pos: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_le_bytes(b)
}

#[inline]
pub fn write_u32(buf: &mut [u8], pos: usize, v: u32) {
    buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn read_i32(buf: &[u8], pos: usize) -> i32 {
    read_u32(buf, pos) as i32
}

#[inline]
pub fn write_i32(buf: &mut [u8], pos: usize, v: i32) {
    write_u32(buf, pos, v as u32);
}

#[inline]
pub fn read_u64(buf: &[u8], pos: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[pos..pos + 8]);
    u64::from_le_bytes(b)
}

#[inline]
pub fn write_u64(buf: &mut [u8], pos: usize, v: u64) {
    buf[pos..pos + 8].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn read_u128(buf: &[u8], pos: usize) -> u128 {
    let mut b = [0u8; 16];
    b.copy_from_slice(&buf[pos..pos + 16]);
    u128::from_le_bytes(b)
}

#[inline]
pub fn write_u128(buf: &mut [u8], pos: usize, v: u128) {
    buf[pos..pos + 16].copy_from_slice(&v.to_le_bytes());
}

/// 64-bit FNV-1a, used for structural type hashes.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(13), 16);
        assert_eq!(div_up(129, 128), 2);
        assert_eq!(div_up(128, 128), 1);
    }

    #[test]
    fn test_field_access() {
        let mut buf = [0u8; 32];
        write_u32(&mut buf, 0, 0xdead_beef);
        write_u64(&mut buf, 4, u64::MAX - 1);
        write_i32(&mut buf, 12, -7);
        write_u128(&mut buf, 16, 99);
        assert_eq!(read_u32(&buf, 0), 0xdead_beef);
        assert_eq!(read_u64(&buf, 4), u64::MAX - 1);
        assert_eq!(read_i32(&buf, 12), -7);
        assert_eq!(read_u128(&buf, 16), 99);
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_panics() {
        let buf = [0u8; 3];
        read_u32(&buf, 0);
    }

    #[test]
    fn test_fnv1a_distinguishes_inputs() {
        assert_ne!(fnv1a(b"branch"), fnv1a(b"leaf"));
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
    }
}
