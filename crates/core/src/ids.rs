//! Identifier types.
//!
//! All identifiers are 128-bit values displayed in UUID grouping. The
//! store generates them randomly; the packed and node layers only copy
//! them around as opaque little-endian bytes.

use core::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u128);

        impl $name {
            /// The nil identifier.
            pub const NIL: $name = $name(0);

            /// Size of the identifier in its byte encoding.
            pub const BYTES: usize = 16;

            /// Creates an identifier from its raw value.
            pub const fn new(raw: u128) -> Self {
                $name(raw)
            }

            /// Returns the raw value.
            pub const fn raw(self) -> u128 {
                self.0
            }

            /// Returns true for the nil identifier.
            pub const fn is_nil(self) -> bool {
                self.0 == 0
            }

            /// Splits the identifier into (high, low) 64-bit halves.
            pub const fn split(self) -> (u64, u64) {
                ((self.0 >> 64) as u64, self.0 as u64)
            }

            /// Joins (high, low) 64-bit halves into an identifier.
            pub const fn join(hi: u64, lo: u64) -> Self {
                $name(((hi as u128) << 64) | lo as u128)
            }

            /// Little-endian byte encoding.
            pub fn to_le_bytes(self) -> [u8; 16] {
                self.0.to_le_bytes()
            }

            /// Decodes from little-endian bytes.
            pub fn from_le_bytes(bytes: [u8; 16]) -> Self {
                $name(u128::from_le_bytes(bytes))
            }
        }

        impl From<u128> for $name {
            fn from(raw: u128) -> Self {
                $name(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt_uuid(self.0, f)
            }
        }
    };
}

define_id!(
    /// Identity of a block. Stable across copy-on-write clones.
    BlockId
);

define_id!(
    /// Version tag of a block. Every copy-on-write clone gets a new one.
    BlockGuid
);

define_id!(
    /// Identity of a snapshot (one version of the store).
    SnapshotId
);

define_id!(
    /// Identity of a container inside a snapshot.
    CtrId
);

fn fmt_uuid(raw: u128, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let b = raw.to_be_bytes();
    for (i, byte) in b.iter().enumerate() {
        if i == 4 || i == 6 || i == 8 || i == 10 {
            f.write_str("-")?;
        }
        write!(f, "{:02x}", byte)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_display_uuid_grouping() {
        let id = BlockId::new(0x0011_2233_4455_6677_8899_aabb_ccdd_eeff);
        assert_eq!(id.to_string(), "00112233-4455-6677-8899-aabbccddeeff");
        assert_eq!(
            SnapshotId::NIL.to_string(),
            "00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_split_join() {
        let id = CtrId::new(0xdead_beef_0000_0001_0000_0002_0000_0003);
        let (hi, lo) = id.split();
        assert_eq!(CtrId::join(hi, lo), id);
        assert!(CtrId::NIL.is_nil());
        assert!(!id.is_nil());
    }

    #[test]
    fn test_le_bytes() {
        let id = BlockGuid::new(12345);
        assert_eq!(BlockGuid::from_le_bytes(id.to_le_bytes()), id);
    }
}
