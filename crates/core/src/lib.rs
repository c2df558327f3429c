//! Memoria Core - identifiers, byte helpers and error types shared by the
//! Memoria storage engine crates.
//!
//! - `BlockId`, `BlockGuid`, `SnapshotId`, `CtrId`: 128-bit identifiers
//! - `bytes`: little-endian field access and alignment for packed images
//! - `Error`: error types for engine operations
//!
//! # Example
//!
//! ```rust
//! use memoria_core::{bytes, BlockId, Error};
//!
//! let id = BlockId::new(7);
//! let mut buf = [0u8; 16];
//! bytes::write_u128(&mut buf, 0, id.raw());
//! assert_eq!(BlockId::new(bytes::read_u128(&buf, 0)), id);
//!
//! let err = Error::not_found("Block", id);
//! assert!(err.to_string().contains("00000000-0000-0000-0000-000000000007"));
//! ```

#![no_std]

extern crate alloc;

pub mod bytes;
mod error;
mod ids;

pub use error::{Error, Result};
pub use ids::{BlockGuid, BlockId, CtrId, SnapshotId};
