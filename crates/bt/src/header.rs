//! Fixed-size node header and root metadata.
//!
//! ```text
//! 0   root            u8
//! 1   leaf            u8
//! 2   padding         u16
//! 4   level           i32
//! 8   parent_id       u128
//! 24  parent_idx      i32
//! 28  padding         u32
//! 32  node_type_hash  u64
//! 40  allocator region
//! ```

use memoria_core::bytes;
use memoria_core::{BlockId, CtrId};

pub const NODE_HEADER_SIZE: usize = 40;

const ROOT_OFFSET: usize = 0;
const LEAF_OFFSET: usize = 1;
const LEVEL_OFFSET: usize = 4;
const PARENT_ID_OFFSET: usize = 8;
const PARENT_IDX_OFFSET: usize = 24;
const TYPE_HASH_OFFSET: usize = 32;

/// Decoded node header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct NodeHeader {
    pub root: bool,
    pub leaf: bool,
    pub level: i32,
    pub parent_id: BlockId,
    pub parent_idx: i32,
    pub node_type_hash: u64,
}

impl NodeHeader {
    pub fn read(data: &[u8]) -> Self {
        Self {
            root: bytes::read_u8(data, ROOT_OFFSET) != 0,
            leaf: bytes::read_u8(data, LEAF_OFFSET) != 0,
            level: bytes::read_i32(data, LEVEL_OFFSET),
            parent_id: BlockId::new(bytes::read_u128(data, PARENT_ID_OFFSET)),
            parent_idx: bytes::read_i32(data, PARENT_IDX_OFFSET),
            node_type_hash: bytes::read_u64(data, TYPE_HASH_OFFSET),
        }
    }

    pub fn write(&self, data: &mut [u8]) {
        data[..NODE_HEADER_SIZE].fill(0);
        bytes::write_u8(data, ROOT_OFFSET, self.root as u8);
        bytes::write_u8(data, LEAF_OFFSET, self.leaf as u8);
        bytes::write_i32(data, LEVEL_OFFSET, self.level);
        bytes::write_u128(data, PARENT_ID_OFFSET, self.parent_id.raw());
        bytes::write_i32(data, PARENT_IDX_OFFSET, self.parent_idx);
        bytes::write_u64(data, TYPE_HASH_OFFSET, self.node_type_hash);
    }
}

/// Metadata stored in the `METADATA` slot of a container's root node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RootMetadata {
    pub ctr_id: CtrId,
    pub ctr_type_hash: u64,
    pub descriptor_hash: u64,
}

impl RootMetadata {
    pub const SIZE: usize = 32;

    pub fn read(data: &[u8]) -> Self {
        Self {
            ctr_id: CtrId::new(bytes::read_u128(data, 0)),
            ctr_type_hash: bytes::read_u64(data, 16),
            descriptor_hash: bytes::read_u64(data, 24),
        }
    }

    pub fn write(&self, data: &mut [u8]) {
        bytes::write_u128(data, 0, self.ctr_id.raw());
        bytes::write_u64(data, 16, self.ctr_type_hash);
        bytes::write_u64(data, 24, self.descriptor_hash);
    }
}
