//! Mutating view of a dense tree.
//!
//! Every structural change is expressed as a list of byte edits over the
//! encoded values. The new region size is computed up front and the stream
//! is resized through the allocator before any byte of the tree changes, so
//! a capacity failure leaves the tree untouched.

use super::index::{
    build_index, write_index, RegionLayout, BLOCKS_OFFSET, DATA_SIZE_OFFSET, INDEX_SIZE_OFFSET,
    SIZE_OFFSET,
};
use super::PkdVDTree;
use crate::allocator::PackedAllocator;
use crate::codec::{Codec, VarintCodec};
use alloc::format;
use alloc::vec;
use alloc::vec::Vec;
use core::marker::PhantomData;
use memoria_core::bytes;
use memoria_core::{Error, Result};

/// Replace `remove` bytes at `pos` (in old coordinates) with `bytes`.
struct Edit {
    pos: usize,
    remove: usize,
    bytes: Vec<u8>,
}

/// Mutable view of a dense tree living in one allocator stream.
pub struct PkdVDTreeMut<'a, B, C = VarintCodec> {
    alloc: &'a mut PackedAllocator<B>,
    stream: usize,
    _codec: PhantomData<C>,
}

impl<'a, B, C> PkdVDTreeMut<'a, B, C>
where
    B: AsRef<[u8]> + AsMut<[u8]>,
    C: Codec,
{
    /// Allocates an empty tree with `blocks` sequences in `stream`.
    pub fn init(alloc: &'a mut PackedAllocator<B>, stream: usize, blocks: usize) -> Result<Self> {
        if blocks == 0 {
            return Err(Error::invalid_operation("dense tree needs at least one block"));
        }
        alloc.allocate_empty(stream, PkdVDTree::<C>::empty_size())?;
        let data = alloc.element_mut(stream);
        bytes::write_u32(data, BLOCKS_OFFSET, blocks as u32);
        Ok(Self::open(alloc, stream))
    }

    /// Opens the tree already allocated in `stream`.
    pub fn open(alloc: &'a mut PackedAllocator<B>, stream: usize) -> Self {
        Self {
            alloc,
            stream,
            _codec: PhantomData,
        }
    }

    /// Read-only view of the current state.
    pub fn tree(&self) -> PkdVDTree<'_, C> {
        PkdVDTree::open(self.alloc.element(self.stream))
    }

    /// Number of elements in every block.
    pub fn size(&self) -> usize {
        self.tree().size()
    }

    /// Number of parallel sequences.
    pub fn blocks(&self) -> usize {
        self.tree().blocks()
    }

    /// Bytes an insert of `values` (one per block) would need.
    pub fn insert_delta(&self, values: &[u64]) -> usize {
        self.tree().insert_delta(values)
    }

    /// Returns true if one row of `values` fits into the allocator.
    pub fn check_capacity(&self, values: &[u64]) -> bool {
        self.insert_delta(values) <= self.alloc.free_space()
    }

    fn encode_all(values: impl Iterator<Item = u64>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        for value in values {
            let len = C::encode(&mut buf, 0, value);
            out.extend_from_slice(&buf[..len]);
        }
        out
    }

    /// Applies sorted, non-overlapping edits and rewrites the region.
    fn splice(&mut self, new_size: usize, edits: Vec<Edit>) -> Result<()> {
        let values = {
            let tree = self.tree();
            let old = tree.values_bytes();
            let added: usize = edits.iter().map(|e| e.bytes.len()).sum();
            let mut values = Vec::with_capacity(old.len() + added);
            let mut cursor = 0;
            for edit in &edits {
                debug_assert!(edit.pos >= cursor, "edits must be sorted");
                values.extend_from_slice(&old[cursor..edit.pos]);
                values.extend_from_slice(&edit.bytes);
                cursor = edit.pos + edit.remove;
            }
            values.extend_from_slice(&old[cursor..]);
            values
        };
        self.write(new_size, &values)
    }

    /// Replaces the whole content with `values` (already encoded) holding
    /// `size` elements per block, then rebuilds the index.
    fn write(&mut self, size: usize, values: &[u8]) -> Result<()> {
        let blocks = self.blocks();
        let layout = RegionLayout::new(values.len());
        self.alloc.resize_block(self.stream, layout.region_size())?;

        let index = build_index::<C>(values, &layout.geometry);
        debug_assert_eq!(index.elements, size * blocks);

        let data = self.alloc.element_mut(self.stream);
        data.fill(0);
        bytes::write_u32(data, SIZE_OFFSET, size as u32);
        bytes::write_u32(data, DATA_SIZE_OFFSET, values.len() as u32);
        bytes::write_u32(data, BLOCKS_OFFSET, blocks as u32);
        bytes::write_u32(data, INDEX_SIZE_OFFSET, layout.geometry.index_size() as u32);
        data[layout.values..layout.values + values.len()].copy_from_slice(values);
        write_index(data, &layout, &index);
        Ok(())
    }

    /// Rebuilds the index from the encoded values.
    pub fn reindex(&mut self) {
        let (layout, index) = {
            let tree = self.tree();
            let layout = RegionLayout::new(tree.data_size());
            let index = build_index::<C>(tree.values_bytes(), &layout.geometry);
            (layout, index)
        };
        let data = self.alloc.element_mut(self.stream);
        bytes::write_u32(data, INDEX_SIZE_OFFSET, layout.geometry.index_size() as u32);
        write_index(data, &layout, &index);
    }

    fn check_values(&self, values: &[u64]) -> Result<()> {
        if values.len() != self.blocks() {
            return Err(Error::invalid_operation(format!(
                "expected {} values, got {}",
                self.blocks(),
                values.len()
            )));
        }
        Ok(())
    }

    fn check_range(&self, start: usize, end: usize) -> Result<()> {
        let size = self.size();
        if start > end || end > size {
            return Err(Error::invalid_operation(format!(
                "range {}..{} is out of bounds for size {}",
                start, end, size
            )));
        }
        Ok(())
    }

    /// Inserts one value per block at `idx`.
    pub fn insert(&mut self, idx: usize, values: &[u64]) -> Result<()> {
        self.check_values(values)?;
        self.insert_many(idx, 1, |block, _| values[block])
    }

    /// Appends one value per block.
    pub fn append(&mut self, values: &[u64]) -> Result<()> {
        let size = self.size();
        self.insert(size, values)
    }

    /// Inserts `count` elements at `idx` into every block; `provider(block,
    /// i)` yields the i-th new value of a block.
    pub fn insert_many<F>(&mut self, idx: usize, count: usize, mut provider: F) -> Result<()>
    where
        F: FnMut(usize, usize) -> u64,
    {
        self.check_range(idx, idx)?;
        if count == 0 {
            return Ok(());
        }

        let edits = {
            let tree = self.tree();
            let size = tree.size();
            (0..tree.blocks())
                .map(|block| Edit {
                    pos: tree.locate(block * size + idx),
                    remove: 0,
                    bytes: Self::encode_all((0..count).map(|i| provider(block, i))),
                })
                .collect::<Vec<_>>()
        };
        let new_size = self.size() + count;
        self.splice(new_size, edits)
    }

    /// Removes `[start, end)` from every block.
    pub fn remove(&mut self, start: usize, end: usize) -> Result<()> {
        self.check_range(start, end)?;
        if start == end {
            return Ok(());
        }

        let edits = {
            let tree = self.tree();
            let size = tree.size();
            (0..tree.blocks())
                .map(|block| {
                    let from = tree.locate(block * size + start);
                    let to = tree.locate(block * size + end);
                    Edit {
                        pos: from,
                        remove: to - from,
                        bytes: Vec::new(),
                    }
                })
                .collect::<Vec<_>>()
        };
        let new_size = self.size() - (end - start);
        self.splice(new_size, edits)
    }

    fn replace_edit(tree: &PkdVDTree<'_, C>, block: usize, idx: usize, value: u64) -> Edit {
        let pos = tree.locate(block * tree.size() + idx);
        let (_, len) = C::decode(tree.values_bytes(), pos, tree.data_size());
        Edit {
            pos,
            remove: len,
            bytes: Self::encode_all(core::iter::once(value)),
        }
    }

    /// Replaces the value at `(block, idx)`.
    pub fn update_value(&mut self, block: usize, idx: usize, value: u64) -> Result<()> {
        if block >= self.blocks() || idx >= self.size() {
            return Err(Error::invalid_operation(format!(
                "position ({}, {}) is out of range",
                block, idx
            )));
        }
        let edit = Self::replace_edit(&self.tree(), block, idx, value);
        let size = self.size();
        self.splice(size, vec![edit])
    }

    /// Replaces the values of every block at `idx`.
    pub fn update_values(&mut self, idx: usize, values: &[u64]) -> Result<()> {
        self.check_values(values)?;
        if idx >= self.size() {
            return Err(Error::invalid_operation(format!("index {} is out of range", idx)));
        }
        let edits = {
            let tree = self.tree();
            (0..tree.blocks())
                .map(|block| Self::replace_edit(&tree, block, idx, values[block]))
                .collect::<Vec<_>>()
        };
        let size = self.size();
        self.splice(size, edits)
    }

    /// Adds a signed delta to the value at `(block, idx)`.
    pub fn add_value(&mut self, block: usize, idx: usize, delta: i64) -> Result<()> {
        if block >= self.blocks() || idx >= self.size() {
            return Err(Error::invalid_operation(format!(
                "position ({}, {}) is out of range",
                block, idx
            )));
        }
        let current = self.tree().value(block, idx);
        let value = current.checked_add_signed(delta).ok_or_else(|| {
            Error::invalid_operation(format!("value {} cannot absorb delta {}", current, delta))
        })?;
        self.update_value(block, idx, value)
    }

    /// Encoded bytes of `[start, end)` of every block.
    fn segments(&self, start: usize, end: usize) -> Vec<Vec<u8>> {
        let tree = self.tree();
        let size = tree.size();
        let values = tree.values_bytes();
        (0..tree.blocks())
            .map(|block| {
                let from = tree.locate(block * size + start);
                let to = tree.locate(block * size + end);
                values[from..to].to_vec()
            })
            .collect()
    }

    /// Inserts pre-encoded per-block segments holding `count` elements each
    /// at position `idx`.
    fn insert_segments(&mut self, idx: usize, count: usize, segments: Vec<Vec<u8>>) -> Result<()> {
        let edits = {
            let tree = self.tree();
            let size = tree.size();
            segments
                .into_iter()
                .enumerate()
                .map(|(block, bytes)| Edit {
                    pos: tree.locate(block * size + idx),
                    remove: 0,
                    bytes,
                })
                .collect::<Vec<_>>()
        };
        let new_size = self.size() + count;
        self.splice(new_size, edits)
    }

    fn check_same_blocks<B2>(&self, other: &PkdVDTreeMut<'_, B2, C>) -> Result<()>
    where
        B2: AsRef<[u8]> + AsMut<[u8]>,
    {
        if self.blocks() != other.blocks() {
            return Err(Error::invalid_operation(format!(
                "dense trees differ in blocks: {} vs {}",
                self.blocks(),
                other.blocks()
            )));
        }
        Ok(())
    }

    /// Moves `[idx, size)` of every block to the front of `other`'s blocks.
    pub fn split_to<B2>(&mut self, other: &mut PkdVDTreeMut<'_, B2, C>, idx: usize) -> Result<()>
    where
        B2: AsRef<[u8]> + AsMut<[u8]>,
    {
        self.check_same_blocks(other)?;
        let size = self.size();
        self.check_range(idx, size)?;

        let segments = self.segments(idx, size);
        other.insert_segments(0, size - idx, segments)?;
        self.remove(idx, size)
    }

    /// Appends all of `other`'s elements after this tree's, block by block,
    /// and empties `other`.
    pub fn merge_with<B2>(&mut self, other: &mut PkdVDTreeMut<'_, B2, C>) -> Result<()>
    where
        B2: AsRef<[u8]> + AsMut<[u8]>,
    {
        self.check_same_blocks(other)?;
        let other_size = other.size();
        if other_size == 0 {
            return Ok(());
        }
        let segments = other.segments(0, other_size);
        let size = self.size();
        self.insert_segments(size, other_size, segments)?;
        other.clear()
    }

    /// Copies `[from, from + count)` of every block into `other` at `to`.
    pub fn copy_to<B2>(
        &self,
        other: &mut PkdVDTreeMut<'_, B2, C>,
        from: usize,
        count: usize,
        to: usize,
    ) -> Result<()>
    where
        B2: AsRef<[u8]> + AsMut<[u8]>,
    {
        self.check_same_blocks(other)?;
        self.check_range(from, from + count)?;
        other.check_range(to, to)?;
        let segments = self.segments(from, from + count);
        other.insert_segments(to, count, segments)
    }

    /// Removes every element.
    pub fn clear(&mut self) -> Result<()> {
        self.write(0, &[])
    }
}
