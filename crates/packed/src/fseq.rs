//! Fixed-width packed sequence (`PkdFSeq`).
//!
//! `blocks` parallel sequences of `u64` values stored block-major without an
//! index. Sums and searches are linear scans, which is fine for the short
//! key and payload columns this structure is used for.
//!
//! ```text
//! size u32 | blocks u32 | values [blocks * size] u64
//! ```

use crate::allocator::PackedAllocator;
use crate::search::{SearchType, WalkResult};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;
use memoria_core::bytes;
use memoria_core::{Error, Result};

const SIZE_OFFSET: usize = 0;
const BLOCKS_OFFSET: usize = 4;
const HEADER_SIZE: usize = 8;
const VALUE_SIZE: usize = 8;

/// Read-only view of a fixed-width sequence region.
#[derive(Clone, Copy)]
pub struct PkdFSeq<'a> {
    data: &'a [u8],
}

impl<'a> PkdFSeq<'a> {
    /// Size of an empty region.
    pub const fn empty_size() -> usize {
        HEADER_SIZE
    }

    /// Region size holding `size` elements in each of `blocks` sequences.
    pub const fn region_size_for(blocks: usize, size: usize) -> usize {
        HEADER_SIZE + blocks * size * VALUE_SIZE
    }

    pub fn open(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn size(&self) -> usize {
        bytes::read_u32(self.data, SIZE_OFFSET) as usize
    }

    pub fn blocks(&self) -> usize {
        bytes::read_u32(self.data, BLOCKS_OFFSET) as usize
    }

    /// Bytes the region occupies.
    pub fn region_size(&self) -> usize {
        Self::region_size_for(self.blocks(), self.size())
    }

    fn offset(&self, block: usize, idx: usize) -> usize {
        HEADER_SIZE + (block * self.size() + idx) * VALUE_SIZE
    }

    pub fn value(&self, block: usize, idx: usize) -> u64 {
        assert!(
            block < self.blocks() && idx < self.size(),
            "position ({}, {}) is out of range",
            block,
            idx
        );
        bytes::read_u64(self.data, self.offset(block, idx))
    }

    /// Values of all blocks at `idx`.
    pub fn values(&self, idx: usize) -> Vec<u64> {
        (0..self.blocks()).map(|b| self.value(b, idx)).collect()
    }

    /// One block's values.
    pub fn column(&self, block: usize) -> Vec<u64> {
        (0..self.size()).map(|i| self.value(block, i)).collect()
    }

    pub fn iter(&self, block: usize) -> impl Iterator<Item = u64> + '_ {
        (0..self.size()).map(move |i| self.value(block, i))
    }

    pub fn sum(&self, block: usize, start: usize, end: usize) -> u64 {
        assert!(start <= end && end <= self.size(), "range {}..{} is out of range", start, end);
        (start..end).map(|i| self.value(block, i)).sum()
    }

    pub fn block_sum(&self, block: usize) -> u64 {
        self.sum(block, 0, self.size())
    }

    pub fn sums(&self) -> Vec<u64> {
        (0..self.blocks()).map(|b| self.block_sum(b)).collect()
    }

    /// Forward search from `start`; same result conventions as the dense
    /// tree.
    pub fn find_fw(&self, block: usize, start: usize, target: u64, ty: SearchType) -> WalkResult {
        let size = self.size();
        assert!(start <= size, "search start {} is out of range", start);
        let mut sum = 0u64;
        for idx in start..size {
            let value = self.value(block, idx);
            if ty.matches(sum + value, target) {
                return WalkResult::new(idx, sum);
            }
            sum += value;
        }
        WalkResult::new(size, sum)
    }

    /// Backward search from `start` down to 0.
    pub fn find_bw(&self, block: usize, start: usize, target: u64, ty: SearchType) -> WalkResult {
        let size = self.size();
        if size == 0 {
            return WalkResult::new(0, 0);
        }
        assert!(start < size, "search start {} is out of range", start);
        let mut sum = 0u64;
        for idx in (0..=start).rev() {
            let value = self.value(block, idx);
            if ty.matches(sum + value, target) {
                return WalkResult::new(idx, sum);
            }
            sum += value;
        }
        WalkResult::new(size, sum)
    }

    pub fn find_ge(&self, block: usize, target: u64) -> WalkResult {
        self.find_fw(block, 0, target, SearchType::Ge)
    }

    pub fn find_gt(&self, block: usize, target: u64) -> WalkResult {
        self.find_fw(block, 0, target, SearchType::Gt)
    }

    /// Bytes an insert of one row would add to the region.
    pub fn insert_delta(&self, _values: &[u64]) -> usize {
        self.blocks() * VALUE_SIZE
    }

    pub fn check(&self) -> Result<()> {
        if self.data.len() < HEADER_SIZE {
            return Err(Error::corrupted("sequence region is shorter than its header"));
        }
        if self.blocks() == 0 {
            return Err(Error::corrupted("sequence has zero blocks"));
        }
        if self.region_size() > self.data.len() {
            return Err(Error::corrupted(format!(
                "sequence of {} x {} needs {} bytes, stream has {}",
                self.blocks(),
                self.size(),
                self.region_size(),
                self.data.len()
            )));
        }
        Ok(())
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "PkdFSeq size={} blocks={}", self.size(), self.blocks());
        for block in 0..self.blocks() {
            let _ = writeln!(out, "  block {}: {:?}", block, self.column(block));
        }
        out
    }
}

/// Mutable view of a fixed-width sequence in one allocator stream.
pub struct PkdFSeqMut<'a, B> {
    alloc: &'a mut PackedAllocator<B>,
    stream: usize,
}

impl<'a, B: AsRef<[u8]> + AsMut<[u8]>> PkdFSeqMut<'a, B> {
    pub fn init(alloc: &'a mut PackedAllocator<B>, stream: usize, blocks: usize) -> Result<Self> {
        if blocks == 0 {
            return Err(Error::invalid_operation("sequence needs at least one block"));
        }
        alloc.allocate_empty(stream, PkdFSeq::empty_size())?;
        bytes::write_u32(alloc.element_mut(stream), BLOCKS_OFFSET, blocks as u32);
        Ok(Self { alloc, stream })
    }

    pub fn open(alloc: &'a mut PackedAllocator<B>, stream: usize) -> Self {
        Self { alloc, stream }
    }

    pub fn seq(&self) -> PkdFSeq<'_> {
        PkdFSeq::open(self.alloc.element(self.stream))
    }

    pub fn size(&self) -> usize {
        self.seq().size()
    }

    pub fn blocks(&self) -> usize {
        self.seq().blocks()
    }

    fn columns(&self) -> Vec<Vec<u64>> {
        let seq = self.seq();
        (0..seq.blocks()).map(|b| seq.column(b)).collect()
    }

    /// Rewrites the region from per-block columns of equal length.
    fn write(&mut self, columns: &[Vec<u64>]) -> Result<()> {
        let blocks = columns.len();
        let size = columns.first().map_or(0, Vec::len);
        self.alloc
            .resize_block(self.stream, PkdFSeq::region_size_for(blocks, size))?;
        let data = self.alloc.element_mut(self.stream);
        data.fill(0);
        bytes::write_u32(data, SIZE_OFFSET, size as u32);
        bytes::write_u32(data, BLOCKS_OFFSET, blocks as u32);
        for (block, column) in columns.iter().enumerate() {
            for (idx, &value) in column.iter().enumerate() {
                bytes::write_u64(data, HEADER_SIZE + (block * size + idx) * VALUE_SIZE, value);
            }
        }
        Ok(())
    }

    fn check_row(&self, values: &[u64]) -> Result<()> {
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
        if start > end || end > self.size() {
            return Err(Error::invalid_operation(format!(
                "range {}..{} is out of bounds for size {}",
                start,
                end,
                self.size()
            )));
        }
        Ok(())
    }

    pub fn check_capacity(&self, values: &[u64]) -> bool {
        self.seq().insert_delta(values) <= self.alloc.free_space()
    }

    pub fn insert_delta(&self, values: &[u64]) -> usize {
        self.seq().insert_delta(values)
    }

    pub fn insert(&mut self, idx: usize, values: &[u64]) -> Result<()> {
        self.check_row(values)?;
        self.insert_many(idx, 1, |block, _| values[block])
    }

    pub fn append(&mut self, values: &[u64]) -> Result<()> {
        let size = self.size();
        self.insert(size, values)
    }

    pub fn insert_many<F>(&mut self, idx: usize, count: usize, mut provider: F) -> Result<()>
    where
        F: FnMut(usize, usize) -> u64,
    {
        self.check_range(idx, idx)?;
        let mut columns = self.columns();
        for (block, column) in columns.iter_mut().enumerate() {
            let new: Vec<u64> = (0..count).map(|i| provider(block, i)).collect();
            column.splice(idx..idx, new);
        }
        self.write(&columns)
    }

    pub fn remove(&mut self, start: usize, end: usize) -> Result<()> {
        self.check_range(start, end)?;
        let mut columns = self.columns();
        for column in columns.iter_mut() {
            column.drain(start..end);
        }
        self.write(&columns)
    }

    pub fn update_value(&mut self, block: usize, idx: usize, value: u64) -> Result<()> {
        if block >= self.blocks() || idx >= self.size() {
            return Err(Error::invalid_operation(format!(
                "position ({}, {}) is out of range",
                block, idx
            )));
        }
        let size = self.size();
        let data = self.alloc.element_mut(self.stream);
        bytes::write_u64(data, HEADER_SIZE + (block * size + idx) * VALUE_SIZE, value);
        Ok(())
    }

    pub fn update_values(&mut self, idx: usize, values: &[u64]) -> Result<()> {
        self.check_row(values)?;
        if idx >= self.size() {
            return Err(Error::invalid_operation(format!("index {} is out of range", idx)));
        }
        for (block, &value) in values.iter().enumerate() {
            self.update_value(block, idx, value)?;
        }
        Ok(())
    }

    pub fn add_value(&mut self, block: usize, idx: usize, delta: i64) -> Result<()> {
        if block >= self.blocks() || idx >= self.size() {
            return Err(Error::invalid_operation(format!(
                "position ({}, {}) is out of range",
                block, idx
            )));
        }
        let current = self.seq().value(block, idx);
        let value = current.checked_add_signed(delta).ok_or_else(|| {
            Error::invalid_operation(format!("value {} cannot absorb delta {}", current, delta))
        })?;
        self.update_value(block, idx, value)
    }

    fn check_same_blocks<B2>(&self, other: &PkdFSeqMut<'_, B2>) -> Result<()>
    where
        B2: AsRef<[u8]> + AsMut<[u8]>,
    {
        if self.blocks() != other.blocks() {
            return Err(Error::invalid_operation(format!(
                "sequences differ in blocks: {} vs {}",
                self.blocks(),
                other.blocks()
            )));
        }
        Ok(())
    }

    /// Moves `[idx, size)` of every block to the front of `other`.
    pub fn split_to<B2>(&mut self, other: &mut PkdFSeqMut<'_, B2>, idx: usize) -> Result<()>
    where
        B2: AsRef<[u8]> + AsMut<[u8]>,
    {
        self.check_same_blocks(other)?;
        let size = self.size();
        self.check_range(idx, size)?;
        let tail: Vec<Vec<u64>> = self.columns().into_iter().map(|c| c[idx..].to_vec()).collect();
        other.insert_many(0, size - idx, |block, i| tail[block][i])?;
        self.remove(idx, size)
    }

    /// Appends `other`'s elements after this sequence's and empties `other`.
    pub fn merge_with<B2>(&mut self, other: &mut PkdFSeqMut<'_, B2>) -> Result<()>
    where
        B2: AsRef<[u8]> + AsMut<[u8]>,
    {
        self.check_same_blocks(other)?;
        let incoming = other.columns();
        let count = other.size();
        let size = self.size();
        self.insert_many(size, count, |block, i| incoming[block][i])?;
        other.clear()
    }

    /// Copies `[from, from + count)` into `other` at `to`.
    pub fn copy_to<B2>(
        &self,
        other: &mut PkdFSeqMut<'_, B2>,
        from: usize,
        count: usize,
        to: usize,
    ) -> Result<()>
    where
        B2: AsRef<[u8]> + AsMut<[u8]>,
    {
        self.check_same_blocks(other)?;
        self.check_range(from, from + count)?;
        let seq = self.seq();
        other.insert_many(to, count, |block, i| seq.value(block, from + i))
    }

    pub fn clear(&mut self) -> Result<()> {
        let blocks = self.blocks();
        self.write(&alloc::vec![Vec::new(); blocks])
    }

    /// Fixed-width sequences carry no index.
    pub fn reindex(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn alloc() -> PackedAllocator<Vec<u8>> {
        PackedAllocator::new(4096, 1).unwrap()
    }

    #[test]
    fn test_insert_and_sums() {
        let mut a = alloc();
        let mut seq = PkdFSeqMut::init(&mut a, 0, 2).unwrap();
        seq.append(&[5, 50]).unwrap();
        seq.append(&[3, 30]).unwrap();
        seq.insert(1, &[8, 80]).unwrap();
        let view = seq.seq();
        assert_eq!(view.column(0), vec![5, 8, 3]);
        assert_eq!(view.sums(), vec![16, 160]);
        assert_eq!(view.find_ge(0, 13), WalkResult::new(1, 5));
        assert_eq!(view.find_gt(0, 16), WalkResult::new(3, 16));
        view.check().unwrap();
    }

    #[test]
    fn test_backward_search() {
        let mut a = alloc();
        let mut seq = PkdFSeqMut::init(&mut a, 0, 1).unwrap();
        for v in [5u64, 3, 8, 1] {
            seq.append(&[v]).unwrap();
        }
        let view = seq.seq();
        assert_eq!(view.find_bw(0, 3, 9, SearchType::Ge), WalkResult::new(2, 1));
        assert_eq!(view.find_bw(0, 3, 100, SearchType::Ge), WalkResult::new(4, 17));
    }

    #[test]
    fn test_update_and_add() {
        let mut a = alloc();
        let mut seq = PkdFSeqMut::init(&mut a, 0, 1).unwrap();
        seq.append(&[10]).unwrap();
        seq.update_values(0, &[20]).unwrap();
        seq.add_value(0, 0, -5).unwrap();
        assert_eq!(seq.seq().value(0, 0), 15);
        assert!(seq.add_value(0, 0, -16).is_err());
        assert!(seq.update_value(0, 1, 1).is_err());
    }

    #[test]
    fn test_split_merge_restores() {
        let mut a = alloc();
        let mut b = alloc();
        let mut left = PkdFSeqMut::init(&mut a, 0, 2).unwrap();
        let mut right = PkdFSeqMut::init(&mut b, 0, 2).unwrap();
        for i in 0..10u64 {
            left.append(&[i, i * 2]).unwrap();
        }
        let before = left.columns();
        left.split_to(&mut right, 4).unwrap();
        assert_eq!(left.size(), 4);
        assert_eq!(right.seq().column(0), vec![4, 5, 6, 7, 8, 9]);
        left.merge_with(&mut right).unwrap();
        assert_eq!(left.columns(), before);
        assert_eq!(right.size(), 0);
    }

    #[test]
    fn test_copy_to_and_remove() {
        let mut a = alloc();
        let mut b = alloc();
        let mut src = PkdFSeqMut::init(&mut a, 0, 1).unwrap();
        let mut dst = PkdFSeqMut::init(&mut b, 0, 1).unwrap();
        for v in [1u64, 2, 3, 4] {
            src.append(&[v]).unwrap();
        }
        src.copy_to(&mut dst, 1, 2, 0).unwrap();
        assert_eq!(dst.seq().column(0), vec![2, 3]);
        src.remove(0, 3).unwrap();
        assert_eq!(src.seq().column(0), vec![4]);
    }

    #[test]
    fn test_capacity_failure_is_atomic() {
        let mut a = PackedAllocator::new(64, 1).unwrap();
        let mut seq = PkdFSeqMut::init(&mut a, 0, 2).unwrap();
        while seq.check_capacity(&[1, 1]) {
            seq.append(&[1, 1]).unwrap();
        }
        let before = seq.columns();
        assert!(seq.append(&[2, 2]).unwrap_err().is_capacity());
        assert_eq!(seq.columns(), before);
    }
}
