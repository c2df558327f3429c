//! Variable-length-encoded dense tree (`PkdVDTree`).
//!
//! A dense tree stores `blocks` parallel sequences of `u64` values that all
//! share one logical size. Values are encoded back to back with a [`Codec`]
//! into a single byte region, block 0's values first, then block 1's, and
//! so on, so element `(block, idx)` is global element `block * size + idx`.
//!
//! A multi-level index over fixed [`WINDOW_BYTES`] windows of the encoded
//! bytes keeps element counts and value sums, which makes positional access,
//! prefix sums and threshold searches logarithmic plus one window scan.
//!
//! # Layout
//!
//! ```text
//! size u32 | data_size u32 | blocks u32 | index_size u32
//! VALUE_INDEX [index_size] u64
//! SIZE_INDEX  [index_size] u32
//! OFFSETS     [windows]    u32
//! VALUES      [data_size]  u8, padded to 8
//! ```
//!
//! Index levels are stored root first. A leaf cell covers the elements whose
//! first byte lies in its window; `OFFSETS` holds the offset of the first
//! such element inside the window.

mod index;
mod update;

pub use index::{INDEX_BRANCHING, WINDOW_BYTES};
pub use update::PkdVDTreeMut;

use crate::codec::{Codec, VarintCodec};
use crate::search::{SearchType, WalkResult};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;
use core::marker::PhantomData;
use index::{
    build_index, read_index, RegionLayout, BLOCKS_OFFSET, DATA_SIZE_OFFSET, HEADER_SIZE,
    INDEX_SIZE_OFFSET, SIZE_OFFSET,
};
use memoria_core::bytes;
use memoria_core::{Error, Result};

/// Read-only view of a dense tree region.
pub struct PkdVDTree<'a, C = VarintCodec> {
    data: &'a [u8],
    layout: RegionLayout,
    _codec: PhantomData<C>,
}

/// Positioning criterion for an index descent.
#[derive(Clone, Copy, Debug)]
enum Seek {
    Element(usize),
    Sum(u64, SearchType),
}

impl Seek {
    fn enter(self, elements: usize, sum: u64, cell_size: usize, cell_sum: u64) -> bool {
        match self {
            Seek::Element(g) => elements + cell_size > g,
            Seek::Sum(target, ty) => ty.matches(sum + cell_sum, target),
        }
    }
}

/// A descent stop: byte position of the first element of a window plus the
/// number and sum of all elements before it.
#[derive(Clone, Copy, Debug)]
struct Point {
    pos: usize,
    elements: usize,
    sum: u64,
}

impl<'a, C: Codec> PkdVDTree<'a, C> {
    /// Size of an empty dense tree region.
    pub fn empty_size() -> usize {
        index::region_size(0)
    }

    /// Region size needed to hold `data_size` encoded bytes.
    pub fn region_size_for(data_size: usize) -> usize {
        index::region_size(data_size)
    }

    /// Opens a view over a dense tree region.
    pub fn open(data: &'a [u8]) -> Self {
        let data_size = bytes::read_u32(data, DATA_SIZE_OFFSET) as usize;
        Self {
            data,
            layout: RegionLayout::new(data_size),
            _codec: PhantomData,
        }
    }

    /// Number of elements in every block.
    pub fn size(&self) -> usize {
        bytes::read_u32(self.data, SIZE_OFFSET) as usize
    }

    /// Number of parallel sequences.
    pub fn blocks(&self) -> usize {
        bytes::read_u32(self.data, BLOCKS_OFFSET) as usize
    }

    /// Encoded length of all values.
    pub fn data_size(&self) -> usize {
        self.layout.data_size
    }

    /// Number of index cells over all levels.
    pub fn index_size(&self) -> usize {
        bytes::read_u32(self.data, INDEX_SIZE_OFFSET) as usize
    }

    /// Number of levels in the index (0 when there is no index).
    pub fn index_depth(&self) -> usize {
        self.layout.geometry.depth()
    }

    /// Bytes the region occupies.
    pub fn region_size(&self) -> usize {
        self.layout.region_size()
    }

    /// Total element count across all blocks.
    fn total(&self) -> usize {
        self.size() * self.blocks()
    }

    /// The encoded values.
    pub fn values_bytes(&self) -> &'a [u8] {
        let start = self.layout.values;
        &self.data[start..start + self.layout.data_size]
    }

    fn decode(&self, pos: usize) -> (u64, usize) {
        C::decode(self.values_bytes(), pos, self.layout.data_size)
    }

    /// Descends the index to the window where `seek` stops.
    ///
    /// Returns `None` when the whole tree does not satisfy `seek`.
    fn descend(&self, seek: Seek) -> Option<Point> {
        let geometry = &self.layout.geometry;
        if !geometry.has_index() {
            return Some(Point {
                pos: 0,
                elements: 0,
                sum: 0,
            });
        }

        let data = self.data;
        let (mut elements, mut sum) = (0usize, 0u64);
        if !seek.enter(0, 0, self.layout.cell_size(data, 0), self.layout.cell_sum(data, 0)) {
            return None;
        }

        let mut cell = 0;
        for level in 1..geometry.depth() {
            let start = geometry.level_start(level);
            let first = cell * INDEX_BRANCHING;
            let last = (first + INDEX_BRANCHING).min(geometry.level_size(level));

            let mut chosen = None;
            for child in first..last {
                let cell_size = self.layout.cell_size(data, start + child);
                let cell_sum = self.layout.cell_sum(data, start + child);
                if seek.enter(elements, sum, cell_size, cell_sum) {
                    chosen = Some(child);
                    break;
                }
                elements += cell_size;
                sum += cell_sum;
            }
            cell = chosen?;
        }

        let window = cell;
        Some(Point {
            pos: window * WINDOW_BYTES + self.layout.window_offset(data, window),
            elements,
            sum,
        })
    }

    /// Byte position of global element `g`; `data_size` for `g == total`.
    pub(crate) fn locate(&self, g: usize) -> usize {
        let total = self.total();
        assert!(g <= total, "element {} is out of range 0..={}", g, total);
        if g == total {
            return self.layout.data_size;
        }

        let Some(point) = self.descend(Seek::Element(g)) else {
            return self.layout.data_size;
        };
        let mut pos = point.pos;
        for _ in point.elements..g {
            pos += self.decode(pos).1;
        }
        pos
    }

    /// Sum of global elements `[0, g)`.
    pub(crate) fn prefix(&self, g: usize) -> u64 {
        let total = self.total();
        assert!(g <= total, "element {} is out of range 0..={}", g, total);
        if g == 0 {
            return 0;
        }
        if g == total && self.layout.geometry.has_index() {
            return self.layout.cell_sum(self.data, 0);
        }

        let point = match self.descend(Seek::Element(g.min(total - 1))) {
            Some(point) => point,
            None => return 0,
        };
        let mut pos = point.pos;
        let mut sum = point.sum;
        for _ in point.elements..g {
            let (value, len) = self.decode(pos);
            sum += value;
            pos += len;
        }
        sum
    }

    /// First global element where the running sum meets `target`, with the
    /// sum of the elements before it.
    fn seek_sum(&self, target: u64, ty: SearchType) -> Option<(usize, u64)> {
        let point = self.descend(Seek::Sum(target, ty))?;
        let (mut pos, mut elements, mut sum) = (point.pos, point.elements, point.sum);
        while pos < self.layout.data_size {
            let (value, len) = self.decode(pos);
            if ty.matches(sum + value, target) {
                return Some((elements, sum));
            }
            sum += value;
            elements += 1;
            pos += len;
        }
        None
    }

    fn check_position(&self, block: usize, idx: usize) {
        assert!(
            block < self.blocks() && idx < self.size(),
            "position ({}, {}) is out of range ({} blocks, size {})",
            block,
            idx,
            self.blocks(),
            self.size()
        );
    }

    /// Decodes the element at `(block, idx)`.
    pub fn value(&self, block: usize, idx: usize) -> u64 {
        self.check_position(block, idx);
        let pos = self.locate(block * self.size() + idx);
        self.decode(pos).0
    }

    /// Values of all blocks at position `idx`.
    pub fn values(&self, idx: usize) -> Vec<u64> {
        (0..self.blocks()).map(|b| self.value(b, idx)).collect()
    }

    /// Iterates over one block's values.
    pub fn iter(&self, block: usize) -> ValueIter<'_, 'a, C> {
        assert!(block < self.blocks(), "block {} is out of range", block);
        let size = self.size();
        ValueIter {
            tree: self,
            pos: self.locate(block * size),
            remaining: size,
        }
    }

    /// Sum of `[start, end)` in one block.
    pub fn sum(&self, block: usize, start: usize, end: usize) -> u64 {
        let size = self.size();
        assert!(
            block < self.blocks() && start <= end && end <= size,
            "range {}..{} of block {} is out of range",
            start,
            end,
            block
        );
        let base = block * size;
        self.prefix(base + end) - self.prefix(base + start)
    }

    /// Sum of a whole block.
    pub fn block_sum(&self, block: usize) -> u64 {
        self.sum(block, 0, self.size())
    }

    /// Sums of every block.
    pub fn sums(&self) -> Vec<u64> {
        (0..self.blocks()).map(|b| self.block_sum(b)).collect()
    }

    /// Forward search from position 0 for `sum >= target`.
    pub fn find_ge(&self, block: usize, target: u64) -> WalkResult {
        self.find_fw(block, 0, target, SearchType::Ge)
    }

    /// Forward search from position 0 for `sum > target`.
    pub fn find_gt(&self, block: usize, target: u64) -> WalkResult {
        self.find_fw(block, 0, target, SearchType::Gt)
    }

    /// Forward search from `start` for `sum >= target`.
    pub fn find_ge_fw(&self, block: usize, start: usize, target: u64) -> WalkResult {
        self.find_fw(block, start, target, SearchType::Ge)
    }

    /// Forward search from `start` for `sum > target`.
    pub fn find_gt_fw(&self, block: usize, start: usize, target: u64) -> WalkResult {
        self.find_fw(block, start, target, SearchType::Gt)
    }

    /// Backward search from `start` for `sum >= target`.
    pub fn find_ge_bw(&self, block: usize, start: usize, target: u64) -> WalkResult {
        self.find_bw(block, start, target, SearchType::Ge)
    }

    /// Backward search from `start` for `sum > target`.
    pub fn find_gt_bw(&self, block: usize, start: usize, target: u64) -> WalkResult {
        self.find_bw(block, start, target, SearchType::Gt)
    }

    /// Forward search: the first `idx >= start` such that the sum of
    /// `[start, idx]` meets `target`.
    pub fn find_fw(&self, block: usize, start: usize, target: u64, ty: SearchType) -> WalkResult {
        let size = self.size();
        assert!(block < self.blocks() && start <= size, "search start is out of range");

        let base = block * size;
        let from = base + start;
        let end = base + size;
        let offset_sum = self.prefix(from);

        match self.seek_sum(offset_sum.saturating_add(target), ty) {
            Some((g, prefix)) if g < end => {
                let (g, prefix) = if g < from { (from, offset_sum) } else { (g, prefix) };
                if g < end {
                    WalkResult::new(g - base, prefix - offset_sum)
                } else {
                    WalkResult::new(size, self.prefix(end) - offset_sum)
                }
            }
            _ => WalkResult::new(size, self.prefix(end) - offset_sum),
        }
    }

    /// Backward search: the largest `idx <= start` such that the sum of
    /// `[idx, start]` meets `target`.
    pub fn find_bw(&self, block: usize, start: usize, target: u64, ty: SearchType) -> WalkResult {
        let size = self.size();
        assert!(block < self.blocks(), "block {} is out of range", block);
        if size == 0 {
            return WalkResult::new(0, 0);
        }
        assert!(start < size, "search start {} is out of range", start);

        let base = block * size;
        let upto = self.prefix(base + start + 1);
        let available = upto - self.prefix(base);
        if !ty.matches(available, target) {
            return WalkResult::new(size, available);
        }

        // largest g with prefix(g) <= limit
        let bound = upto - target;
        let limit = match ty {
            SearchType::Ge => bound,
            SearchType::Gt => bound - 1,
        };
        let last = base + start;
        let g = match self.seek_sum(limit, SearchType::Gt) {
            Some((e, _)) => e.min(last),
            None => last,
        };
        WalkResult::new(g - base, upto - self.prefix(g + 1))
    }

    /// Encoded bytes of `[start, end)` summed over all blocks.
    pub fn range_data_size(&self, start: usize, end: usize) -> usize {
        let size = self.size();
        assert!(start <= end && end <= size, "range {}..{} is out of range", start, end);
        (0..self.blocks())
            .map(|b| self.locate(b * size + end) - self.locate(b * size + start))
            .sum()
    }

    /// Bytes an insert of one row (one value per block) would add to the
    /// region.
    pub fn insert_delta(&self, values: &[u64]) -> usize {
        let extra: usize = values.iter().map(|&v| C::length(v)).sum();
        Self::region_size_for(self.layout.data_size + extra).saturating_sub(self.data.len())
    }

    /// Bytes replacing the row at `idx` with `values` would add to the
    /// region. `idx` must be in range.
    pub fn update_delta(&self, idx: usize, values: &[u64]) -> usize {
        let old = self.range_data_size(idx, idx + 1);
        let new: usize = values.iter().map(|&v| C::length(v)).sum();
        Self::region_size_for(self.layout.data_size - old + new).saturating_sub(self.data.len())
    }

    /// Recomputes the index from the encoded values and compares it with
    /// the stored one.
    pub fn check(&self) -> Result<()> {
        let blocks = self.blocks();
        if blocks == 0 {
            return Err(Error::corrupted("dense tree has zero blocks"));
        }
        if self.layout.region_size() > self.data.len() {
            return Err(Error::corrupted(format!(
                "dense tree region needs {} bytes, stream has {}",
                self.layout.region_size(),
                self.data.len()
            )));
        }
        if self.index_size() != self.layout.geometry.index_size() {
            return Err(Error::corrupted(format!(
                "dense tree index size {} does not match data size {}",
                self.index_size(),
                self.layout.data_size
            )));
        }

        let index = build_index::<C>(self.values_bytes(), &self.layout.geometry);
        if index.elements != self.total() {
            return Err(Error::corrupted(format!(
                "dense tree holds {} elements, header says {} x {}",
                index.elements,
                self.size(),
                blocks
            )));
        }

        let (sums, sizes, offsets) = read_index(self.data, &self.layout);
        if sums != index.sums || sizes != index.sizes || offsets != index.offsets {
            return Err(Error::corrupted("dense tree index does not match its values"));
        }
        Ok(())
    }

    /// Human readable dump of the header and every block.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "PkdVDTree size={} blocks={} data_size={} index_size={}",
            self.size(),
            self.blocks(),
            self.data_size(),
            self.index_size()
        );
        for block in 0..self.blocks() {
            let values: Vec<u64> = self.iter(block).collect();
            let _ = writeln!(out, "  block {}: {:?}", block, values);
        }
        out
    }
}

/// Sequential decoder over one block.
pub struct ValueIter<'t, 'a, C> {
    tree: &'t PkdVDTree<'a, C>,
    pos: usize,
    remaining: usize,
}

impl<C: Codec> Iterator for ValueIter<'_, '_, C> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.remaining == 0 {
            return None;
        }
        let (value, len) = self.tree.decode(self.pos);
        self.pos += len;
        self.remaining -= 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
