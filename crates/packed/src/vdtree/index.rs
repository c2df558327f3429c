//! Index geometry and index construction for the dense tree.

use crate::codec::Codec;
use alloc::vec;
use alloc::vec::Vec;
use memoria_core::bytes::{self, align8, div_up};

/// Width of one leaf window over the encoded values, in bytes.
pub const WINDOW_BYTES: usize = 128;

/// Fan-out of the index levels above the leaf windows.
pub const INDEX_BRANCHING: usize = 32;

pub(crate) const SIZE_OFFSET: usize = 0;
pub(crate) const DATA_SIZE_OFFSET: usize = 4;
pub(crate) const BLOCKS_OFFSET: usize = 8;
pub(crate) const INDEX_SIZE_OFFSET: usize = 12;
pub(crate) const HEADER_SIZE: usize = 16;

/// Level sizes of the index, root first. Empty when the encoded data fits
/// into a single window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct IndexGeometry {
    levels: Vec<usize>,
}

impl IndexGeometry {
    pub fn for_data_size(data_size: usize) -> Self {
        if data_size <= WINDOW_BYTES {
            return Self { levels: Vec::new() };
        }

        let mut levels = Vec::new();
        let mut cells = div_up(data_size, WINDOW_BYTES);
        loop {
            levels.push(cells);
            if cells == 1 {
                break;
            }
            cells = div_up(cells, INDEX_BRANCHING);
        }
        levels.reverse();
        Self { levels }
    }

    pub fn has_index(&self) -> bool {
        !self.levels.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn index_size(&self) -> usize {
        self.levels.iter().sum()
    }

    pub fn windows(&self) -> usize {
        self.levels.last().copied().unwrap_or(0)
    }

    pub fn level_size(&self, level: usize) -> usize {
        self.levels[level]
    }

    pub fn level_start(&self, level: usize) -> usize {
        self.levels[..level].iter().sum()
    }
}

/// Byte offsets of the sections of a dense tree region.
#[derive(Clone, Debug)]
pub(crate) struct RegionLayout {
    pub geometry: IndexGeometry,
    pub data_size: usize,
    pub value_index: usize,
    pub size_index: usize,
    pub offsets: usize,
    pub values: usize,
}

impl RegionLayout {
    pub fn new(data_size: usize) -> Self {
        let geometry = IndexGeometry::for_data_size(data_size);
        let index_size = geometry.index_size();
        let value_index = HEADER_SIZE;
        let size_index = value_index + index_size * 8;
        let offsets = size_index + index_size * 4;
        let values = offsets + geometry.windows() * 4;
        Self {
            geometry,
            data_size,
            value_index,
            size_index,
            offsets,
            values,
        }
    }

    /// Total region size, padded to the allocator alignment.
    pub fn region_size(&self) -> usize {
        align8(self.values + self.data_size)
    }

    pub fn cell_sum(&self, data: &[u8], cell: usize) -> u64 {
        bytes::read_u64(data, self.value_index + cell * 8)
    }

    pub fn cell_size(&self, data: &[u8], cell: usize) -> usize {
        bytes::read_u32(data, self.size_index + cell * 4) as usize
    }

    pub fn window_offset(&self, data: &[u8], window: usize) -> usize {
        bytes::read_u32(data, self.offsets + window * 4) as usize
    }
}

/// Region size for the given amount of encoded data.
pub(crate) fn region_size(data_size: usize) -> usize {
    RegionLayout::new(data_size).region_size()
}

/// A freshly computed index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Index {
    pub sums: Vec<u64>,
    pub sizes: Vec<u32>,
    pub offsets: Vec<u32>,
    /// Number of decoded elements.
    pub elements: usize,
}

/// Scans the encoded values and computes every index level.
pub(crate) fn build_index<C: Codec>(values: &[u8], geometry: &IndexGeometry) -> Index {
    let data_size = values.len();
    let mut elements = 0;

    if !geometry.has_index() {
        let mut pos = 0;
        while pos < data_size {
            let (_, len) = C::decode(values, pos, data_size);
            pos += len;
            elements += 1;
        }
        return Index {
            sums: Vec::new(),
            sizes: Vec::new(),
            offsets: Vec::new(),
            elements,
        };
    }

    let index_size = geometry.index_size();
    let windows = geometry.windows();
    let leaf_start = geometry.level_start(geometry.depth() - 1);

    let mut sums = vec![0u64; index_size];
    let mut sizes = vec![0u32; index_size];
    let mut offsets: Vec<u32> = (0..windows)
        .map(|w| (data_size - w * WINDOW_BYTES).min(WINDOW_BYTES) as u32)
        .collect();

    let mut pos = 0;
    while pos < data_size {
        let window = pos / WINDOW_BYTES;
        let cell = leaf_start + window;
        if sizes[cell] == 0 {
            offsets[window] = (pos - window * WINDOW_BYTES) as u32;
        }
        let (value, len) = C::decode(values, pos, data_size);
        sizes[cell] += 1;
        sums[cell] += value;
        pos += len;
        elements += 1;
    }

    for level in (0..geometry.depth() - 1).rev() {
        let start = geometry.level_start(level);
        let child_start = geometry.level_start(level + 1);
        let child_count = geometry.level_size(level + 1);
        for cell in 0..geometry.level_size(level) {
            let first = cell * INDEX_BRANCHING;
            let last = (first + INDEX_BRANCHING).min(child_count);
            let mut sum = 0u64;
            let mut size = 0u32;
            for child in first..last {
                sum += sums[child_start + child];
                size += sizes[child_start + child];
            }
            sums[start + cell] = sum;
            sizes[start + cell] = size;
        }
    }

    Index {
        sums,
        sizes,
        offsets,
        elements,
    }
}

/// Writes a computed index into a region laid out by `layout`.
pub(crate) fn write_index(data: &mut [u8], layout: &RegionLayout, index: &Index) {
    for (cell, &sum) in index.sums.iter().enumerate() {
        bytes::write_u64(data, layout.value_index + cell * 8, sum);
    }
    for (cell, &size) in index.sizes.iter().enumerate() {
        bytes::write_u32(data, layout.size_index + cell * 4, size);
    }
    for (window, &offset) in index.offsets.iter().enumerate() {
        bytes::write_u32(data, layout.offsets + window * 4, offset);
    }
}

/// Reads the stored index of a region.
pub(crate) fn read_index(data: &[u8], layout: &RegionLayout) -> (Vec<u64>, Vec<u32>, Vec<u32>) {
    let index_size = layout.geometry.index_size();
    let sums = (0..index_size).map(|c| layout.cell_sum(data, c)).collect();
    let sizes = (0..index_size)
        .map(|c| layout.cell_size(data, c) as u32)
        .collect();
    let offsets = (0..layout.geometry.windows())
        .map(|w| layout.window_offset(data, w) as u32)
        .collect();
    (sums, sizes, offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::VarintCodec;

    #[test]
    fn test_geometry_small_has_no_index() {
        let g = IndexGeometry::for_data_size(WINDOW_BYTES);
        assert!(!g.has_index());
        assert_eq!(g.index_size(), 0);
        assert_eq!(g.windows(), 0);
    }

    #[test]
    fn test_geometry_levels() {
        let g = IndexGeometry::for_data_size(WINDOW_BYTES + 1);
        assert_eq!(g.depth(), 2);
        assert_eq!(g.windows(), 2);
        assert_eq!(g.index_size(), 3);

        // 40 windows -> 2 cells -> 1 root
        let g = IndexGeometry::for_data_size(WINDOW_BYTES * 40);
        assert_eq!(g.depth(), 3);
        assert_eq!(g.level_size(0), 1);
        assert_eq!(g.level_size(1), 2);
        assert_eq!(g.level_size(2), 40);
        assert_eq!(g.level_start(2), 3);
    }

    #[test]
    fn test_build_index_sums_windows() {
        // 200 one-byte values followed by a two-byte value
        let mut values = vec![1u8; 200];
        values.extend_from_slice(&[0x80, 0x01]);
        let g = IndexGeometry::for_data_size(values.len());
        let index = build_index::<VarintCodec>(&values, &g);

        assert_eq!(index.elements, 201);
        // root, window 0, window 1
        assert_eq!(index.sizes, vec![201, 128, 73]);
        assert_eq!(index.sums, vec![200 + 128, 128, 72 + 128]);
        assert_eq!(index.offsets, vec![0, 0]);
    }

    #[test]
    fn test_window_without_element_start() {
        // a ten-byte varint starting at 120 spills over the window border,
        // leaving window 1 with continuation bytes only
        let mut values = vec![0u8; 120];
        let mut buf = [0u8; 10];
        let len = VarintCodec::encode(&mut buf, 0, u64::MAX);
        values.extend_from_slice(&buf[..len]);
        let g = IndexGeometry::for_data_size(values.len());
        let index = build_index::<VarintCodec>(&values, &g);
        assert_eq!(index.sizes[2], 0);
        assert_eq!(index.offsets[1], 2);
    }
}
