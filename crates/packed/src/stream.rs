//! Uniform access to the sub-streams of a node.
//!
//! A node packs several sub-streams into one allocator. Their kinds are only
//! known at run time (from the node descriptor), so the concrete views are
//! wrapped in [`StreamRef`] / [`StreamMut`] and driven through the
//! [`SubStream`] / [`SubStreamMut`] traits.

use crate::allocator::PackedAllocator;
use crate::codec::{Codec, VarintCodec};
use crate::fseq::{PkdFSeq, PkdFSeqMut};
use crate::search::{SearchType, WalkResult};
use crate::vdtree::{PkdVDTree, PkdVDTreeMut};
use alloc::string::String;
use alloc::vec::Vec;
use memoria_core::{Error, Result};

/// Kind and arity of a sub-stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamSpec {
    /// A variable-length dense tree with `blocks` indexed sequences.
    VdTree { blocks: usize },
    /// A fixed-width sequence with `blocks` columns.
    FSeq { blocks: usize },
}

impl StreamSpec {
    pub fn blocks(&self) -> usize {
        match *self {
            StreamSpec::VdTree { blocks } | StreamSpec::FSeq { blocks } => blocks,
        }
    }

    /// Size of the stream in its empty state.
    pub fn empty_size(&self) -> usize {
        match self {
            StreamSpec::VdTree { .. } => PkdVDTree::<VarintCodec>::empty_size(),
            StreamSpec::FSeq { .. } => PkdFSeq::empty_size(),
        }
    }

    /// Size of an empty stream of this kind after `extra` encoded bytes (in
    /// [`SubStream::range_bytes`] units) are added.
    pub fn grown_size(&self, extra: usize) -> usize {
        match self {
            StreamSpec::VdTree { .. } => PkdVDTree::<VarintCodec>::region_size_for(extra),
            StreamSpec::FSeq { .. } => PkdFSeq::empty_size() + extra,
        }
    }

    /// Stable byte encoding, used for layout hashing.
    pub fn encode(&self) -> [u8; 5] {
        let tag = match self {
            StreamSpec::VdTree { .. } => 1u8,
            StreamSpec::FSeq { .. } => 2u8,
        };
        let blocks = (self.blocks() as u32).to_le_bytes();
        [tag, blocks[0], blocks[1], blocks[2], blocks[3]]
    }
}

/// Read operations shared by every sub-stream kind.
pub trait SubStream {
    fn spec(&self) -> StreamSpec;

    /// Number of elements per block.
    fn size(&self) -> usize;

    fn blocks(&self) -> usize;

    fn value(&self, block: usize, idx: usize) -> u64;

    /// Values of every block at `idx`.
    fn values(&self, idx: usize) -> Vec<u64> {
        (0..self.blocks()).map(|b| self.value(b, idx)).collect()
    }

    /// Sum of `[start, end)` of one block.
    fn sum(&self, block: usize, start: usize, end: usize) -> u64;

    /// Totals of every block.
    fn sums(&self) -> Vec<u64> {
        let size = self.size();
        (0..self.blocks()).map(|b| self.sum(b, 0, size)).collect()
    }

    /// Sums of `[start, end)` for every block.
    fn range_sums(&self, start: usize, end: usize) -> Vec<u64> {
        (0..self.blocks()).map(|b| self.sum(b, start, end)).collect()
    }

    /// Forward prefix-sum search.
    fn find(&self, block: usize, start: usize, target: u64, ty: SearchType) -> WalkResult;

    /// Backward prefix-sum search.
    fn find_bw(&self, block: usize, start: usize, target: u64, ty: SearchType) -> WalkResult;

    fn check(&self) -> Result<()>;

    /// Bytes occupied by the stream's region.
    fn data_bytes(&self) -> usize;

    /// Bytes an insert of one row of `values` would add to the region.
    fn insert_delta(&self, values: &[u64]) -> usize;

    /// Bytes replacing row `idx` with `values` would add to the region.
    fn update_delta(&self, idx: usize, values: &[u64]) -> usize;

    /// Bytes `[start, end)` of every block occupy in the encoded form.
    fn range_bytes(&self, start: usize, end: usize) -> usize;

    /// Region size after `extra` encoded bytes (as reported by
    /// `range_bytes` of a stream of the same kind) are added.
    fn grown_size(&self, extra: usize) -> usize;

    /// Upper bound of the growth caused by inserting `count` rows of any
    /// values.
    fn max_insert_delta(&self, count: usize) -> usize;

    fn dump(&self) -> String;
}

/// Write operations shared by every sub-stream kind.
pub trait SubStreamMut {
    fn insert(&mut self, idx: usize, values: &[u64]) -> Result<()>;

    fn remove(&mut self, start: usize, end: usize) -> Result<()>;

    fn update_values(&mut self, idx: usize, values: &[u64]) -> Result<()>;

    fn add_value(&mut self, block: usize, idx: usize, delta: i64) -> Result<()>;

    fn clear(&mut self) -> Result<()>;

    fn reindex(&mut self);

    /// Bytes an insert of `values` would add to the region.
    fn insert_delta(&self, values: &[u64]) -> usize;
}

impl SubStream for PkdVDTree<'_> {
    fn spec(&self) -> StreamSpec {
        StreamSpec::VdTree {
            blocks: self.blocks(),
        }
    }

    fn size(&self) -> usize {
        PkdVDTree::size(self)
    }

    fn blocks(&self) -> usize {
        PkdVDTree::blocks(self)
    }

    fn value(&self, block: usize, idx: usize) -> u64 {
        PkdVDTree::value(self, block, idx)
    }

    fn sum(&self, block: usize, start: usize, end: usize) -> u64 {
        PkdVDTree::sum(self, block, start, end)
    }

    fn find(&self, block: usize, start: usize, target: u64, ty: SearchType) -> WalkResult {
        self.find_fw(block, start, target, ty)
    }

    fn find_bw(&self, block: usize, start: usize, target: u64, ty: SearchType) -> WalkResult {
        PkdVDTree::find_bw(self, block, start, target, ty)
    }

    fn check(&self) -> Result<()> {
        PkdVDTree::check(self)
    }

    fn data_bytes(&self) -> usize {
        self.region_size()
    }

    fn insert_delta(&self, values: &[u64]) -> usize {
        PkdVDTree::insert_delta(self, values)
    }

    fn update_delta(&self, idx: usize, values: &[u64]) -> usize {
        PkdVDTree::update_delta(self, idx, values)
    }

    fn range_bytes(&self, start: usize, end: usize) -> usize {
        self.range_data_size(start, end)
    }

    fn grown_size(&self, extra: usize) -> usize {
        PkdVDTree::<VarintCodec>::region_size_for(self.data_size() + extra)
    }

    fn max_insert_delta(&self, count: usize) -> usize {
        let extra = count * self.blocks() * VarintCodec::MAX_LEN;
        PkdVDTree::<VarintCodec>::region_size_for(self.data_size() + extra)
            .saturating_sub(self.region_size())
    }

    fn dump(&self) -> String {
        PkdVDTree::dump(self)
    }
}

impl SubStream for PkdFSeq<'_> {
    fn spec(&self) -> StreamSpec {
        StreamSpec::FSeq {
            blocks: self.blocks(),
        }
    }

    fn size(&self) -> usize {
        PkdFSeq::size(self)
    }

    fn blocks(&self) -> usize {
        PkdFSeq::blocks(self)
    }

    fn value(&self, block: usize, idx: usize) -> u64 {
        PkdFSeq::value(self, block, idx)
    }

    fn sum(&self, block: usize, start: usize, end: usize) -> u64 {
        PkdFSeq::sum(self, block, start, end)
    }

    fn find(&self, block: usize, start: usize, target: u64, ty: SearchType) -> WalkResult {
        self.find_fw(block, start, target, ty)
    }

    fn find_bw(&self, block: usize, start: usize, target: u64, ty: SearchType) -> WalkResult {
        PkdFSeq::find_bw(self, block, start, target, ty)
    }

    fn check(&self) -> Result<()> {
        PkdFSeq::check(self)
    }

    fn data_bytes(&self) -> usize {
        self.region_size()
    }

    fn insert_delta(&self, values: &[u64]) -> usize {
        PkdFSeq::insert_delta(self, values)
    }

    fn update_delta(&self, _idx: usize, _values: &[u64]) -> usize {
        0
    }

    fn range_bytes(&self, start: usize, end: usize) -> usize {
        (end - start) * self.blocks() * 8
    }

    fn grown_size(&self, extra: usize) -> usize {
        self.region_size() + extra
    }

    fn max_insert_delta(&self, count: usize) -> usize {
        count * self.blocks() * 8
    }

    fn dump(&self) -> String {
        PkdFSeq::dump(self)
    }
}

/// A read view over a sub-stream of any kind.
pub enum StreamRef<'a> {
    VdTree(PkdVDTree<'a>),
    FSeq(PkdFSeq<'a>),
}

impl<'a> StreamRef<'a> {
    /// Opens the stream bytes according to `spec`.
    pub fn open(spec: StreamSpec, data: &'a [u8]) -> Self {
        match spec {
            StreamSpec::VdTree { .. } => StreamRef::VdTree(PkdVDTree::open(data)),
            StreamSpec::FSeq { .. } => StreamRef::FSeq(PkdFSeq::open(data)),
        }
    }

    fn inner(&self) -> &dyn SubStream {
        match self {
            StreamRef::VdTree(tree) => tree,
            StreamRef::FSeq(seq) => seq,
        }
    }
}

impl SubStream for StreamRef<'_> {
    fn spec(&self) -> StreamSpec {
        self.inner().spec()
    }

    fn size(&self) -> usize {
        self.inner().size()
    }

    fn blocks(&self) -> usize {
        self.inner().blocks()
    }

    fn value(&self, block: usize, idx: usize) -> u64 {
        self.inner().value(block, idx)
    }

    fn sum(&self, block: usize, start: usize, end: usize) -> u64 {
        self.inner().sum(block, start, end)
    }

    fn sums(&self) -> Vec<u64> {
        self.inner().sums()
    }

    fn find(&self, block: usize, start: usize, target: u64, ty: SearchType) -> WalkResult {
        self.inner().find(block, start, target, ty)
    }

    fn find_bw(&self, block: usize, start: usize, target: u64, ty: SearchType) -> WalkResult {
        self.inner().find_bw(block, start, target, ty)
    }

    fn check(&self) -> Result<()> {
        self.inner().check()
    }

    fn data_bytes(&self) -> usize {
        self.inner().data_bytes()
    }

    fn insert_delta(&self, values: &[u64]) -> usize {
        self.inner().insert_delta(values)
    }

    fn update_delta(&self, idx: usize, values: &[u64]) -> usize {
        self.inner().update_delta(idx, values)
    }

    fn range_bytes(&self, start: usize, end: usize) -> usize {
        self.inner().range_bytes(start, end)
    }

    fn grown_size(&self, extra: usize) -> usize {
        self.inner().grown_size(extra)
    }

    fn max_insert_delta(&self, count: usize) -> usize {
        self.inner().max_insert_delta(count)
    }

    fn dump(&self) -> String {
        self.inner().dump()
    }
}

/// A mutable view over a sub-stream of any kind.
pub enum StreamMut<'a, B> {
    VdTree(PkdVDTreeMut<'a, B>),
    FSeq(PkdFSeqMut<'a, B>),
}

impl<'a, B: AsRef<[u8]> + AsMut<[u8]>> StreamMut<'a, B> {
    /// Allocates an empty stream of the given kind in `slot`.
    pub fn init(spec: StreamSpec, alloc: &'a mut PackedAllocator<B>, slot: usize) -> Result<Self> {
        Ok(match spec {
            StreamSpec::VdTree { blocks } => {
                StreamMut::VdTree(PkdVDTreeMut::init(alloc, slot, blocks)?)
            }
            StreamSpec::FSeq { blocks } => StreamMut::FSeq(PkdFSeqMut::init(alloc, slot, blocks)?),
        })
    }

    /// Opens an allocated stream.
    pub fn open(spec: StreamSpec, alloc: &'a mut PackedAllocator<B>, slot: usize) -> Self {
        match spec {
            StreamSpec::VdTree { .. } => StreamMut::VdTree(PkdVDTreeMut::open(alloc, slot)),
            StreamSpec::FSeq { .. } => StreamMut::FSeq(PkdFSeqMut::open(alloc, slot)),
        }
    }

    /// Read view of the current state.
    pub fn view(&self) -> StreamRef<'_> {
        match self {
            StreamMut::VdTree(tree) => StreamRef::VdTree(tree.tree()),
            StreamMut::FSeq(seq) => StreamRef::FSeq(seq.seq()),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            StreamMut::VdTree(tree) => tree.size(),
            StreamMut::FSeq(seq) => seq.size(),
        }
    }

    /// Moves `[idx, size)` to the front of `other`.
    pub fn split_to<B2>(&mut self, other: &mut StreamMut<'_, B2>, idx: usize) -> Result<()>
    where
        B2: AsRef<[u8]> + AsMut<[u8]>,
    {
        match (self, other) {
            (StreamMut::VdTree(a), StreamMut::VdTree(b)) => a.split_to(b, idx),
            (StreamMut::FSeq(a), StreamMut::FSeq(b)) => a.split_to(b, idx),
            _ => Err(mismatch()),
        }
    }

    /// Appends `other`'s content and empties it.
    pub fn merge_with<B2>(&mut self, other: &mut StreamMut<'_, B2>) -> Result<()>
    where
        B2: AsRef<[u8]> + AsMut<[u8]>,
    {
        match (self, other) {
            (StreamMut::VdTree(a), StreamMut::VdTree(b)) => a.merge_with(b),
            (StreamMut::FSeq(a), StreamMut::FSeq(b)) => a.merge_with(b),
            _ => Err(mismatch()),
        }
    }

    /// Copies `[from, from + count)` into `other` at `to`.
    pub fn copy_to<B2>(
        &self,
        other: &mut StreamMut<'_, B2>,
        from: usize,
        count: usize,
        to: usize,
    ) -> Result<()>
    where
        B2: AsRef<[u8]> + AsMut<[u8]>,
    {
        match (self, other) {
            (StreamMut::VdTree(a), StreamMut::VdTree(b)) => a.copy_to(b, from, count, to),
            (StreamMut::FSeq(a), StreamMut::FSeq(b)) => a.copy_to(b, from, count, to),
            _ => Err(mismatch()),
        }
    }

    pub fn update_value(&mut self, block: usize, idx: usize, value: u64) -> Result<()> {
        match self {
            StreamMut::VdTree(tree) => tree.update_value(block, idx, value),
            StreamMut::FSeq(seq) => seq.update_value(block, idx, value),
        }
    }
}

fn mismatch() -> Error {
    Error::invalid_operation("sub-stream kinds do not match")
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SubStreamMut for StreamMut<'_, B> {
    fn insert(&mut self, idx: usize, values: &[u64]) -> Result<()> {
        match self {
            StreamMut::VdTree(tree) => tree.insert(idx, values),
            StreamMut::FSeq(seq) => seq.insert(idx, values),
        }
    }

    fn remove(&mut self, start: usize, end: usize) -> Result<()> {
        match self {
            StreamMut::VdTree(tree) => tree.remove(start, end),
            StreamMut::FSeq(seq) => seq.remove(start, end),
        }
    }

    fn update_values(&mut self, idx: usize, values: &[u64]) -> Result<()> {
        match self {
            StreamMut::VdTree(tree) => tree.update_values(idx, values),
            StreamMut::FSeq(seq) => seq.update_values(idx, values),
        }
    }

    fn add_value(&mut self, block: usize, idx: usize, delta: i64) -> Result<()> {
        match self {
            StreamMut::VdTree(tree) => tree.add_value(block, idx, delta),
            StreamMut::FSeq(seq) => seq.add_value(block, idx, delta),
        }
    }

    fn clear(&mut self) -> Result<()> {
        match self {
            StreamMut::VdTree(tree) => tree.clear(),
            StreamMut::FSeq(seq) => seq.clear(),
        }
    }

    fn reindex(&mut self) {
        match self {
            StreamMut::VdTree(tree) => tree.reindex(),
            StreamMut::FSeq(seq) => seq.reindex(),
        }
    }

    fn insert_delta(&self, values: &[u64]) -> usize {
        match self {
            StreamMut::VdTree(tree) => tree.insert_delta(values),
            StreamMut::FSeq(seq) => seq.insert_delta(values),
        }
    }
}
