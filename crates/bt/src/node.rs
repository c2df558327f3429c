//! Branch and leaf nodes packed into a single block.
//!
//! A node block is a [`NodeHeader`] followed by a [`PackedAllocator`]
//! region. Slot 0 of the allocator holds the root metadata (root nodes
//! only), slots `1..=S` the sub-streams in descriptor order and, for branch
//! nodes, slot `S + 1` the array of child block ids.
//!
//! A freshly initialized node has no sub-streams allocated. `layout` (or
//! `prepare`) allocates the chosen streams in their empty state; after that
//! every structural operation keeps all allocated streams at the same size.
//! Operations that may run out of space check the capacity first and fail
//! with a capacity error before any byte of the node is changed.

use crate::accumulator::Accumulator;
use crate::descriptor::{NodeDescriptor, NodeRegistry, METADATA_SLOT};
use crate::header::{NodeHeader, RootMetadata, NODE_HEADER_SIZE};
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::Write;
use memoria_core::bytes;
use memoria_core::{BlockId, Error, Result};
use memoria_packed::allocator::header_size;
use memoria_packed::{
    ElementKind, PackedAllocator, SearchType, StreamMut, StreamRef, SubStream, SubStreamMut,
    WalkResult,
};

const ID_SIZE: usize = BlockId::BYTES;

/// A node view over a block payload.
#[derive(Debug)]
pub struct TreeNode<'d, B> {
    data: B,
    descriptor: &'d NodeDescriptor,
}

impl<'d, B: AsRef<[u8]>> TreeNode<'d, B> {
    /// Opens a node, validating its header against `descriptor`.
    pub fn open(data: B, descriptor: &'d NodeDescriptor) -> Result<Self> {
        let bytes = data.as_ref();
        if bytes.len() < NODE_HEADER_SIZE {
            return Err(Error::corrupted(format!(
                "node block of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let header = NodeHeader::read(bytes);
        if header.node_type_hash != descriptor.hash() {
            return Err(Error::corrupted(format!(
                "node type hash {:#x} does not match descriptor {} ({:#x})",
                header.node_type_hash,
                descriptor.name,
                descriptor.hash()
            )));
        }
        let alloc = PackedAllocator::open(&bytes[NODE_HEADER_SIZE..])?;
        if alloc.streams() != descriptor.allocator_slots() {
            return Err(Error::corrupted(format!(
                "node allocator has {} slots, descriptor {} needs {}",
                alloc.streams(),
                descriptor.name,
                descriptor.allocator_slots()
            )));
        }
        Ok(Self { data, descriptor })
    }

    /// Wraps a block already known to hold a node of this type.
    pub fn wrap(data: B, descriptor: &'d NodeDescriptor) -> Self {
        Self { data, descriptor }
    }

    pub fn descriptor(&self) -> &'d NodeDescriptor {
        self.descriptor
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    pub fn into_inner(self) -> B {
        self.data
    }

    pub fn block_size(&self) -> usize {
        self.data.as_ref().len()
    }

    pub fn header(&self) -> NodeHeader {
        NodeHeader::read(self.data.as_ref())
    }

    pub fn is_root(&self) -> bool {
        self.header().root
    }

    pub fn is_leaf(&self) -> bool {
        self.header().leaf
    }

    pub fn level(&self) -> i32 {
        self.header().level
    }

    pub fn parent_id(&self) -> BlockId {
        self.header().parent_id
    }

    pub fn parent_idx(&self) -> i32 {
        self.header().parent_idx
    }

    pub fn node_type_hash(&self) -> u64 {
        self.header().node_type_hash
    }

    /// The allocator region of the node.
    pub fn allocator(&self) -> PackedAllocator<&[u8]> {
        PackedAllocator::wrap(&self.data.as_ref()[NODE_HEADER_SIZE..])
    }

    pub fn free_space(&self) -> usize {
        self.allocator().free_space()
    }

    pub fn root_metadata(&self) -> Option<RootMetadata> {
        let alloc = self.allocator();
        if alloc.is_empty(METADATA_SLOT) {
            None
        } else {
            Some(RootMetadata::read(alloc.element_slice(METADATA_SLOT)))
        }
    }

    /// Sub-stream `i`, `None` while it is not allocated.
    pub fn stream(&self, i: usize) -> Option<StreamRef<'_>> {
        let alloc = self.allocator();
        let slot = self.descriptor.stream_slot(i);
        if alloc.is_empty(slot) {
            None
        } else {
            Some(StreamRef::open(self.descriptor.streams[i], alloc.element_slice(slot)))
        }
    }

    /// Bit mask of the allocated sub-streams.
    pub fn active_streams_mask(&self) -> u64 {
        let alloc = self.allocator();
        (0..self.descriptor.stream_count().min(64))
            .filter(|&i| !alloc.is_empty(self.descriptor.stream_slot(i)))
            .fold(0u64, |mask, i| mask | (1 << i))
    }

    /// Number of entries.
    pub fn size(&self) -> usize {
        let alloc = self.allocator();
        let dispatcher = self.descriptor.dispatcher();
        for i in 0..dispatcher.len() {
            if let Some(stream) = dispatcher.dispatch(&alloc, i) {
                return stream.size();
            }
        }
        self.children_count()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn children_count(&self) -> usize {
        match self.descriptor.values_slot() {
            Some(slot) => self.allocator().element_size(slot) / ID_SIZE,
            None => 0,
        }
    }

    /// Child block id at `idx`; branch nodes only.
    pub fn child_id(&self, idx: usize) -> Result<BlockId> {
        let slot = self.values_slot()?;
        let count = self.children_count();
        if idx >= count {
            return Err(Error::invalid_operation(format!(
                "child index {} is out of range 0..{}",
                idx, count
            )));
        }
        let alloc = self.allocator();
        Ok(BlockId::new(bytes::read_u128(alloc.element_slice(slot), idx * ID_SIZE)))
    }

    /// All child block ids; empty for leaves.
    pub fn children(&self) -> Vec<BlockId> {
        match self.descriptor.values_slot() {
            Some(slot) => read_ids(self.allocator().element_slice(slot)),
            None => Vec::new(),
        }
    }

    fn values_slot(&self) -> Result<usize> {
        self.descriptor.values_slot().ok_or_else(|| {
            Error::invalid_operation(format!("{} is a leaf node and has no children", self.descriptor.name))
        })
    }

    /// Per-stream sums of `[start, end)`.
    pub fn sum(&self, start: usize, end: usize) -> Accumulator {
        let mut acc = Accumulator::zeroed(&self.descriptor.streams);
        let alloc = self.allocator();
        self.descriptor
            .dispatcher()
            .dispatch_not_empty(&alloc, |i, stream| *acc.stream_mut(i) = stream.range_sums(start, end));
        acc
    }

    /// Per-stream totals.
    pub fn sums(&self) -> Accumulator {
        self.sum(0, self.size())
    }

    /// The keys of entry `idx`.
    pub fn keys_at(&self, idx: usize) -> Accumulator {
        let mut acc = Accumulator::zeroed(&self.descriptor.streams);
        let alloc = self.allocator();
        self.descriptor
            .dispatcher()
            .dispatch_not_empty(&alloc, |i, stream| *acc.stream_mut(i) = stream.values(idx));
        acc
    }

    /// Keys of the last entry, zeros for an empty node.
    pub fn max_keys(&self) -> Accumulator {
        match self.size() {
            0 => Accumulator::zeroed(&self.descriptor.streams),
            size => self.keys_at(size - 1),
        }
    }

    /// Forward prefix-sum search in one block of one sub-stream.
    pub fn find(
        &self,
        stream: usize,
        block: usize,
        start: usize,
        target: u64,
        ty: SearchType,
    ) -> Result<WalkResult> {
        let view = self.searchable(stream, block)?;
        Ok(view.find(block, start, target, ty))
    }

    /// Backward prefix-sum search in one block of one sub-stream.
    pub fn find_bw(
        &self,
        stream: usize,
        block: usize,
        start: usize,
        target: u64,
        ty: SearchType,
    ) -> Result<WalkResult> {
        let view = self.searchable(stream, block)?;
        Ok(view.find_bw(block, start, target, ty))
    }

    fn searchable(&self, stream: usize, block: usize) -> Result<StreamRef<'_>> {
        if stream >= self.descriptor.stream_count() {
            return Err(Error::invalid_operation(format!("stream {} is out of range", stream)));
        }
        let view = self.stream(stream).ok_or_else(|| {
            Error::invalid_operation(format!("stream {} is not allocated", stream))
        })?;
        if block >= view.blocks() {
            return Err(Error::invalid_operation(format!(
                "block {} is out of range for stream {}",
                block, stream
            )));
        }
        Ok(view)
    }

    /// Exact number of bytes inserting one entry with `keys` needs.
    pub fn insert_delta(&self, keys: &Accumulator) -> usize {
        let alloc = self.allocator();
        let streams = self
            .descriptor
            .dispatcher()
            .fold(&alloc, 0, |acc, i, stream| acc + stream.insert_delta(keys.stream(i)));
        let children = if self.descriptor.values_slot().is_some() { ID_SIZE } else { 0 };
        streams + children
    }

    /// Returns true if an entry with `keys` fits.
    pub fn check_capacity(&self, keys: &Accumulator) -> bool {
        self.insert_delta(keys) <= self.free_space()
    }

    /// Conservative check that `count` entries with arbitrary keys fit.
    pub fn check_capacities(&self, count: usize) -> bool {
        self.max_insert_delta(count) <= self.free_space()
    }

    fn max_insert_delta(&self, count: usize) -> usize {
        let alloc = self.allocator();
        let streams = self
            .descriptor
            .dispatcher()
            .fold(&alloc, 0, |acc, _, stream| acc + stream.max_insert_delta(count));
        let children = if self.descriptor.values_slot().is_some() { ID_SIZE * count } else { 0 };
        streams + children
    }

    /// Bytes `target` needs to receive `[start, end)` of this node.
    fn transfer_size<B2: AsRef<[u8]>>(&self, target: &TreeNode<'_, B2>, start: usize, end: usize) -> usize {
        let mut total = 0;
        for (i, spec) in self.descriptor.streams.iter().enumerate() {
            let Some(source) = self.stream(i) else {
                continue;
            };
            let extra = source.range_bytes(start, end);
            total += match target.stream(i) {
                Some(stream) => stream.grown_size(extra) - stream.data_bytes(),
                // not laid out yet
                None => spec.grown_size(extra),
            };
        }
        if self.descriptor.values_slot().is_some() {
            total += (end - start) * ID_SIZE;
        }
        total
    }

    fn check_same_type<B2: AsRef<[u8]>>(&self, other: &TreeNode<'_, B2>) -> Result<()> {
        if self.descriptor.hash() != other.descriptor.hash() {
            return Err(Error::invalid_operation(format!(
                "node types differ: {} vs {}",
                self.descriptor.name, other.descriptor.name
            )));
        }
        Ok(())
    }

    /// Returns true if all of `other`'s entries fit into this node.
    pub fn can_be_merged_with<B2: AsRef<[u8]>>(&self, other: &TreeNode<'_, B2>) -> bool {
        self.check_same_type(other).is_ok()
            && other.transfer_size(self, 0, other.size()) <= self.free_space()
    }

    /// Returns true if the node is less than half full.
    pub fn should_be_merged_with_siblings(&self) -> bool {
        let alloc = self.allocator();
        alloc.allocated() < alloc.client_area() / 2
    }

    /// Structural validation.
    pub fn check(&self) -> Result<()> {
        let header = self.header();
        if header.node_type_hash != self.descriptor.hash() {
            return Err(Error::corrupted(format!(
                "node type hash {:#x} does not match {}",
                header.node_type_hash, self.descriptor.name
            )));
        }
        if header.leaf != self.descriptor.is_leaf() {
            return Err(Error::corrupted(format!(
                "leaf flag of {} node is {}",
                self.descriptor.name, header.leaf
            )));
        }
        let alloc = self.allocator();
        alloc.check()?;
        if alloc.streams() != self.descriptor.allocator_slots() {
            return Err(Error::corrupted(format!(
                "node allocator has {} slots, expected {}",
                alloc.streams(),
                self.descriptor.allocator_slots()
            )));
        }

        let size = self.size();
        let mut result = Ok(());
        self.descriptor.dispatcher().dispatch_not_empty(&alloc, |i, stream| {
            if result.is_err() {
                return;
            }
            result = stream.check().and_then(|_| {
                if stream.spec() != self.descriptor.streams[i] {
                    Err(Error::corrupted(format!(
                        "stream {} holds {:?}, expected {:?}",
                        i,
                        stream.spec(),
                        self.descriptor.streams[i]
                    )))
                } else if stream.size() != size {
                    Err(Error::corrupted(format!(
                        "stream {} has size {}, node size is {}",
                        i,
                        stream.size(),
                        size
                    )))
                } else {
                    Ok(())
                }
            });
        });
        result?;

        if self.descriptor.values_slot().is_some() && self.children_count() != size {
            return Err(Error::corrupted(format!(
                "branch node has {} children for {} entries",
                self.children_count(),
                size
            )));
        }
        Ok(())
    }

    /// The block image of the node.
    pub fn serialize(&self) -> Vec<u8> {
        self.data.as_ref().to_vec()
    }

    pub fn dump(&self) -> String {
        let header = self.header();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} root={} leaf={} level={} parent={} parent_idx={} size={} free={}",
            self.descriptor.name,
            header.root,
            header.leaf,
            header.level,
            header.parent_id,
            header.parent_idx,
            self.size(),
            self.free_space()
        );
        if let Some(meta) = self.root_metadata() {
            let _ = writeln!(
                out,
                "  metadata: ctr={} type={:#x}",
                meta.ctr_id, meta.ctr_type_hash
            );
        }
        for i in 0..self.descriptor.stream_count() {
            match self.stream(i) {
                Some(stream) => {
                    let _ = write!(out, "  stream {}: {}", i, stream.dump());
                }
                None => {
                    let _ = writeln!(out, "  stream {}: empty", i);
                }
            }
        }
        if self.descriptor.values_slot().is_some() {
            for (idx, id) in self.children().iter().enumerate() {
                let _ = writeln!(out, "  child {}: {}", idx, id);
            }
        }
        out
    }
}

impl<'d, B: AsRef<[u8]> + AsMut<[u8]>> TreeNode<'d, B> {
    /// Formats `data` as an empty node of the given type.
    pub fn init(mut data: B, descriptor: &'d NodeDescriptor) -> Result<Self> {
        let len = data.as_ref().len();
        let required = NODE_HEADER_SIZE + header_size(descriptor.allocator_slots());
        if len < required {
            return Err(Error::capacity(required, len));
        }
        let header = NodeHeader {
            leaf: descriptor.is_leaf(),
            node_type_hash: descriptor.hash(),
            ..NodeHeader::default()
        };
        header.write(data.as_mut());
        PackedAllocator::init(&mut data.as_mut()[NODE_HEADER_SIZE..], descriptor.allocator_slots())?;
        Ok(Self { data, descriptor })
    }

    fn allocator_mut(&mut self) -> PackedAllocator<&mut [u8]> {
        PackedAllocator::wrap(&mut self.data.as_mut()[NODE_HEADER_SIZE..])
    }

    fn update_header(&mut self, f: impl FnOnce(&mut NodeHeader)) {
        let mut header = self.header();
        f(&mut header);
        header.write(self.data.as_mut());
    }

    pub fn set_root(&mut self, root: bool) {
        self.update_header(|h| h.root = root);
    }

    pub fn set_level(&mut self, level: i32) {
        self.update_header(|h| h.level = level);
    }

    pub fn set_parent_id(&mut self, parent_id: BlockId) {
        self.update_header(|h| h.parent_id = parent_id);
    }

    pub fn set_parent_idx(&mut self, parent_idx: i32) {
        self.update_header(|h| h.parent_idx = parent_idx);
    }

    pub fn set_root_metadata(&mut self, meta: RootMetadata) -> Result<()> {
        let mut alloc = self.allocator_mut();
        if alloc.is_empty(METADATA_SLOT) {
            alloc.allocate(METADATA_SLOT, RootMetadata::SIZE, ElementKind::Raw)?;
        }
        meta.write(alloc.element_mut(METADATA_SLOT));
        Ok(())
    }

    pub fn clear_root_metadata(&mut self) -> Result<()> {
        let mut alloc = self.allocator_mut();
        if !alloc.is_empty(METADATA_SLOT) {
            alloc.free(METADATA_SLOT)?;
        }
        Ok(())
    }

    /// Allocates the streams selected by `mask` that are not allocated yet,
    /// plus the child array of branch nodes.
    pub fn layout(&mut self, mask: u64) -> Result<()> {
        let missing = mask & !self.active_streams_mask();
        let descriptor = self.descriptor;
        let mut alloc = self.allocator_mut();
        descriptor.dispatcher().allocate_empty(&mut alloc, missing)?;
        if let Some(slot) = descriptor.values_slot() {
            if alloc.is_empty(slot) {
                alloc.allocate(slot, 0, ElementKind::Raw)?;
            }
        }
        Ok(())
    }

    /// Allocates every stream.
    pub fn prepare(&mut self) -> Result<()> {
        let mask = self.descriptor.all_streams_mask();
        self.layout(mask)
    }

    fn check_entry(&self, idx: usize, child: Option<BlockId>) -> Result<()> {
        match (self.descriptor.values_slot(), child) {
            (Some(_), None) => {
                return Err(Error::invalid_operation(format!(
                    "branch node {} needs a child id",
                    self.descriptor.name
                )))
            }
            (None, Some(_)) => {
                return Err(Error::invalid_operation(format!(
                    "leaf node {} takes no child id",
                    self.descriptor.name
                )))
            }
            _ => {}
        }
        let size = self.size();
        if idx > size {
            return Err(Error::invalid_operation(format!(
                "insert position {} is out of range 0..={}",
                idx, size
            )));
        }
        Ok(())
    }

    fn check_keys(&self, keys: &Accumulator) -> Result<()> {
        if !keys.fits(&self.descriptor.streams) {
            return Err(Error::invalid_operation(format!(
                "keys {} do not match the layout of {}",
                keys, self.descriptor.name
            )));
        }
        Ok(())
    }

    fn ensure_space(&self, requested: usize) -> Result<()> {
        let available = self.free_space();
        if requested > available {
            tracing::trace!(node = %self.descriptor.name, requested, available, "node is full");
            return Err(Error::capacity(requested, available));
        }
        Ok(())
    }

    /// Inserts one entry at `idx`. Branch nodes take the child id of the
    /// entry, leaves take none.
    pub fn insert(&mut self, idx: usize, keys: &Accumulator, child: Option<BlockId>) -> Result<()> {
        self.check_entry(idx, child)?;
        self.check_keys(keys)?;
        self.ensure_space(self.insert_delta(keys))?;

        let descriptor = self.descriptor;
        let mut alloc = self.allocator_mut();
        descriptor
            .dispatcher()
            .dispatch_not_empty_mut(&mut alloc, |i, mut stream| stream.insert(idx, keys.stream(i)))?;
        if let (Some(slot), Some(id)) = (descriptor.values_slot(), child) {
            insert_ids(&mut alloc, slot, idx, &[id])?;
        }
        Ok(())
    }

    /// Inserts `count` zero entries at `idx`; children get nil ids.
    pub fn insert_space(&mut self, idx: usize, count: usize) -> Result<()> {
        let size = self.size();
        if idx > size {
            return Err(Error::invalid_operation(format!(
                "insert position {} is out of range 0..={}",
                idx, size
            )));
        }
        self.ensure_space(self.max_insert_delta(count))?;

        let descriptor = self.descriptor;
        let mut alloc = self.allocator_mut();
        descriptor.dispatcher().dispatch_not_empty_mut(&mut alloc, |i, mut stream| {
            let zeros = vec![0u64; descriptor.streams[i].blocks()];
            for _ in 0..count {
                stream.insert(idx, &zeros)?;
            }
            Ok(())
        })?;
        if let Some(slot) = descriptor.values_slot() {
            insert_ids(&mut alloc, slot, idx, &vec![BlockId::NIL; count])?;
        }
        Ok(())
    }

    /// Removes `[start, end)` and returns the sums of the removed entries.
    pub fn remove_space(&mut self, start: usize, end: usize) -> Result<Accumulator> {
        let size = self.size();
        if start > end || end > size {
            return Err(Error::invalid_operation(format!(
                "range {}..{} is out of bounds for size {}",
                start, end, size
            )));
        }
        let removed = self.sum(start, end);

        let descriptor = self.descriptor;
        let mut alloc = self.allocator_mut();
        descriptor
            .dispatcher()
            .dispatch_not_empty_mut(&mut alloc, |_, mut stream| stream.remove(start, end))?;
        if let Some(slot) = descriptor.values_slot() {
            remove_ids(&mut alloc, slot, start, end)?;
        }
        Ok(removed)
    }

    /// Removes entry `idx` and returns its keys.
    pub fn remove(&mut self, idx: usize) -> Result<Accumulator> {
        self.remove_space(idx, idx + 1)
    }

    /// Replaces the keys of entry `idx`.
    pub fn set_keys(&mut self, idx: usize, keys: &Accumulator) -> Result<()> {
        self.check_keys(keys)?;
        let size = self.size();
        if idx >= size {
            return Err(Error::invalid_operation(format!(
                "entry {} is out of range 0..{}",
                idx, size
            )));
        }
        // every stream's growth must fit before the first one is rewritten
        let growth = {
            let alloc = self.allocator();
            self.descriptor
                .dispatcher()
                .fold(&alloc, 0, |acc, i, stream| acc + stream.update_delta(idx, keys.stream(i)))
        };
        self.ensure_space(growth)?;

        let descriptor = self.descriptor;
        let mut alloc = self.allocator_mut();
        descriptor
            .dispatcher()
            .dispatch_not_empty_mut(&mut alloc, |i, mut stream| stream.update_values(idx, keys.stream(i)))
    }

    /// Adds signed per-stream, per-block deltas to the keys of entry `idx`.
    pub fn update_up(&mut self, idx: usize, delta: &[Vec<i64>]) -> Result<()> {
        let shape_ok = delta.len() == self.descriptor.stream_count()
            && delta
                .iter()
                .zip(&self.descriptor.streams)
                .all(|(d, spec)| d.len() == spec.blocks());
        if !shape_ok {
            return Err(Error::invalid_operation("key delta does not match the node layout"));
        }
        let size = self.size();
        if idx >= size {
            return Err(Error::invalid_operation(format!(
                "entry {} is out of range 0..{}",
                idx, size
            )));
        }
        self.ensure_space(self.max_insert_delta(1))?;

        let descriptor = self.descriptor;
        let mut alloc = self.allocator_mut();
        descriptor.dispatcher().dispatch_not_empty_mut(&mut alloc, |i, mut stream| {
            for (block, &d) in delta[i].iter().enumerate() {
                if d != 0 {
                    stream.add_value(block, idx, d)?;
                }
            }
            Ok(())
        })
    }

    pub fn set_child_id(&mut self, idx: usize, id: BlockId) -> Result<()> {
        let slot = self.values_slot()?;
        let count = self.children_count();
        if idx >= count {
            return Err(Error::invalid_operation(format!(
                "child index {} is out of range 0..{}",
                idx, count
            )));
        }
        let mut alloc = self.allocator_mut();
        bytes::write_u128(alloc.element_mut(slot), idx * ID_SIZE, id.raw());
        Ok(())
    }

    /// Moves entries `[idx, size)` to the front of `other` and returns their
    /// sums.
    pub fn split_to<B2>(&mut self, other: &mut TreeNode<'_, B2>, idx: usize) -> Result<Accumulator>
    where
        B2: AsRef<[u8]> + AsMut<[u8]>,
    {
        self.check_same_type(other)?;
        let size = self.size();
        if idx > size {
            return Err(Error::invalid_operation(format!(
                "split position {} is out of range 0..={}",
                idx, size
            )));
        }
        other.ensure_space(self.transfer_size(other, idx, size))?;
        other.layout(self.active_streams_mask())?;

        let moved = self.sum(idx, size);
        let descriptor = self.descriptor;
        let mut mine = self.allocator_mut();
        let mut theirs = other.allocator_mut();
        for (i, spec) in descriptor.streams.iter().enumerate() {
            let slot = descriptor.stream_slot(i);
            if mine.is_empty(slot) {
                continue;
            }
            let mut target = StreamMut::open(*spec, &mut theirs, slot);
            StreamMut::open(*spec, &mut mine, slot).split_to(&mut target, idx)?;
        }
        if let Some(slot) = descriptor.values_slot() {
            let tail = read_ids(mine.element(slot))[idx..].to_vec();
            insert_ids(&mut theirs, slot, 0, &tail)?;
            remove_ids(&mut mine, slot, idx, size)?;
        }
        tracing::trace!(node = %descriptor.name, at = idx, moved = size - idx, "split node");
        Ok(moved)
    }

    /// Appends all of `other`'s entries and leaves it empty.
    pub fn merge_with<B2>(&mut self, other: &mut TreeNode<'_, B2>) -> Result<()>
    where
        B2: AsRef<[u8]> + AsMut<[u8]>,
    {
        self.check_same_type(other)?;
        let count = other.size();
        self.ensure_space(other.transfer_size(self, 0, count))?;
        self.layout(other.active_streams_mask())?;

        let descriptor = self.descriptor;
        let mut mine = self.allocator_mut();
        let mut theirs = other.allocator_mut();
        for (i, spec) in descriptor.streams.iter().enumerate() {
            let slot = descriptor.stream_slot(i);
            if theirs.is_empty(slot) {
                continue;
            }
            let mut source = StreamMut::open(*spec, &mut theirs, slot);
            StreamMut::open(*spec, &mut mine, slot).merge_with(&mut source)?;
        }
        if let Some(slot) = descriptor.values_slot() {
            let incoming = read_ids(theirs.element(slot));
            let at = mine.element_size(slot) / ID_SIZE;
            insert_ids(&mut mine, slot, at, &incoming)?;
            remove_ids(&mut theirs, slot, 0, incoming.len())?;
        }
        tracing::trace!(node = %descriptor.name, merged = count, "merged node");
        Ok(())
    }

    /// Rebuilds the indexes of every stream.
    pub fn reindex(&mut self) -> Result<()> {
        let descriptor = self.descriptor;
        let mut alloc = self.allocator_mut();
        descriptor.dispatcher().dispatch_not_empty_mut(&mut alloc, |_, mut stream| {
            stream.reindex();
            Ok(())
        })
    }
}

impl<'d> TreeNode<'d, Vec<u8>> {
    /// Reads a node image, looking its type up in `registry`.
    pub fn deserialize(image: &[u8], registry: &'d NodeRegistry) -> Result<Self> {
        if image.len() < NODE_HEADER_SIZE {
            return Err(Error::corrupted("node image is shorter than its header"));
        }
        let header = NodeHeader::read(image);
        let descriptor = registry.get(header.node_type_hash)?;
        Self::open(image.to_vec(), descriptor)
    }

    /// Changes the block size of an owned node.
    pub fn resize(&mut self, new_block_size: usize) -> Result<()> {
        resize_node_data(&mut self.data, new_block_size)
    }
}

impl<'d> TreeNode<'d, &mut Vec<u8>> {
    /// Changes the block size of a node borrowed from a block.
    pub fn resize(&mut self, new_block_size: usize) -> Result<()> {
        resize_node_data(&mut *self.data, new_block_size)
    }
}

/// Grows or shrinks a node image in place, keeping every stream.
pub fn resize_node_data(data: &mut Vec<u8>, new_block_size: usize) -> Result<()> {
    if new_block_size < NODE_HEADER_SIZE {
        return Err(Error::capacity(NODE_HEADER_SIZE, new_block_size));
    }
    let region = new_block_size - NODE_HEADER_SIZE;
    if new_block_size >= data.len() {
        data.resize(new_block_size, 0);
        PackedAllocator::wrap(&mut data[NODE_HEADER_SIZE..]).set_block_size(region)
    } else {
        PackedAllocator::wrap(&mut data[NODE_HEADER_SIZE..]).set_block_size(region)?;
        data.truncate(new_block_size);
        Ok(())
    }
}

fn read_ids(bytes: &[u8]) -> Vec<BlockId> {
    (0..bytes.len() / ID_SIZE)
        .map(|i| BlockId::new(bytes::read_u128(bytes, i * ID_SIZE)))
        .collect()
}

fn insert_ids<B>(alloc: &mut PackedAllocator<B>, slot: usize, idx: usize, ids: &[BlockId]) -> Result<()>
where
    B: AsRef<[u8]> + AsMut<[u8]>,
{
    if ids.is_empty() {
        return Ok(());
    }
    let old = alloc.element(slot).to_vec();
    let at = idx * ID_SIZE;
    let mut new = Vec::with_capacity(old.len() + ids.len() * ID_SIZE);
    new.extend_from_slice(&old[..at]);
    for id in ids {
        new.extend_from_slice(&id.to_le_bytes());
    }
    new.extend_from_slice(&old[at..]);
    alloc.resize_block(slot, new.len())?;
    alloc.element_mut(slot).copy_from_slice(&new);
    Ok(())
}

fn remove_ids<B>(alloc: &mut PackedAllocator<B>, slot: usize, start: usize, end: usize) -> Result<()>
where
    B: AsRef<[u8]> + AsMut<[u8]>,
{
    if start == end {
        return Ok(());
    }
    let mut ids = alloc.element(slot).to_vec();
    ids.drain(start * ID_SIZE..end * ID_SIZE);
    alloc.resize_block(slot, ids.len())?;
    alloc.element_mut(slot).copy_from_slice(&ids);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{root_map_branch, NodeKind};
    use memoria_core::CtrId;
    use memoria_packed::StreamSpec;

    fn leaf_descriptor() -> NodeDescriptor {
        NodeDescriptor::leaf(
            "TestLeaf",
            vec![StreamSpec::VdTree { blocks: 1 }, StreamSpec::FSeq { blocks: 2 }],
        )
    }

    fn keys(a: u64, b: u64, c: u64) -> Accumulator {
        Accumulator::from_streams(vec![vec![a], vec![b, c]])
    }

    fn leaf(descriptor: &NodeDescriptor, block_size: usize) -> TreeNode<'_, Vec<u8>> {
        let mut node = TreeNode::init(vec![0u8; block_size], descriptor).unwrap();
        node.prepare().unwrap();
        node
    }

    fn filled(descriptor: &NodeDescriptor, n: u64) -> TreeNode<'_, Vec<u8>> {
        let mut node = leaf(descriptor, 4096);
        for i in 0..n {
            node.insert(i as usize, &keys(i + 1, i * 10, 100 - i), None).unwrap();
        }
        node
    }

    // ==================== Layout ====================

    #[test]
    fn test_init_is_unpopulated() {
        let descriptor = leaf_descriptor();
        let node = TreeNode::init(vec![0u8; 512], &descriptor).unwrap();
        assert!(node.is_leaf());
        assert!(!node.is_root());
        assert_eq!(node.active_streams_mask(), 0);
        assert!(node.stream(0).is_none());
        assert_eq!(node.size(), 0);
        node.check().unwrap();
    }

    #[test]
    fn test_layout_allocates_selected_streams() {
        let descriptor = leaf_descriptor();
        let mut node = TreeNode::init(vec![0u8; 512], &descriptor).unwrap();
        node.layout(0b10).unwrap();
        assert_eq!(node.active_streams_mask(), 0b10);
        node.prepare().unwrap();
        assert_eq!(node.active_streams_mask(), 0b11);
    }

    #[test]
    fn test_init_rejects_tiny_block() {
        let descriptor = leaf_descriptor();
        assert!(TreeNode::init(vec![0u8; 16], &descriptor).unwrap_err().is_capacity());
    }

    #[test]
    fn test_header_setters() {
        let descriptor = leaf_descriptor();
        let mut node = leaf(&descriptor, 512);
        node.set_root(true);
        node.set_level(2);
        node.set_parent_id(BlockId::new(9));
        node.set_parent_idx(4);
        let header = node.header();
        assert!(header.root);
        assert_eq!(header.level, 2);
        assert_eq!(header.parent_id, BlockId::new(9));
        assert_eq!(header.parent_idx, 4);
        assert_eq!(header.node_type_hash, descriptor.hash());
    }

    #[test]
    fn test_root_metadata() {
        let descriptor = leaf_descriptor();
        let mut node = leaf(&descriptor, 512);
        assert!(node.root_metadata().is_none());
        let meta = RootMetadata {
            ctr_id: CtrId::new(5),
            ctr_type_hash: 77,
            descriptor_hash: descriptor.hash(),
        };
        node.set_root_metadata(meta).unwrap();
        assert_eq!(node.root_metadata(), Some(meta));
        node.clear_root_metadata().unwrap();
        assert!(node.root_metadata().is_none());
    }

    // ==================== Insert / remove ====================

    #[test]
    fn test_insert_and_sums() {
        let descriptor = leaf_descriptor();
        let node = filled(&descriptor, 4);
        assert_eq!(node.size(), 4);
        assert_eq!(node.sums(), Accumulator::from_streams(vec![vec![10], vec![60, 394]]));
        assert_eq!(node.keys_at(2), keys(3, 20, 98));
        assert_eq!(node.max_keys(), keys(4, 30, 97));
        node.check().unwrap();
    }

    #[test]
    fn test_insert_rejects_child_on_leaf() {
        let descriptor = leaf_descriptor();
        let mut node = leaf(&descriptor, 512);
        let err = node.insert(0, &keys(1, 2, 3), Some(BlockId::new(1))).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation { .. }));
        assert!(node.insert(1, &keys(1, 2, 3), None).is_err());
    }

    #[test]
    fn test_remove_space_returns_sums() {
        let descriptor = leaf_descriptor();
        let mut node = filled(&descriptor, 6);
        let removed = node.remove_space(1, 3).unwrap();
        assert_eq!(removed, Accumulator::from_streams(vec![vec![5], vec![30, 197]]));
        assert_eq!(node.size(), 4);
        assert_eq!(node.keys_at(1), keys(4, 30, 97));
        node.check().unwrap();
    }

    #[test]
    fn test_insert_space() {
        let descriptor = leaf_descriptor();
        let mut node = filled(&descriptor, 2);
        node.insert_space(1, 3).unwrap();
        assert_eq!(node.size(), 5);
        assert_eq!(node.keys_at(2), keys(0, 0, 0));
        assert_eq!(node.keys_at(4), keys(2, 10, 99));
    }

    #[test]
    fn test_full_node_insert_leaves_streams_unchanged() {
        let descriptor = leaf_descriptor();
        let mut node = leaf(&descriptor, 256);
        let mut i = 0;
        while node.check_capacity(&keys(u64::MAX, i, i)) {
            node.insert(0, &keys(u64::MAX, i, i), None).unwrap();
            i += 1;
        }
        assert!(i > 0);
        let before = node.serialize();
        let err = node.insert(0, &keys(u64::MAX, i, i), None).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(node.serialize(), before);
    }

    // ==================== Updates and search ====================

    #[test]
    fn test_set_keys_and_update_up() {
        let descriptor = leaf_descriptor();
        let mut node = filled(&descriptor, 3);
        node.set_keys(1, &keys(50, 5, 5)).unwrap();
        assert_eq!(node.keys_at(1), keys(50, 5, 5));
        node.update_up(1, &[vec![-10], vec![1, 0]]).unwrap();
        assert_eq!(node.keys_at(1), keys(40, 6, 5));
        assert!(node.update_up(1, &[vec![1]]).is_err());
    }

    #[test]
    fn test_set_keys_on_full_node_is_all_or_nothing() {
        let descriptor = NodeDescriptor::leaf(
            "TwoTrees",
            vec![StreamSpec::VdTree { blocks: 1 }, StreamSpec::VdTree { blocks: 1 }],
        );
        let small = Accumulator::from_streams(vec![vec![1], vec![1]]);
        let mut node = leaf(&descriptor, 256);
        while node.check_capacity(&small) {
            let size = node.size();
            node.insert(size, &small, None).unwrap();
        }

        let mut failures = 0;
        for big in [200u64, 1 << 20, u64::MAX] {
            let wide = Accumulator::from_streams(vec![vec![big], vec![big]]);
            for idx in 0..node.size() {
                let before = node.as_bytes().to_vec();
                match node.set_keys(idx, &wide) {
                    Ok(()) => {
                        assert_eq!(node.keys_at(idx), wide);
                        node.set_keys(idx, &small).unwrap();
                    }
                    Err(err) => {
                        assert!(err.is_capacity());
                        assert_eq!(node.as_bytes(), &before[..], "entry {} big {}", idx, big);
                        failures += 1;
                    }
                }
            }
        }
        assert!(failures > 0);
        node.check().unwrap();
    }

    #[test]
    fn test_find() {
        let descriptor = leaf_descriptor();
        let node = filled(&descriptor, 4);
        // stream 0 holds 1, 2, 3, 4
        assert_eq!(node.find(0, 0, 0, 4, SearchType::Ge).unwrap(), WalkResult::new(2, 3));
        assert_eq!(node.find_bw(0, 0, 3, 4, SearchType::Ge).unwrap(), WalkResult::new(3, 0));
        assert!(node.find(2, 0, 0, 1, SearchType::Ge).is_err());
        assert!(node.find(1, 2, 0, 1, SearchType::Ge).is_err());
    }

    // ==================== Split / merge ====================

    #[test]
    fn test_split_returns_moved_sums() {
        let descriptor = leaf_descriptor();
        let mut left = filled(&descriptor, 10);
        let mut right = TreeNode::init(vec![0u8; 4096], &descriptor).unwrap();
        let total = left.sums();

        let moved = left.split_to(&mut right, 6).unwrap();
        assert_eq!(moved, right.sums());
        let mut rest = left.sums();
        rest.add_assign(&moved);
        assert_eq!(rest, total);
        assert_eq!(left.size(), 6);
        assert_eq!(right.size(), 4);
        assert_eq!(right.keys_at(0), keys(7, 60, 94));
        left.check().unwrap();
        right.check().unwrap();
    }

    #[test]
    fn test_split_merge_restores() {
        let descriptor = leaf_descriptor();
        let mut left = filled(&descriptor, 10);
        let mut right = leaf(&descriptor, 4096);
        let before = left.serialize();

        left.split_to(&mut right, 3).unwrap();
        assert!(left.can_be_merged_with(&right));
        left.merge_with(&mut right).unwrap();
        assert_eq!(right.size(), 0);
        assert_eq!(left.serialize(), before);
    }

    #[test]
    fn test_split_into_small_node_leaves_it_unpopulated() {
        let descriptor = leaf_descriptor();
        let mut left = filled(&descriptor, 10);
        let mut right = TreeNode::init(vec![0u8; 128], &descriptor).unwrap();
        let left_before = left.serialize();
        let right_before = right.as_bytes().to_vec();

        assert!(left.split_to(&mut right, 0).unwrap_err().is_capacity());
        assert_eq!(right.active_streams_mask(), 0);
        assert_eq!(right.as_bytes(), &right_before[..]);
        assert_eq!(left.serialize(), left_before);
    }

    #[test]
    fn test_merge_into_full_node_fails() {
        let descriptor = leaf_descriptor();
        let mut small = leaf(&descriptor, 200);
        while small.check_capacity(&keys(1, 1, 1)) {
            small.insert(0, &keys(1, 1, 1), None).unwrap();
        }
        let mut other = filled(&descriptor, 5);
        assert!(!small.can_be_merged_with(&other));
        let before = small.serialize();
        assert!(small.merge_with(&mut other).unwrap_err().is_capacity());
        assert_eq!(small.serialize(), before);
        assert_eq!(other.size(), 5);
    }

    #[test]
    fn test_should_be_merged_with_siblings() {
        let descriptor = leaf_descriptor();
        let node = filled(&descriptor, 2);
        assert!(node.should_be_merged_with_siblings());
    }

    // ==================== Branch nodes ====================

    #[test]
    fn test_branch_children_follow_entries() {
        let descriptor = root_map_branch();
        assert_eq!(descriptor.kind, NodeKind::Branch);
        let mut left = TreeNode::init(vec![0u8; 1024], &descriptor).unwrap();
        left.prepare().unwrap();
        for i in 0..6u64 {
            let k = Accumulator::from_streams(vec![vec![0, i * 10]]);
            left.insert(i as usize, &k, Some(BlockId::new(100 + i as u128))).unwrap();
        }
        assert!(left.insert(0, &Accumulator::from_streams(vec![vec![0, 1]]), None).is_err());
        assert_eq!(left.child_id(3).unwrap(), BlockId::new(103));

        let mut right = TreeNode::init(vec![0u8; 1024], &descriptor).unwrap();
        left.split_to(&mut right, 4).unwrap();
        assert_eq!(left.children(), vec![BlockId::new(100), BlockId::new(101), BlockId::new(102), BlockId::new(103)]);
        assert_eq!(right.children(), vec![BlockId::new(104), BlockId::new(105)]);
        right.check().unwrap();

        right.set_child_id(0, BlockId::new(7)).unwrap();
        right.remove(1).unwrap();
        assert_eq!(right.children(), vec![BlockId::new(7)]);

        left.merge_with(&mut right).unwrap();
        assert_eq!(left.size(), 5);
        assert_eq!(left.child_id(4).unwrap(), BlockId::new(7));
        assert!(right.children().is_empty());
        left.check().unwrap();
    }

    // ==================== Serialization ====================

    #[test]
    fn test_serialize_deserialize_through_registry() {
        let mut registry = NodeRegistry::with_builtin();
        registry.register(leaf_descriptor()).unwrap();
        let descriptor = leaf_descriptor();
        let node = filled(&descriptor, 5);
        let image = node.serialize();

        let restored = TreeNode::deserialize(&image, &registry).unwrap();
        assert_eq!(restored.descriptor().name, "TestLeaf");
        assert_eq!(restored.sums(), node.sums());
        restored.check().unwrap();
    }

    #[test]
    fn test_open_rejects_other_type() {
        let descriptor = leaf_descriptor();
        let node = filled(&descriptor, 1);
        let other = root_map_branch();
        assert!(TreeNode::open(node.serialize(), &other).is_err());
    }

    #[test]
    fn test_resize() {
        let descriptor = leaf_descriptor();
        let mut node = filled(&descriptor, 5);
        let sums = node.sums();
        node.resize(8192).unwrap();
        assert_eq!(node.block_size(), 8192);
        assert!(node.free_space() > 4096);
        node.resize(512).unwrap();
        assert_eq!(node.sums(), sums);
        node.check().unwrap();
        assert!(node.resize(64).unwrap_err().is_capacity());
    }

    #[test]
    fn test_dump() {
        let descriptor = leaf_descriptor();
        let node = filled(&descriptor, 2);
        let dump = node.dump();
        assert!(dump.starts_with("TestLeaf"));
        assert!(dump.contains("PkdVDTree size=2"));
        assert!(dump.contains("PkdFSeq size=2"));
    }
}
