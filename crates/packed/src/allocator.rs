//! Packed allocator: one fixed-size byte region split into resizable streams.
//!
//! # Layout
//!
//! ```text
//! +------------+---------+----------------------+-----------------+---------+-----------+
//! | block_size | streams | layout[streams + 1]  | kinds[streams]  | padding | data area |
//! | u32        | u32     | u32 each             | u8 each         | to 8    |           |
//! +------------+---------+----------------------+-----------------+---------+-----------+
//! ```
//!
//! Stream `i` occupies `[layout[i], layout[i + 1])` of the data area. Stream
//! lengths are always multiples of [`ALIGNMENT`]. Resizing a stream shifts
//! every later stream and rewrites the layout table; nothing outside the
//! region moves, so typed views must be re-created after every resize.

use alloc::format;
use alloc::vec;
use alloc::vec::Vec;
use memoria_core::bytes::{self, align8, ALIGNMENT};
use memoria_core::{Error, Result};

const BLOCK_SIZE_OFFSET: usize = 0;
const STREAMS_OFFSET: usize = 4;
const LAYOUT_OFFSET: usize = 8;

/// What a stream currently holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementKind {
    /// Nothing is allocated.
    Empty,
    /// A packed structure with its own header.
    Packed,
    /// Raw memory, e.g. a flat array.
    Raw,
}

impl ElementKind {
    fn tag(self) -> u8 {
        match self {
            ElementKind::Empty => 0,
            ElementKind::Packed => 1,
            ElementKind::Raw => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ElementKind::Empty),
            1 => Some(ElementKind::Packed),
            2 => Some(ElementKind::Raw),
            _ => None,
        }
    }
}

/// A view over a packed allocator region.
///
/// `B` is the backing buffer: `Vec<u8>` for an owned region, `&[u8]` or
/// `&mut [u8]` for a region embedded in a larger block.
#[derive(Debug, Clone)]
pub struct PackedAllocator<B> {
    buf: B,
}

/// Size of the allocator header for the given number of streams.
pub const fn header_size(streams: usize) -> usize {
    align8(LAYOUT_OFFSET + 4 * (streams + 1) + streams)
}

impl PackedAllocator<Vec<u8>> {
    /// Creates an owned, zeroed allocator region of `block_size` bytes.
    pub fn new(block_size: usize, streams: usize) -> Result<Self> {
        Self::init(vec![0u8; block_size], streams)
    }

    /// Decodes a serialized region, validating its header.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Self::open(bytes.to_vec())
    }
}

impl<B: AsRef<[u8]>> PackedAllocator<B> {
    /// Opens an existing region, validating its header.
    pub fn open(buf: B) -> Result<Self> {
        let alloc = Self { buf };
        alloc.check()?;
        Ok(alloc)
    }

    /// Wraps a region whose header is trusted (it was validated when the
    /// enclosing block was loaded).
    pub fn wrap(buf: B) -> Self {
        Self { buf }
    }

    /// Returns the backing buffer.
    pub fn into_inner(self) -> B {
        self.buf
    }

    /// Returns the raw region bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// Total size of the region in bytes.
    pub fn block_size(&self) -> usize {
        bytes::read_u32(self.as_bytes(), BLOCK_SIZE_OFFSET) as usize
    }

    /// Number of stream slots.
    pub fn streams(&self) -> usize {
        bytes::read_u32(self.as_bytes(), STREAMS_OFFSET) as usize
    }

    /// Size of the header of this region.
    pub fn header_size(&self) -> usize {
        header_size(self.streams())
    }

    /// Bytes available for streams.
    pub fn client_area(&self) -> usize {
        self.block_size() - self.header_size()
    }

    /// Bytes currently used by streams.
    pub fn allocated(&self) -> usize {
        self.layout(self.streams())
    }

    /// Bytes still available for stream growth.
    pub fn free_space(&self) -> usize {
        self.client_area() - self.allocated()
    }

    fn layout(&self, idx: usize) -> usize {
        bytes::read_u32(self.as_bytes(), LAYOUT_OFFSET + idx * 4) as usize
    }

    fn kinds_offset(&self) -> usize {
        LAYOUT_OFFSET + 4 * (self.streams() + 1)
    }

    /// Absolute offset of a stream inside the region.
    pub fn element_offset(&self, idx: usize) -> usize {
        self.header_size() + self.layout(idx)
    }

    /// Size of a stream in bytes.
    pub fn element_size(&self, idx: usize) -> usize {
        self.layout(idx + 1) - self.layout(idx)
    }

    /// What the stream holds.
    pub fn kind(&self, idx: usize) -> ElementKind {
        let tag = bytes::read_u8(self.as_bytes(), self.kinds_offset() + idx);
        ElementKind::from_tag(tag).unwrap_or(ElementKind::Empty)
    }

    /// Returns true if nothing is allocated in the stream.
    pub fn is_empty(&self, idx: usize) -> bool {
        self.kind(idx) == ElementKind::Empty
    }

    /// Bytes of a stream.
    pub fn element(&self, idx: usize) -> &[u8] {
        let start = self.element_offset(idx);
        let len = self.element_size(idx);
        &self.as_bytes()[start..start + len]
    }

    /// Serialized form of the region.
    pub fn serialize(&self) -> Vec<u8> {
        self.as_bytes()[..self.block_size()].to_vec()
    }

    /// Validates header consistency.
    pub fn check(&self) -> Result<()> {
        let buf = self.as_bytes();
        if buf.len() < LAYOUT_OFFSET {
            return Err(Error::corrupted("allocator region is shorter than its header"));
        }
        let streams = self.streams();
        let block_size = self.block_size();
        if header_size(streams) > block_size || block_size > buf.len() {
            return Err(Error::corrupted(format!(
                "allocator header does not fit: {} streams, block size {}, buffer {}",
                streams,
                block_size,
                buf.len()
            )));
        }
        if self.layout(0) != 0 {
            return Err(Error::corrupted("allocator layout does not start at zero"));
        }
        for idx in 0..streams {
            let (start, end) = (self.layout(idx), self.layout(idx + 1));
            if end < start || end % ALIGNMENT != 0 {
                return Err(Error::corrupted(format!(
                    "allocator stream {} has invalid bounds {}..{}",
                    idx, start, end
                )));
            }
            let tag = bytes::read_u8(buf, self.kinds_offset() + idx);
            if ElementKind::from_tag(tag).is_none() {
                return Err(Error::corrupted(format!(
                    "allocator stream {} has unknown kind {}",
                    idx, tag
                )));
            }
        }
        if self.allocated() > self.client_area() {
            return Err(Error::corrupted("allocator streams exceed the client area"));
        }
        Ok(())
    }
}

impl<'a> PackedAllocator<&'a [u8]> {
    /// Bytes of a stream, borrowed for the lifetime of the region rather
    /// than of the view.
    pub fn element_slice(&self, idx: usize) -> &'a [u8] {
        let start = self.element_offset(idx);
        let len = self.element_size(idx);
        let buf: &'a [u8] = self.buf;
        &buf[start..start + len]
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> PackedAllocator<B> {
    /// Initializes an empty region over the whole buffer.
    pub fn init(mut buf: B, streams: usize) -> Result<Self> {
        let block_size = buf.as_ref().len();
        let header = header_size(streams);
        if header > block_size {
            return Err(Error::capacity(header, block_size));
        }
        let data = buf.as_mut();
        data[..header].fill(0);
        bytes::write_u32(data, BLOCK_SIZE_OFFSET, block_size as u32);
        bytes::write_u32(data, STREAMS_OFFSET, streams as u32);
        Ok(Self { buf })
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    fn set_layout(&mut self, idx: usize, value: usize) {
        bytes::write_u32(self.bytes_mut(), LAYOUT_OFFSET + idx * 4, value as u32);
    }

    fn set_kind(&mut self, idx: usize, kind: ElementKind) {
        let pos = self.kinds_offset() + idx;
        bytes::write_u8(self.bytes_mut(), pos, kind.tag());
    }

    /// Mutable bytes of a stream.
    pub fn element_mut(&mut self, idx: usize) -> &mut [u8] {
        let start = self.element_offset(idx);
        let len = self.element_size(idx);
        &mut self.bytes_mut()[start..start + len]
    }

    /// Allocates (or re-allocates) a stream with the given size and kind.
    /// The stream content is zeroed.
    pub fn allocate(&mut self, idx: usize, size: usize, kind: ElementKind) -> Result<()> {
        self.resize_block(idx, size)?;
        self.element_mut(idx).fill(0);
        self.set_kind(idx, kind);
        Ok(())
    }

    /// Allocates a packed structure in its empty state.
    pub fn allocate_empty(&mut self, idx: usize, empty_size: usize) -> Result<()> {
        self.allocate(idx, empty_size, ElementKind::Packed)
    }

    /// Resizes one stream in place, shifting every later stream.
    ///
    /// Fails with a capacity error, leaving the region untouched, when the
    /// growth does not fit into the free space.
    pub fn resize_block(&mut self, idx: usize, new_size: usize) -> Result<()> {
        let new_size = align8(new_size);
        let old_size = self.element_size(idx);
        if new_size == old_size {
            return Ok(());
        }

        let streams = self.streams();
        let header = self.header_size();
        let next_start = header + self.layout(idx + 1);
        let data_end = header + self.allocated();

        if new_size > old_size {
            let delta = new_size - old_size;
            let free = self.free_space();
            if delta > free {
                tracing::trace!(stream = idx, requested = delta, available = free, "packed allocator is full");
                return Err(Error::capacity(delta, free));
            }
            let buf = self.bytes_mut();
            buf.copy_within(next_start..data_end, next_start + delta);
            buf[next_start..next_start + delta].fill(0);
            for slot in idx + 1..=streams {
                let v = self.layout(slot) + delta;
                self.set_layout(slot, v);
            }
        } else {
            let delta = old_size - new_size;
            let buf = self.bytes_mut();
            buf.copy_within(next_start..data_end, next_start - delta);
            buf[data_end - delta..data_end].fill(0);
            for slot in idx + 1..=streams {
                let v = self.layout(slot) - delta;
                self.set_layout(slot, v);
            }
        }
        Ok(())
    }

    /// Releases a stream.
    pub fn free(&mut self, idx: usize) -> Result<()> {
        self.resize_block(idx, 0)?;
        self.set_kind(idx, ElementKind::Empty);
        Ok(())
    }

    /// Streams are always contiguous, so there is nothing to compact; returns
    /// the number of allocated bytes.
    pub fn pack(&mut self) -> usize {
        self.allocated()
    }

    /// Changes the size of the whole region.
    ///
    /// The backing buffer must already be at least `new_size` bytes long and
    /// the new size must still hold every allocated stream.
    pub fn set_block_size(&mut self, new_size: usize) -> Result<()> {
        let required = self.header_size() + self.allocated();
        if new_size < required {
            return Err(Error::capacity(required, new_size));
        }
        if new_size > self.as_bytes().len() {
            return Err(Error::invalid_operation(format!(
                "region size {} exceeds the buffer length {}",
                new_size,
                self.as_bytes().len()
            )));
        }
        bytes::write_u32(self.bytes_mut(), BLOCK_SIZE_OFFSET, new_size as u32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_empty() {
        let alloc = PackedAllocator::new(256, 3).unwrap();
        assert_eq!(alloc.streams(), 3);
        assert_eq!(alloc.block_size(), 256);
        assert_eq!(alloc.header_size(), 32);
        assert_eq!(alloc.free_space(), 224);
        for i in 0..3 {
            assert!(alloc.is_empty(i));
            assert_eq!(alloc.element_size(i), 0);
        }
    }

    #[test]
    fn test_allocate_rounds_to_alignment() {
        let mut alloc = PackedAllocator::new(256, 2).unwrap();
        alloc.allocate(0, 13, ElementKind::Raw).unwrap();
        assert_eq!(alloc.element_size(0), 16);
        assert_eq!(alloc.kind(0), ElementKind::Raw);
        assert_eq!(alloc.allocated(), 16);
    }

    #[test]
    fn test_resize_preserves_other_streams() {
        let mut alloc = PackedAllocator::new(512, 3).unwrap();
        alloc.allocate(0, 16, ElementKind::Raw).unwrap();
        alloc.allocate(1, 16, ElementKind::Raw).unwrap();
        alloc.allocate(2, 16, ElementKind::Raw).unwrap();
        alloc.element_mut(0).fill(1);
        alloc.element_mut(1).fill(2);
        alloc.element_mut(2).fill(3);

        alloc.resize_block(1, 64).unwrap();
        assert!(alloc.element(0).iter().all(|&b| b == 1));
        assert_eq!(&alloc.element(1)[..16], &[2u8; 16]);
        assert!(alloc.element(1)[16..].iter().all(|&b| b == 0));
        assert!(alloc.element(2).iter().all(|&b| b == 3));

        alloc.resize_block(1, 8).unwrap();
        assert_eq!(alloc.element(1), &[2u8; 8]);
        assert!(alloc.element(2).iter().all(|&b| b == 3));
        assert_eq!(alloc.allocated(), 40);
    }

    #[test]
    fn test_failed_grow_leaves_region_untouched() {
        let mut alloc = PackedAllocator::new(64, 1).unwrap();
        alloc.allocate(0, 8, ElementKind::Raw).unwrap();
        alloc.element_mut(0).fill(9);
        let before = alloc.serialize();

        let err = alloc.resize_block(0, 1024).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(alloc.serialize(), before);
    }

    #[test]
    fn test_free() {
        let mut alloc = PackedAllocator::new(128, 2).unwrap();
        alloc.allocate(0, 24, ElementKind::Packed).unwrap();
        alloc.allocate(1, 8, ElementKind::Raw).unwrap();
        alloc.free(0).unwrap();
        assert!(alloc.is_empty(0));
        assert_eq!(alloc.element_size(1), 8);
        assert_eq!(alloc.allocated(), 8);
    }

    #[test]
    fn test_serialize_deserialize() {
        let mut alloc = PackedAllocator::new(128, 2).unwrap();
        alloc.allocate(1, 8, ElementKind::Raw).unwrap();
        alloc.element_mut(1).copy_from_slice(b"memoria!");
        let bytes = alloc.serialize();

        let restored = PackedAllocator::deserialize(&bytes).unwrap();
        assert_eq!(restored.element(1), b"memoria!");
        assert!(restored.is_empty(0));
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        let mut bytes = PackedAllocator::new(64, 1).unwrap().serialize();
        bytes::write_u32(&mut bytes, LAYOUT_OFFSET + 4, 3);
        assert!(PackedAllocator::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_embedded_region() {
        let mut block = [0u8; 96];
        {
            let mut alloc = PackedAllocator::init(&mut block[32..], 1).unwrap();
            alloc.allocate(0, 8, ElementKind::Raw).unwrap();
            alloc.element_mut(0)[0] = 42;
        }
        let alloc = PackedAllocator::open(&block[32..]).unwrap();
        assert_eq!(alloc.block_size(), 64);
        assert_eq!(alloc.element(0)[0], 42);
    }

    #[test]
    fn test_set_block_size() {
        let mut alloc = PackedAllocator::new(128, 1).unwrap();
        alloc.allocate(0, 64, ElementKind::Raw).unwrap();
        assert!(alloc.set_block_size(40).is_err());
        alloc.set_block_size(96).unwrap();
        assert_eq!(alloc.free_space(), 96 - 24 - 64);
    }
}
