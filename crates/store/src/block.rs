//! Blocks and the reference-counted block arena.
//!
//! Every block version lives in the store's [`BlockArena`], keyed by its
//! guid. The count of a version is the number of persistent tree leaf slots
//! that point at it; a version is reclaimed as soon as its count drops to
//! zero.

use hashbrown::HashMap;
use memoria_core::{BlockGuid, BlockId};

/// One version of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: BlockId,
    pub guid: BlockGuid,
    pub ctr_type_hash: u64,
    pub data: Vec<u8>,
}

impl Block {
    /// A zero-filled block.
    pub fn new(id: BlockId, guid: BlockGuid, ctr_type_hash: u64, size: usize) -> Self {
        Self {
            id,
            guid,
            ctr_type_hash,
            data: vec![0; size],
        }
    }

    pub fn memory_block_size(&self) -> usize {
        self.data.len()
    }

    /// A copy of this block under a new guid.
    pub fn clone_as(&self, guid: BlockGuid) -> Self {
        Self {
            guid,
            ..self.clone()
        }
    }
}

/// How a snapshot holds a checked-out block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// Shared with other snapshots, must be cloned before mutation.
    Read,
    /// Private to the snapshot.
    Update,
    /// Removal is deferred until the last release.
    Delete,
}

/// A checked-out block. Data is accessed through the owning snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHandle {
    pub id: BlockId,
    pub guid: BlockGuid,
    pub state: BlockState,
}

impl BlockHandle {
    pub fn is_updatable(&self) -> bool {
        self.state == BlockState::Update
    }
}

#[derive(Debug)]
struct ArenaEntry {
    block: Block,
    refs: usize,
}

/// Owner of every block version of a store.
#[derive(Debug, Default)]
pub struct BlockArena {
    blocks: HashMap<BlockGuid, ArenaEntry>,
}

impl BlockArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a block with a count of zero.
    ///
    /// # Panics
    ///
    /// Panics if the guid is already taken.
    pub fn insert(&mut self, block: Block) -> BlockGuid {
        let guid = block.guid;
        let previous = self.blocks.insert(guid, ArenaEntry { block, refs: 0 });
        assert!(previous.is_none(), "block guid {} is already in the arena", guid);
        guid
    }

    pub fn get(&self, guid: BlockGuid) -> Option<&Block> {
        self.blocks.get(&guid).map(|e| &e.block)
    }

    pub fn get_mut(&mut self, guid: BlockGuid) -> Option<&mut Block> {
        self.blocks.get_mut(&guid).map(|e| &mut e.block)
    }

    /// Two distinct blocks at once.
    pub fn get_pair_mut(&mut self, a: BlockGuid, b: BlockGuid) -> Option<(&mut Block, &mut Block)> {
        let [x, y] = self.blocks.get_many_mut([&a, &b])?;
        Some((&mut x.block, &mut y.block))
    }

    pub fn contains(&self, guid: BlockGuid) -> bool {
        self.blocks.contains_key(&guid)
    }

    pub fn ref_count(&self, guid: BlockGuid) -> Option<usize> {
        self.blocks.get(&guid).map(|e| e.refs)
    }

    /// # Panics
    ///
    /// Panics if the guid is unknown.
    pub fn ref_block(&mut self, guid: BlockGuid) {
        match self.blocks.get_mut(&guid) {
            Some(entry) => entry.refs += 1,
            None => panic!("reference to unknown block {}", guid),
        }
    }

    /// Drops one reference; returns true if the block was reclaimed.
    ///
    /// # Panics
    ///
    /// Panics on an unknown guid or a count that is already zero.
    pub fn unref_block(&mut self, guid: BlockGuid) -> bool {
        let entry = match self.blocks.get_mut(&guid) {
            Some(entry) => entry,
            None => panic!("release of unknown block {}", guid),
        };
        assert!(entry.refs > 0, "reference count underflow for block {}", guid);
        entry.refs -= 1;
        if entry.refs == 0 {
            self.blocks.remove(&guid);
            tracing::trace!(block = %guid, "reclaimed block");
            true
        } else {
            false
        }
    }

    /// Drops a block nothing refers to yet.
    pub fn discard(&mut self, guid: BlockGuid) {
        if let Some(entry) = self.blocks.get(&guid) {
            if entry.refs == 0 {
                self.blocks.remove(&guid);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Bytes held by all versions.
    pub fn total_bytes(&self) -> usize {
        self.blocks.values().map(|e| e.block.memory_block_size()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(raw: u128) -> Block {
        Block::new(BlockId::new(raw), BlockGuid::new(raw), 0, 64)
    }

    #[test]
    fn test_refcounts() {
        let mut arena = BlockArena::new();
        let guid = arena.insert(block(1));
        assert_eq!(arena.ref_count(guid), Some(0));
        arena.ref_block(guid);
        arena.ref_block(guid);
        assert!(!arena.unref_block(guid));
        assert!(arena.unref_block(guid));
        assert!(!arena.contains(guid));
        assert!(arena.is_empty());
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn test_underflow_panics() {
        let mut arena = BlockArena::new();
        let guid = arena.insert(block(1));
        arena.unref_block(guid);
    }

    #[test]
    fn test_pair_and_bytes() {
        let mut arena = BlockArena::new();
        let a = arena.insert(block(1));
        let b = arena.insert(block(2));
        let (x, y) = arena.get_pair_mut(a, b).unwrap();
        x.data[0] = 1;
        y.data[0] = 2;
        assert_eq!(arena.get(b).unwrap().data[0], 2);
        assert!(arena.get_pair_mut(a, a).is_none());
        assert_eq!(arena.total_bytes(), 128);
    }

    #[test]
    fn test_clone_as_keeps_id() {
        let original = block(5);
        let copy = original.clone_as(BlockGuid::new(9));
        assert_eq!(copy.id, original.id);
        assert_eq!(copy.guid, BlockGuid::new(9));
        assert_eq!(copy.data, original.data);
    }
}
