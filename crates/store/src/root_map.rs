//! The container directory: a B-tree of node blocks mapping container ids
//! to root block ids.
//!
//! Leaves hold `(ctr_id, root_id)` pairs as two `FSeq{2}` streams; branches
//! hold the largest container id below each child. Nodes carry no parent
//! links; mutations remember the path from the root instead.

use crate::container::{read_node, update_node};
use crate::snapshot::Snapshot;
use memoria_bt::{root_map_branch, root_map_ctr_type_hash, root_map_leaf, Accumulator, NodeDescriptor, RootMetadata, TreeNode};
use memoria_core::{BlockId, CtrId, Error, Result};
use memoria_packed::SubStream;
use tracing::trace;

fn leaf_entry(ctr_id: CtrId, root: BlockId) -> Accumulator {
    let (ctr_hi, ctr_lo) = ctr_id.split();
    let (root_hi, root_lo) = root.split();
    Accumulator::from_streams(vec![vec![ctr_hi, ctr_lo], vec![root_hi, root_lo]])
}

fn branch_entry(max: CtrId) -> Accumulator {
    let (hi, lo) = max.split();
    Accumulator::from_streams(vec![vec![hi, lo]])
}

fn key_at<B: AsRef<[u8]>>(node: &TreeNode<'_, B>, idx: usize) -> CtrId {
    match node.stream(0) {
        Some(stream) => CtrId::join(stream.value(0, idx), stream.value(1, idx)),
        None => CtrId::NIL,
    }
}

fn value_at<B: AsRef<[u8]>>(node: &TreeNode<'_, B>, idx: usize) -> BlockId {
    match node.stream(1) {
        Some(stream) => BlockId::join(stream.value(0, idx), stream.value(1, idx)),
        None => BlockId::NIL,
    }
}

/// First entry whose key is not less than `key`.
fn lower_bound<B: AsRef<[u8]>>(node: &TreeNode<'_, B>, key: CtrId) -> usize {
    let (mut lo, mut hi) = (0, node.size());
    while lo < hi {
        let mid = (lo + hi) / 2;
        if key_at(node, mid) < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

enum Step {
    Leaf { pos: usize, found: Option<BlockId> },
    Branch { idx: usize, child: BlockId, past_end: bool },
}

fn step<B: AsRef<[u8]>>(node: &TreeNode<'_, B>, key: CtrId) -> Result<Step> {
    let pos = lower_bound(node, key);
    let size = node.size();
    if node.is_leaf() {
        let found = (pos < size && key_at(node, pos) == key).then(|| value_at(node, pos));
        return Ok(Step::Leaf { pos, found });
    }
    if size == 0 {
        return Err(Error::corrupted("container directory has an empty branch node"));
    }
    let idx = pos.min(size - 1);
    Ok(Step::Branch {
        idx,
        child: node.child_id(idx)?,
        past_end: pos == size,
    })
}

/// Container directory of one snapshot.
pub struct RootMap<'s> {
    snapshot: &'s Snapshot,
    leaf: NodeDescriptor,
    branch: NodeDescriptor,
}

impl<'s> RootMap<'s> {
    pub fn new(snapshot: &'s Snapshot) -> Self {
        Self {
            snapshot,
            leaf: root_map_leaf(),
            branch: root_map_branch(),
        }
    }

    fn root(&self) -> Result<BlockId> {
        self.snapshot.directory_root()
    }

    pub fn find(&self, ctr_id: CtrId) -> Result<Option<BlockId>> {
        let mut id = self.root()?;
        if id.is_nil() {
            return Ok(None);
        }
        loop {
            match read_node(self.snapshot, id, |node| step(node, ctr_id))? {
                Step::Leaf { found, .. } => return Ok(found),
                Step::Branch { past_end: true, .. } => return Ok(None),
                Step::Branch { child, .. } => id = child,
            }
        }
    }

    /// Inserts or replaces an entry; returns the previous root.
    pub fn assign(&self, ctr_id: CtrId, root_block: BlockId) -> Result<Option<BlockId>> {
        let root = self.root()?;
        if root.is_nil() {
            let leaf = self.new_node(true, 0)?;
            update_node(self.snapshot, leaf, |node| {
                node.set_root(true);
                node.set_root_metadata(self.metadata())?;
                node.insert(0, &leaf_entry(ctr_id, root_block), None)
            })?;
            self.snapshot.set_directory_root(leaf)?;
            return Ok(None);
        }

        let mut path: Vec<(BlockId, usize)> = Vec::new();
        let mut id = root;
        loop {
            match read_node(self.snapshot, id, |node| step(node, ctr_id))? {
                Step::Leaf { pos, found: Some(previous) } => {
                    update_node(self.snapshot, id, |node| node.set_keys(pos, &leaf_entry(ctr_id, root_block)))?;
                    return Ok(Some(previous));
                }
                Step::Leaf { pos, found: None } => {
                    self.insert_into(&mut path, id, pos, leaf_entry(ctr_id, root_block), None)?;
                    return Ok(None);
                }
                Step::Branch { idx, child, past_end } => {
                    if past_end {
                        update_node(self.snapshot, id, |node| node.set_keys(idx, &branch_entry(ctr_id)))?;
                    }
                    path.push((id, idx));
                    id = child;
                }
            }
        }
    }

    /// Removes an entry; returns its root.
    pub fn remove(&self, ctr_id: CtrId) -> Result<Option<BlockId>> {
        let root = self.root()?;
        if root.is_nil() {
            return Ok(None);
        }
        let mut path: Vec<(BlockId, usize)> = Vec::new();
        let mut id = root;
        loop {
            match read_node(self.snapshot, id, |node| step(node, ctr_id))? {
                Step::Leaf { found: None, .. } | Step::Branch { past_end: true, .. } => return Ok(None),
                Step::Leaf { pos, found: Some(previous) } => {
                    update_node(self.snapshot, id, |node| node.remove(pos).map(|_| ()))?;
                    self.rebalance(path, id)?;
                    return Ok(Some(previous));
                }
                Step::Branch { idx, child, .. } => {
                    path.push((id, idx));
                    id = child;
                }
            }
        }
    }

    /// All entries in ascending container id order.
    pub fn entries(&self) -> Result<Vec<(CtrId, BlockId)>> {
        let root = self.root()?;
        let mut out = Vec::new();
        if root.is_nil() {
            return Ok(out);
        }
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let children = read_node(self.snapshot, id, |node| {
                if node.is_leaf() {
                    out.extend((0..node.size()).map(|i| (key_at(node, i), value_at(node, i))));
                }
                Ok(node.children())
            })?;
            stack.extend(children.into_iter().rev());
        }
        Ok(out)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.root()?.is_nil())
    }

    fn metadata(&self) -> RootMetadata {
        RootMetadata {
            ctr_id: CtrId::NIL,
            ctr_type_hash: root_map_ctr_type_hash(),
            descriptor_hash: self.leaf.hash(),
        }
    }

    fn new_node(&self, leaf: bool, level: i32) -> Result<BlockId> {
        let descriptor = if leaf { &self.leaf } else { &self.branch };
        let handle = self.snapshot.create_block(0, root_map_ctr_type_hash())?;
        let init = self
            .snapshot
            .with_block_mut(&handle, |data| {
                let mut node = TreeNode::init(data, descriptor)?;
                node.set_level(level);
                node.prepare()
            })
            .and_then(|r| r);
        self.snapshot.release_block(handle)?;
        init?;
        Ok(handle.id)
    }

    fn max_key(&self, id: BlockId) -> Result<CtrId> {
        read_node(self.snapshot, id, |node| match node.size() {
            0 => Ok(CtrId::NIL),
            size => Ok(key_at(node, size - 1)),
        })
    }

    fn insert_into(
        &self,
        path: &mut Vec<(BlockId, usize)>,
        id: BlockId,
        pos: usize,
        entry: Accumulator,
        child: Option<BlockId>,
    ) -> Result<()> {
        match update_node(self.snapshot, id, |node| node.insert(pos, &entry, child)) {
            Err(err) if err.is_capacity() => {}
            other => return other,
        }

        let (right, left_size) = self.split(id)?;
        if pos < left_size {
            update_node(self.snapshot, id, |node| node.insert(pos, &entry, child))?;
        } else {
            update_node(self.snapshot, right, |node| node.insert(pos - left_size, &entry, child))?;
        }
        self.link_sibling(path, id, right)
    }

    /// Moves the upper half of `id` into a new sibling.
    fn split(&self, id: BlockId) -> Result<(BlockId, usize)> {
        let (leaf, level, size) = read_node(self.snapshot, id, |node| Ok((node.is_leaf(), node.level(), node.size())))?;
        let right = self.new_node(leaf, level)?;
        let at = size / 2;
        let descriptor = if leaf { &self.leaf } else { &self.branch };

        let left_handle = self.snapshot.get_block(id)?;
        let right_handle = self.snapshot.get_block(right)?;
        let result = self.snapshot.update_block(&left_handle).and_then(|left| {
            self.snapshot
                .with_blocks_mut(&left, &right_handle, |l, r| {
                    let mut left_node = TreeNode::open(l, descriptor)?;
                    let mut right_node = TreeNode::open(r, descriptor)?;
                    left_node.split_to(&mut right_node, at).map(|_| ())
                })
                .and_then(|r| r)
        });
        self.snapshot.release_block(left_handle)?;
        self.snapshot.release_block(right_handle)?;
        result?;
        trace!(snapshot = %self.snapshot.id(), node = %id, sibling = %right, at, "split directory node");
        Ok((right, at))
    }

    fn link_sibling(&self, path: &mut Vec<(BlockId, usize)>, left: BlockId, right: BlockId) -> Result<()> {
        let left_max = self.max_key(left)?;
        let right_max = self.max_key(right)?;
        match path.pop() {
            None => self.grow_root(left, left_max, right, right_max),
            Some((parent, idx)) => {
                update_node(self.snapshot, parent, |node| node.set_keys(idx, &branch_entry(left_max)))?;
                self.insert_into(path, parent, idx + 1, branch_entry(right_max), Some(right))
            }
        }
    }

    fn grow_root(&self, left: BlockId, left_max: CtrId, right: BlockId, right_max: CtrId) -> Result<()> {
        let level = read_node(self.snapshot, left, |node| Ok(node.level()))?;
        let meta = read_node(self.snapshot, left, |node| Ok(node.root_metadata()))?;
        let root = self.new_node(false, level + 1)?;
        update_node(self.snapshot, root, |node| {
            node.set_root(true);
            node.set_root_metadata(meta.unwrap_or_else(|| self.metadata()))?;
            node.insert(0, &branch_entry(left_max), Some(left))?;
            node.insert(1, &branch_entry(right_max), Some(right))
        })?;
        update_node(self.snapshot, left, |node| {
            node.set_root(false);
            node.clear_root_metadata()
        })?;
        self.snapshot.set_directory_root(root)?;
        trace!(snapshot = %self.snapshot.id(), root = %root, level = level + 1, "directory grew a level");
        Ok(())
    }

    /// Fixes keys and drops empty nodes on the way from `id` to the root.
    fn rebalance(&self, mut path: Vec<(BlockId, usize)>, id: BlockId) -> Result<()> {
        let mut id = id;
        while let Some((parent, idx)) = path.pop() {
            let size = read_node(self.snapshot, id, |node| Ok(node.size()))?;
            if size == 0 {
                update_node(self.snapshot, parent, |node| node.remove(idx).map(|_| ()))?;
                self.snapshot.remove_block(id)?;
            } else {
                let max = self.max_key(id)?;
                update_node(self.snapshot, parent, |node| node.set_keys(idx, &branch_entry(max)))?;
            }
            id = parent;
        }
        self.shrink_root(id)
    }

    fn shrink_root(&self, root: BlockId) -> Result<()> {
        let mut root = root;
        loop {
            let (leaf, size) = read_node(self.snapshot, root, |node| Ok((node.is_leaf(), node.size())))?;
            if size == 0 {
                self.snapshot.remove_block(root)?;
                return self.snapshot.set_directory_root(BlockId::NIL);
            }
            if leaf || size > 1 {
                return Ok(());
            }
            let (child, meta) = read_node(self.snapshot, root, |node| Ok((node.child_id(0)?, node.root_metadata())))?;
            let promoted = update_node(self.snapshot, child, |node| {
                node.set_root_metadata(meta.unwrap_or_else(|| self.metadata()))?;
                node.set_root(true);
                Ok(())
            });
            match promoted {
                // a full child can't take the metadata, keep the extra level
                Err(err) if err.is_capacity() => return Ok(()),
                other => other?,
            }
            self.snapshot.remove_block(root)?;
            self.snapshot.set_directory_root(child)?;
            root = child;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStore, StoreConfig};

    fn store() -> MemoryStore {
        MemoryStore::new(StoreConfig::default().with_block_size(512)).unwrap()
    }

    fn root_of(i: u128) -> BlockId {
        BlockId::new(0xB000 + i)
    }

    #[test]
    fn test_empty_directory() {
        let store = store();
        let snap = store.master().unwrap().branch().unwrap();
        let map = RootMap::new(&snap);
        assert!(map.is_empty().unwrap());
        assert_eq!(map.find(CtrId::new(1)).unwrap(), None);
        assert_eq!(map.remove(CtrId::new(1)).unwrap(), None);
        assert!(map.entries().unwrap().is_empty());
    }

    #[test]
    fn test_assign_find_replace() {
        let store = store();
        let snap = store.master().unwrap().branch().unwrap();
        let map = RootMap::new(&snap);
        assert_eq!(map.assign(CtrId::new(5), root_of(5)).unwrap(), None);
        assert_eq!(map.assign(CtrId::new(2), root_of(2)).unwrap(), None);
        assert_eq!(map.assign(CtrId::new(5), root_of(50)).unwrap(), Some(root_of(5)));
        assert_eq!(map.find(CtrId::new(5)).unwrap(), Some(root_of(50)));
        assert_eq!(map.find(CtrId::new(3)).unwrap(), None);
        assert_eq!(
            map.entries().unwrap(),
            vec![(CtrId::new(2), root_of(2)), (CtrId::new(5), root_of(50))]
        );
    }

    #[test]
    fn test_many_entries_split_and_collapse() {
        let store = store();
        let snap = store.master().unwrap().branch().unwrap();
        let map = RootMap::new(&snap);
        // large ids first, then small ones, so both ends of the nodes grow
        let ids: Vec<u128> = (1..=120u128).rev().chain(121..=200).collect();
        for &i in &ids {
            map.assign(CtrId::new(i * 7), root_of(i)).unwrap();
        }
        assert!(snap.block_count().unwrap() > 3);
        assert!(!snap.check().unwrap());
        for i in 1..=200u128 {
            assert_eq!(map.find(CtrId::new(i * 7)).unwrap(), Some(root_of(i)), "ctr {}", i);
        }
        let entries = map.entries().unwrap();
        assert_eq!(entries.len(), 200);
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));

        for i in (1..=200u128).filter(|i| i % 3 != 0) {
            assert_eq!(map.remove(CtrId::new(i * 7)).unwrap(), Some(root_of(i)));
        }
        assert_eq!(map.len().unwrap(), 66);
        assert!(!snap.check().unwrap());
        for i in 1..=200u128 {
            let expected = (i % 3 == 0).then(|| root_of(i));
            assert_eq!(map.find(CtrId::new(i * 7)).unwrap(), expected);
        }

        for i in (1..=200u128).filter(|i| i % 3 == 0) {
            map.remove(CtrId::new(i * 7)).unwrap();
        }
        assert!(map.is_empty().unwrap());
        assert_eq!(snap.block_count().unwrap(), 0);
    }

    #[test]
    fn test_directory_is_copied_on_write() {
        let store = store();
        let first = store.master().unwrap().branch().unwrap();
        RootMap::new(&first).assign(CtrId::new(1), root_of(1)).unwrap();
        first.commit().unwrap();

        let second = first.branch().unwrap();
        RootMap::new(&second).assign(CtrId::new(2), root_of(2)).unwrap();
        assert_eq!(RootMap::new(&first).len().unwrap(), 1);
        assert_eq!(RootMap::new(&second).len().unwrap(), 2);
    }
}
