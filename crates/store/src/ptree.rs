//! Persistent `BlockId -> PTreeValue` tree shared between snapshots.
//!
//! The tree is an immutable B+tree of `Arc` nodes. Forking a tree clones the
//! root pointer; writes copy the shared part of the path they touch. Leaves
//! hold the block references: copying a leaf adds one reference to every
//! block it lists, and freeing a leaf that nobody else shares drops them.

use crate::block::BlockArena;
use memoria_core::{BlockGuid, BlockId, SnapshotId};
use std::sync::Arc;

/// A block version and the snapshot that wrote it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PTreeValue {
    pub guid: BlockGuid,
    pub snapshot_id: SnapshotId,
}

impl PTreeValue {
    pub fn new(guid: BlockGuid, snapshot_id: SnapshotId) -> Self {
        Self { guid, snapshot_id }
    }
}

#[derive(Clone, Debug)]
enum PNode {
    Leaf(Vec<(BlockId, PTreeValue)>),
    /// Children with the largest key each of them holds.
    Branch(Vec<(BlockId, Arc<PNode>)>),
}

impl PNode {
    fn len(&self) -> usize {
        match self {
            PNode::Leaf(entries) => entries.len(),
            PNode::Branch(children) => children.len(),
        }
    }

    fn max_key(&self) -> Option<BlockId> {
        match self {
            PNode::Leaf(entries) => entries.last().map(|(k, _)| *k),
            PNode::Branch(children) => children.last().map(|(k, _)| *k),
        }
    }

    fn split_off(&mut self, at: usize) -> PNode {
        match self {
            PNode::Leaf(entries) => PNode::Leaf(entries.split_off(at)),
            PNode::Branch(children) => PNode::Branch(children.split_off(at)),
        }
    }
}

/// Copies `node` if it is shared and returns it for writing.
fn make_mut<'a>(node: &'a mut Arc<PNode>, arena: &mut BlockArena) -> &'a mut PNode {
    if Arc::strong_count(node) > 1 {
        if let PNode::Leaf(entries) = node.as_ref() {
            for (_, value) in entries {
                arena.ref_block(value.guid);
            }
        }
    }
    Arc::make_mut(node)
}

/// Index of the child that may hold `key`.
fn route(children: &[(BlockId, Arc<PNode>)], key: BlockId) -> usize {
    let idx = children.partition_point(|(max, _)| *max < key);
    idx.min(children.len().saturating_sub(1))
}

/// Frees a node this tree owns exclusively; returns the number of
/// reclaimed blocks.
fn release_node(node: Arc<PNode>, arena: &mut BlockArena) -> usize {
    match Arc::try_unwrap(node) {
        Ok(PNode::Leaf(entries)) => entries
            .iter()
            .filter(|(_, value)| arena.unref_block(value.guid))
            .count(),
        Ok(PNode::Branch(children)) => children
            .into_iter()
            .map(|(_, child)| release_node(child, arena))
            .sum(),
        Err(_shared) => 0,
    }
}

/// The block map of one snapshot.
#[derive(Debug)]
pub struct PersistentTree {
    root: Option<Arc<PNode>>,
    len: usize,
    branching: usize,
}

impl PersistentTree {
    pub fn new(branching: usize) -> Self {
        Self {
            root: None,
            len: 0,
            branching: branching.max(4),
        }
    }

    /// A tree sharing every node with this one.
    pub fn fork(&self) -> Self {
        Self {
            root: self.root.clone(),
            len: self.len,
            branching: self.branching,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn find(&self, id: BlockId) -> Option<PTreeValue> {
        let mut node = self.root.as_deref()?;
        loop {
            match node {
                PNode::Leaf(entries) => {
                    return entries
                        .binary_search_by(|(k, _)| k.cmp(&id))
                        .ok()
                        .map(|i| entries[i].1)
                }
                PNode::Branch(children) => node = &*children[route(children, id)].1,
            }
        }
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.find(id).is_some()
    }

    /// Inserts or overwrites the value of `id`; returns the previous value.
    pub fn assign(&mut self, id: BlockId, value: PTreeValue, arena: &mut BlockArena) -> Option<PTreeValue> {
        let branching = self.branching;
        let root = self
            .root
            .get_or_insert_with(|| Arc::new(PNode::Leaf(Vec::new())));
        let (previous, split) = assign_in(root, id, value, arena, branching);
        if let Some(right) = split {
            let left = root.clone();
            let left_max = left.max_key().unwrap_or(id);
            let right_max = right.max_key().unwrap_or(id);
            *root = Arc::new(PNode::Branch(vec![(left_max, left), (right_max, right)]));
        }
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Removes `id`; returns its value.
    pub fn remove(&mut self, id: BlockId, arena: &mut BlockArena) -> Option<PTreeValue> {
        if !self.contains(id) {
            return None;
        }
        let root = self.root.as_mut()?;
        let removed = remove_in(root, id, arena);
        self.len -= 1;
        self.collapse_root();
        removed
    }

    fn collapse_root(&mut self) {
        loop {
            let next = match self.root.as_deref() {
                Some(PNode::Branch(children)) if children.len() == 1 => children[0].1.clone(),
                Some(node) if node.len() == 0 => {
                    self.root = None;
                    return;
                }
                _ => return,
            };
            self.root = Some(next);
        }
    }

    /// Entries in ascending id order.
    pub fn iter(&self) -> Iter<'_> {
        let mut stack = Vec::new();
        if let Some(root) = self.root.as_deref() {
            stack.push((root, 0));
        }
        Iter { stack }
    }

    /// Drops this tree's share of its nodes; returns the number of blocks
    /// that were reclaimed.
    pub fn release(mut self, arena: &mut BlockArena) -> usize {
        self.len = 0;
        match self.root.take() {
            Some(root) => release_node(root, arena),
            None => 0,
        }
    }
}

fn assign_in(
    node: &mut Arc<PNode>,
    id: BlockId,
    value: PTreeValue,
    arena: &mut BlockArena,
    branching: usize,
) -> (Option<PTreeValue>, Option<Arc<PNode>>) {
    let node = make_mut(node, arena);
    let previous = match node {
        PNode::Leaf(entries) => match entries.binary_search_by(|(k, _)| k.cmp(&id)) {
            Ok(i) => {
                let old = entries[i].1;
                arena.ref_block(value.guid);
                arena.unref_block(old.guid);
                entries[i].1 = value;
                Some(old)
            }
            Err(i) => {
                arena.ref_block(value.guid);
                entries.insert(i, (id, value));
                None
            }
        },
        PNode::Branch(children) => {
            let idx = route(children, id);
            let (previous, split) = assign_in(&mut children[idx].1, id, value, arena, branching);
            if let Some(max) = children[idx].1.max_key() {
                children[idx].0 = max;
            }
            if let Some(right) = split {
                let max = right.max_key().unwrap_or(id);
                children.insert(idx + 1, (max, right));
            }
            previous
        }
    };
    let split = if node.len() > branching {
        let half = node.len() / 2;
        Some(Arc::new(node.split_off(half)))
    } else {
        None
    };
    (previous, split)
}

fn remove_in(node: &mut Arc<PNode>, id: BlockId, arena: &mut BlockArena) -> Option<PTreeValue> {
    match make_mut(node, arena) {
        PNode::Leaf(entries) => {
            let i = entries.binary_search_by(|(k, _)| k.cmp(&id)).ok()?;
            let (_, value) = entries.remove(i);
            arena.unref_block(value.guid);
            Some(value)
        }
        PNode::Branch(children) => {
            let idx = route(children, id);
            let removed = remove_in(&mut children[idx].1, id, arena);
            match children[idx].1.max_key() {
                Some(max) => children[idx].0 = max,
                None => {
                    children.remove(idx);
                }
            }
            removed
        }
    }
}

/// Iterator over the entries of a [`PersistentTree`].
pub struct Iter<'a> {
    stack: Vec<(&'a PNode, usize)>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (BlockId, PTreeValue);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let top = self.stack.len().checked_sub(1)?;
            let (node, pos) = self.stack[top];
            match node {
                PNode::Leaf(entries) if pos < entries.len() => {
                    self.stack[top].1 += 1;
                    return Some(entries[pos]);
                }
                PNode::Branch(children) if pos < children.len() => {
                    self.stack[top].1 += 1;
                    self.stack.push((&*children[pos].1, 0));
                }
                _ => {
                    self.stack.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;

    fn add_block(arena: &mut BlockArena, raw: u128) -> BlockGuid {
        arena.insert(Block::new(BlockId::new(raw), BlockGuid::new(raw), 0, 8))
    }

    fn value(guid: BlockGuid) -> PTreeValue {
        PTreeValue::new(guid, SnapshotId::new(1))
    }

    fn filled(arena: &mut BlockArena, n: u128) -> PersistentTree {
        let mut tree = PersistentTree::new(4);
        for i in 1..=n {
            let guid = add_block(arena, i);
            tree.assign(BlockId::new(i), value(guid), arena);
        }
        tree
    }

    // ==================== Basic operations ====================

    #[test]
    fn test_assign_find_iter() {
        let mut arena = BlockArena::new();
        let mut tree = PersistentTree::new(4);
        for i in [50u128, 10, 40, 20, 30, 60, 70, 5, 15] {
            let guid = add_block(&mut arena, i);
            assert!(tree.assign(BlockId::new(i), value(guid), &mut arena).is_none());
        }
        assert_eq!(tree.len(), 9);
        assert_eq!(tree.find(BlockId::new(40)).unwrap().guid, BlockGuid::new(40));
        assert!(tree.find(BlockId::new(41)).is_none());
        let ids: Vec<u128> = tree.iter().map(|(k, _)| k.raw()).collect();
        assert_eq!(ids, vec![5, 10, 15, 20, 30, 40, 50, 60, 70]);
        for i in ids {
            assert_eq!(arena.ref_count(BlockGuid::new(i)), Some(1));
        }
    }

    #[test]
    fn test_overwrite_moves_reference() {
        let mut arena = BlockArena::new();
        let mut tree = filled(&mut arena, 3);
        let newer = add_block(&mut arena, 100);
        let previous = tree.assign(BlockId::new(2), value(newer), &mut arena).unwrap();
        assert_eq!(previous.guid, BlockGuid::new(2));
        assert!(!arena.contains(BlockGuid::new(2)));
        assert_eq!(arena.ref_count(newer), Some(1));
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_remove_collapses() {
        let mut arena = BlockArena::new();
        let mut tree = filled(&mut arena, 40);
        for i in (1..=40).rev() {
            assert!(tree.remove(BlockId::new(i), &mut arena).is_some());
            assert!(tree.remove(BlockId::new(i), &mut arena).is_none());
            assert_eq!(tree.len(), i as usize - 1);
        }
        assert!(tree.is_empty());
        assert!(tree.root.is_none());
        assert!(arena.is_empty());
    }

    // ==================== Structural sharing ====================

    #[test]
    fn test_fork_isolation() {
        let mut arena = BlockArena::new();
        let mut base = filled(&mut arena, 20);
        let mut fork = base.fork();

        let newer = add_block(&mut arena, 500);
        fork.assign(BlockId::new(7), value(newer), &mut arena);
        fork.remove(BlockId::new(8), &mut arena);

        assert_eq!(base.find(BlockId::new(7)).unwrap().guid, BlockGuid::new(7));
        assert!(base.contains(BlockId::new(8)));
        assert_eq!(fork.find(BlockId::new(7)).unwrap().guid, newer);
        assert!(!fork.contains(BlockId::new(8)));
        // the old version of 7 is still referenced by the base tree
        assert!(arena.ref_count(BlockGuid::new(7)).unwrap() >= 1);

        base.remove(BlockId::new(1), &mut arena);
        assert!(fork.contains(BlockId::new(1)));
        assert_eq!(fork.len(), 19);
        assert_eq!(base.len(), 19);
    }

    #[test]
    fn test_release_frees_only_private_blocks() {
        let mut arena = BlockArena::new();
        let base = filled(&mut arena, 30);
        let mut fork = base.fork();
        let private = add_block(&mut arena, 1000);
        fork.assign(BlockId::new(1000), value(private), &mut arena);

        let reclaimed = fork.release(&mut arena);
        assert_eq!(reclaimed, 1);
        assert!(!arena.contains(private));
        for i in 1..=30 {
            assert!(arena.ref_count(BlockGuid::new(i)).unwrap() >= 1);
        }

        assert_eq!(base.release(&mut arena), 30);
        assert!(arena.is_empty());
    }
}
