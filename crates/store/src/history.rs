//! Snapshot history: the version DAG of a store.
//!
//! History nodes live in a map keyed by snapshot id; parent and child links
//! are ids, never owning pointers. Each node owns its persistent tree until
//! its data is deleted.

use crate::block::BlockArena;
use crate::ptree::PersistentTree;
use hashbrown::HashMap;
use memoria_core::{BlockId, Error, Result, SnapshotId};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SnapshotStatus {
    /// Mutable; the initial state of a branch.
    Active,
    /// Immutable.
    Committed,
    /// An import is in progress, no containers may be created.
    DataLocked,
    /// Marked for reclamation.
    Dropped,
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SnapshotStatus::Active => "ACTIVE",
            SnapshotStatus::Committed => "COMMITTED",
            SnapshotStatus::DataLocked => "DATA_LOCKED",
            SnapshotStatus::Dropped => "DROPPED",
        };
        f.write_str(name)
    }
}

/// One version in the history.
#[derive(Debug)]
pub struct HistoryNode {
    pub(crate) snapshot_id: SnapshotId,
    pub(crate) parent: Option<SnapshotId>,
    pub(crate) children: Vec<SnapshotId>,
    pub(crate) tree: Option<PersistentTree>,
    /// Root block of the container directory; nil while it is empty.
    pub(crate) root_id: BlockId,
    pub(crate) status: SnapshotStatus,
    pub(crate) references: usize,
    pub(crate) metadata: String,
}

impl HistoryNode {
    /// The first node of a store, committed and empty.
    pub fn root(snapshot_id: SnapshotId, branching: usize) -> Self {
        Self {
            snapshot_id,
            parent: None,
            children: Vec::new(),
            tree: Some(PersistentTree::new(branching)),
            root_id: BlockId::NIL,
            status: SnapshotStatus::Committed,
            references: 0,
            metadata: String::new(),
        }
    }

    /// An active child sharing the parent's tree.
    pub fn branch(parent: &HistoryNode, snapshot_id: SnapshotId, tree: PersistentTree) -> Self {
        Self {
            snapshot_id,
            parent: Some(parent.snapshot_id),
            children: Vec::new(),
            tree: Some(tree),
            root_id: parent.root_id,
            status: SnapshotStatus::Active,
            references: 1,
            metadata: String::new(),
        }
    }

    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }

    pub fn status(&self) -> SnapshotStatus {
        self.status
    }

    pub fn has_data(&self) -> bool {
        self.tree.is_some()
    }

    pub fn describe(&self) -> SnapshotMetadata {
        SnapshotMetadata {
            snapshot_id: self.snapshot_id,
            parent: self.parent,
            children: self.children.clone(),
            status: self.status,
            has_data: self.has_data(),
            blocks: self.tree.as_ref().map_or(0, |t| t.len()),
            metadata: self.metadata.clone(),
        }
    }
}

/// Public description of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub snapshot_id: SnapshotId,
    pub parent: Option<SnapshotId>,
    pub children: Vec<SnapshotId>,
    pub status: SnapshotStatus,
    pub has_data: bool,
    pub blocks: usize,
    pub metadata: String,
}

/// Outcome of [`History::pack`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackReport {
    pub data_deleted: usize,
    pub nodes_removed: usize,
    pub blocks_reclaimed: usize,
}

/// The history DAG with its named branches.
#[derive(Debug)]
pub struct History {
    nodes: HashMap<SnapshotId, HistoryNode>,
    root: SnapshotId,
    master: SnapshotId,
    branches: HashMap<String, SnapshotId>,
}

impl History {
    pub fn new(root: HistoryNode) -> Self {
        let id = root.snapshot_id;
        let mut nodes = HashMap::new();
        nodes.insert(id, root);
        Self {
            nodes,
            root: id,
            master: id,
            branches: HashMap::new(),
        }
    }

    pub fn root_id(&self) -> SnapshotId {
        self.root
    }

    pub fn master(&self) -> SnapshotId {
        self.master
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: SnapshotId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: SnapshotId) -> Result<&HistoryNode> {
        self.nodes.get(&id).ok_or_else(|| Error::not_found("Snapshot", id))
    }

    pub fn get_mut(&mut self, id: SnapshotId) -> Result<&mut HistoryNode> {
        self.nodes.get_mut(&id).ok_or_else(|| Error::not_found("Snapshot", id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &HistoryNode> {
        self.nodes.values()
    }

    /// Adds a node below its parent.
    pub fn attach(&mut self, node: HistoryNode) -> Result<()> {
        let parent = node
            .parent
            .ok_or_else(|| Error::invalid_operation("a branch needs a parent snapshot"))?;
        self.get_mut(parent)?.children.push(node.snapshot_id);
        self.nodes.insert(node.snapshot_id, node);
        Ok(())
    }

    fn require_committed(&self, id: SnapshotId) -> Result<()> {
        let node = self.get(id)?;
        if node.status != SnapshotStatus::Committed {
            return Err(Error::invalid_state(format!(
                "Snapshot {} is {}, only committed snapshots can be named",
                id, node.status
            )));
        }
        Ok(())
    }

    pub fn set_master(&mut self, id: SnapshotId) -> Result<()> {
        self.require_committed(id)?;
        self.master = id;
        Ok(())
    }

    pub fn find_branch(&self, name: &str) -> Option<SnapshotId> {
        self.branches.get(name).copied()
    }

    pub fn set_branch(&mut self, name: &str, id: SnapshotId) -> Result<()> {
        self.require_committed(id)?;
        self.branches.insert(name.to_string(), id);
        Ok(())
    }

    pub fn remove_branch(&mut self, name: &str) -> Option<SnapshotId> {
        self.branches.remove(name)
    }

    pub fn branch_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.branches.keys().cloned().collect();
        names.sort();
        names
    }

    fn is_named(&self, id: SnapshotId) -> bool {
        self.master == id || self.branches.values().any(|&b| b == id)
    }

    pub fn children_of(&self, id: SnapshotId) -> Result<Vec<SnapshotId>> {
        Ok(self.get(id)?.children.clone())
    }

    pub fn parent_of(&self, id: SnapshotId) -> Result<Option<SnapshotId>> {
        Ok(self.get(id)?.parent)
    }

    /// Leaf descendants of `start` (the root when `None`).
    pub fn heads(&self, start: Option<SnapshotId>) -> Result<Vec<SnapshotId>> {
        let start = start.unwrap_or(self.root);
        self.get(start)?;
        let mut heads = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let node = self.get(id)?;
            if node.children.is_empty() {
                heads.push(id);
            } else {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        Ok(heads)
    }

    /// Snapshots from `start` back through its ancestors, newest first,
    /// ending at `stop` or at the root.
    pub fn linear_history(&self, start: SnapshotId, stop: Option<SnapshotId>) -> Result<Vec<SnapshotId>> {
        if let Some(stop) = stop {
            self.get(stop)?;
        }
        let mut out = Vec::new();
        let mut current = Some(start);
        while let Some(id) = current {
            let node = self.get(id)?;
            out.push(id);
            if Some(id) == stop {
                return Ok(out);
            }
            current = node.parent;
        }
        match stop {
            Some(stop) => Err(Error::invalid_operation(format!(
                "Snapshot {} is not an ancestor of {}",
                stop, start
            ))),
            None => Ok(out),
        }
    }

    /// Releases the tree of `id`; returns the number of reclaimed blocks.
    pub fn delete_data(&mut self, id: SnapshotId, arena: &mut BlockArena) -> Result<usize> {
        let node = self.get_mut(id)?;
        Ok(match node.tree.take() {
            Some(tree) => tree.release(arena),
            None => 0,
        })
    }

    /// Removes a node that has no children.
    pub fn forget(&mut self, id: SnapshotId) -> Result<HistoryNode> {
        if id == self.root {
            return Err(Error::invalid_operation("the root snapshot can't be forgotten"));
        }
        let node = self.get(id)?;
        if !node.children.is_empty() {
            return Err(Error::invalid_state(format!(
                "Snapshot {} has children and can't be forgotten",
                id
            )));
        }
        let node = self.nodes.remove(&id).ok_or_else(|| Error::not_found("Snapshot", id))?;
        if let Some(parent) = node.parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|&c| c != id);
        }
        self.branches.retain(|_, b| *b != id);
        Ok(node)
    }

    fn nearest_committed_ancestor(&self, id: SnapshotId) -> SnapshotId {
        let mut current = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(c) = current {
            match self.nodes.get(&c) {
                Some(node) if node.status == SnapshotStatus::Committed => return c,
                Some(node) => current = node.parent,
                None => break,
            }
        }
        self.root
    }

    /// Deletes data of dropped snapshots, moves names off them and removes
    /// history nodes that no longer carry anything.
    pub fn pack(&mut self, arena: &mut BlockArena) -> PackReport {
        let mut report = PackReport::default();

        let dropped: Vec<SnapshotId> = self
            .nodes
            .values()
            .filter(|n| n.status == SnapshotStatus::Dropped && n.has_data() && n.references == 0)
            .map(|n| n.snapshot_id)
            .collect();
        for id in dropped {
            if let Ok(reclaimed) = self.delete_data(id, arena) {
                report.data_deleted += 1;
                report.blocks_reclaimed += reclaimed;
            }
        }

        let is_dropped = |nodes: &HashMap<SnapshotId, HistoryNode>, id: SnapshotId| {
            nodes.get(&id).map_or(true, |n| n.status == SnapshotStatus::Dropped)
        };
        if is_dropped(&self.nodes, self.master) {
            self.master = self.nearest_committed_ancestor(self.master);
        }
        let names: Vec<(String, SnapshotId)> = self
            .branches
            .iter()
            .filter(|&(_, &id)| is_dropped(&self.nodes, id))
            .map(|(name, &id)| (name.clone(), id))
            .collect();
        for (name, id) in names {
            let target = self.nearest_committed_ancestor(id);
            self.branches.insert(name, target);
        }

        loop {
            let removable = self.nodes.values().find(|n| {
                n.snapshot_id != self.root
                    && !n.has_data()
                    && n.references == 0
                    && n.children.len() <= 1
                    && !self.is_named(n.snapshot_id)
            });
            let Some(node) = removable else {
                break;
            };
            let id = node.snapshot_id;
            let parent = node.parent;
            let child = node.children.first().copied();

            self.nodes.remove(&id);
            if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(&p)) {
                match (parent.children.iter().position(|&c| c == id), child) {
                    (Some(pos), Some(child)) => parent.children[pos] = child,
                    (Some(pos), None) => {
                        parent.children.remove(pos);
                    }
                    (None, _) => {}
                }
            }
            if let Some(child) = child.and_then(|c| self.nodes.get_mut(&c)) {
                child.parent = parent;
            }
            report.nodes_removed += 1;
        }
        tracing::debug!(
            data_deleted = report.data_deleted,
            nodes_removed = report.nodes_removed,
            blocks_reclaimed = report.blocks_reclaimed,
            "packed history"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(raw: u128) -> SnapshotId {
        SnapshotId::new(raw)
    }

    fn history() -> History {
        History::new(HistoryNode::root(sid(1), 8))
    }

    fn add(history: &mut History, parent: u128, id: u128, status: SnapshotStatus) {
        let parent_node = history.get(sid(parent)).unwrap();
        let tree = parent_node.tree.as_ref().map_or_else(|| PersistentTree::new(8), |t| t.fork());
        let mut node = HistoryNode::branch(parent_node, sid(id), tree);
        node.status = status;
        node.references = 0;
        history.attach(node).unwrap();
    }

    #[test]
    fn test_heads_and_linear_history() {
        let mut h = history();
        add(&mut h, 1, 2, SnapshotStatus::Committed);
        add(&mut h, 2, 3, SnapshotStatus::Committed);
        add(&mut h, 2, 4, SnapshotStatus::Active);
        add(&mut h, 1, 5, SnapshotStatus::Committed);

        assert_eq!(h.heads(None).unwrap(), vec![sid(3), sid(4), sid(5)]);
        assert_eq!(h.heads(Some(sid(2))).unwrap(), vec![sid(3), sid(4)]);
        assert_eq!(h.linear_history(sid(3), None).unwrap(), vec![sid(3), sid(2), sid(1)]);
        assert_eq!(h.linear_history(sid(3), Some(sid(2))).unwrap(), vec![sid(3), sid(2)]);
        assert!(h.linear_history(sid(3), Some(sid(5))).is_err());
        assert_eq!(h.children_of(sid(2)).unwrap(), vec![sid(3), sid(4)]);
        assert_eq!(h.parent_of(sid(4)).unwrap(), Some(sid(2)));
    }

    #[test]
    fn test_named_branches_need_committed() {
        let mut h = history();
        add(&mut h, 1, 2, SnapshotStatus::Active);
        assert!(h.set_branch("dev", sid(2)).is_err());
        add(&mut h, 1, 3, SnapshotStatus::Committed);
        h.set_branch("dev", sid(3)).unwrap();
        h.set_branch("alpha", sid(1)).unwrap();
        assert_eq!(h.find_branch("dev"), Some(sid(3)));
        assert_eq!(h.branch_names(), vec!["alpha".to_string(), "dev".to_string()]);
        assert!(h.set_master(sid(2)).is_err());
        h.set_master(sid(3)).unwrap();
        assert_eq!(h.master(), sid(3));
        assert_eq!(h.remove_branch("dev"), Some(sid(3)));
        assert_eq!(h.find_branch("dev"), None);
    }

    #[test]
    fn test_forget_detaches_from_parent() {
        let mut h = history();
        add(&mut h, 1, 2, SnapshotStatus::Active);
        let mut arena = BlockArena::new();
        h.delete_data(sid(2), &mut arena).unwrap();
        h.forget(sid(2)).unwrap();
        assert!(!h.contains(sid(2)));
        assert!(h.children_of(sid(1)).unwrap().is_empty());
        assert!(h.forget(sid(1)).is_err());
    }

    #[test]
    fn test_pack_removes_dropped_leaves_and_splices_chains() {
        let mut h = history();
        let mut arena = BlockArena::new();
        add(&mut h, 1, 2, SnapshotStatus::Committed);
        add(&mut h, 2, 3, SnapshotStatus::Dropped);
        add(&mut h, 3, 4, SnapshotStatus::Committed);
        add(&mut h, 1, 5, SnapshotStatus::Dropped);
        h.set_branch("feature", sid(5)).unwrap_err();
        h.get_mut(sid(5)).unwrap().status = SnapshotStatus::Committed;
        h.set_branch("feature", sid(5)).unwrap();
        h.get_mut(sid(5)).unwrap().status = SnapshotStatus::Dropped;

        let report = h.pack(&mut arena);
        assert_eq!(report.data_deleted, 2);
        // 3 is spliced out, 5 loses its name first and goes too
        assert_eq!(report.nodes_removed, 2);
        assert_eq!(h.find_branch("feature"), Some(sid(1)));
        assert_eq!(h.parent_of(sid(4)).unwrap(), Some(sid(2)));
        assert_eq!(h.children_of(sid(2)).unwrap(), vec![sid(4)]);
        assert_eq!(h.children_of(sid(1)).unwrap(), vec![sid(2)]);
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn test_pack_keeps_referenced_nodes() {
        let mut h = history();
        let mut arena = BlockArena::new();
        add(&mut h, 1, 2, SnapshotStatus::Dropped);
        h.get_mut(sid(2)).unwrap().references = 1;
        let report = h.pack(&mut arena);
        assert_eq!(report, PackReport::default());
        assert!(h.get(sid(2)).unwrap().has_data());
    }
}
