//! Container operations and the container type registry.
//!
//! A container is a tree of node blocks reachable from a root block. The
//! store only knows containers through [`ContainerOperations`], looked up by
//! the container type hash every block carries.

use crate::block::Block;
use crate::snapshot::Snapshot;
use hashbrown::HashMap;
use memoria_bt::{root_map_ctr_type_hash, NodeHeader, NodeRegistry, TreeNode, NODE_HEADER_SIZE};
use memoria_core::{BlockId, CtrId, Error, Result, SnapshotId};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Visitor for [`Snapshot::walk_containers`].
pub trait ContainerWalker {
    fn begin_snapshot(&mut self, _snapshot: SnapshotId) {}

    fn end_snapshot(&mut self, _snapshot: SnapshotId) {}

    fn begin_ctr(&mut self, ctr_id: CtrId, type_name: &str, root: BlockId);

    fn node(&mut self, id: BlockId, level: i32, leaf: bool, description: &str);

    fn end_ctr(&mut self, _ctr_id: CtrId) {}
}

/// Type-specific operations on containers of one type.
pub trait ContainerOperations: Send + Sync {
    fn type_name(&self) -> &str;

    /// Calls `f` for every block of the container, root first.
    fn for_each_ctr_node(
        &self,
        root: BlockId,
        snapshot: &Snapshot,
        f: &mut dyn FnMut(BlockId) -> Result<()>,
    ) -> Result<()>;

    /// Structural check; returns true if problems were found.
    fn check(&self, root: BlockId, snapshot: &Snapshot) -> Result<bool>;

    fn walk(&self, ctr_id: CtrId, root: BlockId, snapshot: &Snapshot, walker: &mut dyn ContainerWalker) -> Result<()>;

    fn describe_block(&self, block: &Block, nodes: &NodeRegistry) -> String;

    /// Copies every block of the container and returns the new root.
    fn clone_ctr(&self, root: BlockId, new_ctr: CtrId, snapshot: &Snapshot) -> Result<BlockId>;

    /// Removes every block of the container; returns how many.
    fn drop_ctr(&self, root: BlockId, snapshot: &Snapshot) -> Result<usize> {
        let mut ids = Vec::new();
        self.for_each_ctr_node(root, snapshot, &mut |id| {
            ids.push(id);
            Ok(())
        })?;
        for id in &ids {
            snapshot.remove_block(*id)?;
        }
        Ok(ids.len())
    }
}

fn open_node<'d, 'b>(data: &'b [u8], nodes: &'d NodeRegistry) -> Result<TreeNode<'d, &'b [u8]>> {
    if data.len() < NODE_HEADER_SIZE {
        return Err(Error::corrupted(format!("block of {} bytes holds no node", data.len())));
    }
    let descriptor = nodes.get(NodeHeader::read(data).node_type_hash)?;
    TreeNode::open(data, descriptor)
}

/// Runs `f` over a node block of `snapshot`.
pub(crate) fn read_node<R>(
    snapshot: &Snapshot,
    id: BlockId,
    f: impl FnOnce(&TreeNode<'_, &[u8]>) -> Result<R>,
) -> Result<R> {
    let nodes = snapshot.node_registry();
    snapshot.with_block(id, |data| f(&open_node(data, nodes)?))?
}

/// Runs `f` over a private copy of a node block.
pub(crate) fn update_node<R>(
    snapshot: &Snapshot,
    id: BlockId,
    f: impl FnOnce(&mut TreeNode<'_, &mut Vec<u8>>) -> Result<R>,
) -> Result<R> {
    let handle = snapshot.get_block(id)?;
    let nodes = snapshot.node_registry();
    let result = snapshot.update_block(&handle).and_then(|updated| {
        snapshot
            .with_block_mut(&updated, |data| {
                if data.len() < NODE_HEADER_SIZE {
                    return Err(Error::corrupted(format!("block {} holds no node", id)));
                }
                let descriptor = nodes.get(NodeHeader::read(data).node_type_hash)?;
                let mut node = TreeNode::open(data, descriptor)?;
                f(&mut node)
            })
            .and_then(|r| r)
    });
    snapshot.release_block(handle)?;
    result
}

fn describe_node<B: AsRef<[u8]>>(node: &TreeNode<'_, B>) -> String {
    format!(
        "{} level={} size={} free={}",
        node.descriptor().name,
        node.level(),
        node.size(),
        node.free_space()
    )
}

/// Operations of containers made of [`TreeNode`] blocks.
#[derive(Debug, Clone)]
pub struct TreeContainerOps {
    type_name: String,
}

impl TreeContainerOps {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
        }
    }
}

impl ContainerOperations for TreeContainerOps {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn for_each_ctr_node(
        &self,
        root: BlockId,
        snapshot: &Snapshot,
        f: &mut dyn FnMut(BlockId) -> Result<()>,
    ) -> Result<()> {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            f(id)?;
            let children = read_node(snapshot, id, |node| Ok(node.children()))?;
            stack.extend(children.into_iter().rev());
        }
        Ok(())
    }

    fn check(&self, root: BlockId, snapshot: &Snapshot) -> Result<bool> {
        let mut problems = false;
        let mut stack: Vec<(BlockId, Option<i32>)> = vec![(root, None)];
        while let Some((id, expected_level)) = stack.pop() {
            let inspected = read_node(snapshot, id, |node| {
                let mut issues = Vec::new();
                if let Err(err) = node.check() {
                    issues.push(err.to_string());
                }
                if node.is_root() != (id == root) {
                    issues.push(format!("root flag is {}", node.is_root()));
                }
                if id == root && node.root_metadata().is_none() {
                    issues.push("root metadata is missing".to_string());
                }
                if node.is_leaf() != (node.level() == 0) {
                    issues.push(format!("leaf flag {} at level {}", node.is_leaf(), node.level()));
                }
                if let Some(level) = expected_level {
                    if node.level() != level {
                        issues.push(format!("level {} where {} is expected", node.level(), level));
                    }
                }
                Ok((issues, node.level(), node.children()))
            });
            match inspected {
                Ok((issues, level, children)) => {
                    for issue in &issues {
                        warn!(ctr_type = %self.type_name, block = %id, issue = %issue, "container node check failed");
                    }
                    problems |= !issues.is_empty();
                    stack.extend(children.into_iter().map(|child| (child, Some(level - 1))));
                }
                Err(err) => {
                    warn!(ctr_type = %self.type_name, block = %id, error = %err, "container node can't be read");
                    problems = true;
                }
            }
        }
        Ok(problems)
    }

    fn walk(&self, ctr_id: CtrId, root: BlockId, snapshot: &Snapshot, walker: &mut dyn ContainerWalker) -> Result<()> {
        walker.begin_ctr(ctr_id, &self.type_name, root);
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let (level, leaf, description, children) = read_node(snapshot, id, |node| {
                Ok((node.level(), node.is_leaf(), describe_node(node), node.children()))
            })?;
            walker.node(id, level, leaf, &description);
            stack.extend(children.into_iter().rev());
        }
        walker.end_ctr(ctr_id);
        Ok(())
    }

    fn describe_block(&self, block: &Block, nodes: &NodeRegistry) -> String {
        match open_node(&block.data, nodes) {
            Ok(node) => format!("{} {}: {}", self.type_name, block.id, describe_node(&node)),
            Err(err) => format!("{} {}: {}", self.type_name, block.id, err),
        }
    }

    fn clone_ctr(&self, root: BlockId, new_ctr: CtrId, snapshot: &Snapshot) -> Result<BlockId> {
        let mut ids = Vec::new();
        self.for_each_ctr_node(root, snapshot, &mut |id| {
            ids.push(id);
            Ok(())
        })?;

        let mut mapping: HashMap<BlockId, BlockId> = HashMap::with_capacity(ids.len());
        for &id in &ids {
            let handle = snapshot.get_block(id)?;
            let copy = snapshot.clone_block(&handle);
            snapshot.release_block(handle)?;
            let copy = copy?;
            snapshot.release_block(copy)?;
            mapping.insert(id, copy.id);
        }

        for id in &ids {
            let Some(&new_id) = mapping.get(id) else {
                continue;
            };
            update_node(snapshot, new_id, |node| {
                for idx in 0..node.children().len() {
                    let child = node.child_id(idx)?;
                    if let Some(&copy) = mapping.get(&child) {
                        node.set_child_id(idx, copy)?;
                    }
                }
                if let Some(mut meta) = node.root_metadata() {
                    meta.ctr_id = new_ctr;
                    node.set_root_metadata(meta)?;
                }
                Ok(())
            })?;
        }
        mapping
            .get(&root)
            .copied()
            .ok_or_else(|| Error::corrupted(format!("root {} was not cloned", root)))
    }
}

/// Container operations keyed by container type hash.
#[derive(Clone, Default)]
pub struct ContainerRegistry {
    ops: HashMap<u64, Arc<dyn ContainerOperations>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the container directory type.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_builtin();
        registry
    }

    pub(crate) fn register_builtin(&mut self) {
        self.ops
            .entry(root_map_ctr_type_hash())
            .or_insert_with(|| Arc::new(TreeContainerOps::new("RootMap")));
    }

    pub fn register(&mut self, ctr_type_hash: u64, ops: Arc<dyn ContainerOperations>) -> Result<()> {
        if self.ops.contains_key(&ctr_type_hash) {
            return Err(Error::already_exists("Container type", format!("{:#x}", ctr_type_hash)));
        }
        tracing::trace!(type_name = ops.type_name(), ctr_type_hash, "registered container type");
        self.ops.insert(ctr_type_hash, ops);
        Ok(())
    }

    pub fn get(&self, ctr_type_hash: u64) -> Result<Arc<dyn ContainerOperations>> {
        self.ops
            .get(&ctr_type_hash)
            .cloned()
            .ok_or_else(|| Error::not_found("Container type", format!("{:#x}", ctr_type_hash)))
    }

    pub fn contains(&self, ctr_type_hash: u64) -> bool {
        self.ops.contains_key(&ctr_type_hash)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ops.values().map(|ops| ops.type_name().to_string()).collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ContainerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}
