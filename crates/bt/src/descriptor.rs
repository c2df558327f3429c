//! Node layout descriptors and the node type registry.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use hashbrown::HashMap;
use memoria_core::bytes;
use memoria_core::{Error, Result};
use memoria_packed::{Dispatcher, StreamSpec};

/// Slot of the root metadata in every node allocator.
pub const METADATA_SLOT: usize = 0;

/// First sub-stream slot.
pub const STREAMS_START: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Branch,
    Leaf,
}

/// Layout of one node type: its kind and the sub-streams it packs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub name: String,
    pub kind: NodeKind,
    pub streams: Vec<StreamSpec>,
}

impl NodeDescriptor {
    pub fn new(name: impl Into<String>, kind: NodeKind, streams: Vec<StreamSpec>) -> Self {
        Self {
            name: name.into(),
            kind,
            streams,
        }
    }

    pub fn branch(name: impl Into<String>, streams: Vec<StreamSpec>) -> Self {
        Self::new(name, NodeKind::Branch, streams)
    }

    pub fn leaf(name: impl Into<String>, streams: Vec<StreamSpec>) -> Self {
        Self::new(name, NodeKind::Leaf, streams)
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    /// Structural hash of the layout. The name does not take part.
    pub fn hash(&self) -> u64 {
        let mut buf = Vec::with_capacity(1 + self.streams.len() * 5);
        buf.push(match self.kind {
            NodeKind::Branch => 1u8,
            NodeKind::Leaf => 2u8,
        });
        for spec in &self.streams {
            buf.extend_from_slice(&spec.encode());
        }
        bytes::fnv1a(&buf)
    }

    /// Number of sub-streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Allocator slot of sub-stream `i`.
    pub fn stream_slot(&self, i: usize) -> usize {
        STREAMS_START + i
    }

    /// Slot of the child id array; branch nodes only.
    pub fn values_slot(&self) -> Option<usize> {
        match self.kind {
            NodeKind::Branch => Some(STREAMS_START + self.streams.len()),
            NodeKind::Leaf => None,
        }
    }

    /// Total number of allocator slots.
    pub fn allocator_slots(&self) -> usize {
        STREAMS_START + self.streams.len() + usize::from(self.kind == NodeKind::Branch)
    }

    /// Mask selecting every sub-stream.
    pub fn all_streams_mask(&self) -> u64 {
        match self.streams.len() {
            n if n >= 64 => u64::MAX,
            n => (1u64 << n) - 1,
        }
    }

    pub fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.streams, STREAMS_START)
    }
}

/// Node type registry keyed by descriptor hash.
#[derive(Debug, Default, Clone)]
pub struct NodeRegistry {
    descriptors: HashMap<u64, NodeDescriptor>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the node types of the built-in containers.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for descriptor in builtin_descriptors() {
            // built-in layouts are distinct
            let _ = registry.register(descriptor);
        }
        registry
    }

    /// Registers a descriptor and returns its hash.
    ///
    /// Registering the same layout twice is accepted; a different layout
    /// with a colliding hash is rejected.
    pub fn register(&mut self, descriptor: NodeDescriptor) -> Result<u64> {
        let hash = descriptor.hash();
        if let Some(existing) = self.descriptors.get(&hash) {
            if existing.kind != descriptor.kind || existing.streams != descriptor.streams {
                return Err(Error::already_exists("Node type", format!("{:#x}", hash)));
            }
            return Ok(hash);
        }
        tracing::trace!(name = %descriptor.name, hash, "registered node type");
        self.descriptors.insert(hash, descriptor);
        Ok(hash)
    }

    pub fn get(&self, hash: u64) -> Result<&NodeDescriptor> {
        self.descriptors
            .get(&hash)
            .ok_or_else(|| Error::not_found("Node type", format!("{:#x}", hash)))
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.descriptors.contains_key(&hash)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.descriptors.values().map(|d| d.name.to_string()).collect();
        names.sort();
        names
    }
}

/// Leaf layout of the root map: container id (hi, lo) and root block id
/// (hi, lo).
pub fn root_map_leaf() -> NodeDescriptor {
    NodeDescriptor::leaf(
        "RootMapLeaf",
        vec![StreamSpec::FSeq { blocks: 2 }, StreamSpec::FSeq { blocks: 2 }],
    )
}

/// Branch layout of the root map: the largest container id of each child.
pub fn root_map_branch() -> NodeDescriptor {
    NodeDescriptor::branch("RootMapBranch", vec![StreamSpec::FSeq { blocks: 2 }])
}

/// Container type hash of the root map.
pub fn root_map_ctr_type_hash() -> u64 {
    bytes::fnv1a(b"memoria::RootMap")
}

fn builtin_descriptors() -> Vec<NodeDescriptor> {
    vec![root_map_leaf(), root_map_branch()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_ignores_name() {
        let a = NodeDescriptor::leaf("A", vec![StreamSpec::VdTree { blocks: 1 }]);
        let b = NodeDescriptor::leaf("B", vec![StreamSpec::VdTree { blocks: 1 }]);
        let c = NodeDescriptor::branch("A", vec![StreamSpec::VdTree { blocks: 1 }]);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_slots() {
        let leaf = root_map_leaf();
        assert_eq!(leaf.allocator_slots(), 3);
        assert_eq!(leaf.values_slot(), None);
        let branch = root_map_branch();
        assert_eq!(branch.allocator_slots(), 3);
        assert_eq!(branch.values_slot(), Some(2));
        assert_eq!(branch.all_streams_mask(), 0b1);
    }

    #[test]
    fn test_registry() {
        let mut registry = NodeRegistry::with_builtin();
        assert_eq!(registry.len(), 2);
        let hash = root_map_leaf().hash();
        assert_eq!(registry.get(hash).unwrap().name, "RootMapLeaf");
        assert_eq!(registry.register(root_map_leaf()).unwrap(), hash);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(12345).is_err());
    }
}
