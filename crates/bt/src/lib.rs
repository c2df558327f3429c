//! Memoria BT - the B-tree node layer of the Memoria storage engine.
//!
//! This crate provides:
//! - `NodeHeader` / `RootMetadata`: the fixed prefix of every node block
//! - `NodeDescriptor` / `NodeRegistry`: node layouts and their type hashes
//! - `TreeNode`: branch and leaf nodes built from packed sub-streams
//! - `Accumulator`: per-stream key tuples and range sums
//!
//! # Example
//!
//! ```rust
//! use memoria_bt::{Accumulator, NodeDescriptor, TreeNode};
//! use memoria_packed::StreamSpec;
//!
//! let descriptor = NodeDescriptor::leaf("Counts", vec![StreamSpec::VdTree { blocks: 1 }]);
//! let mut node = TreeNode::init(vec![0u8; 1024], &descriptor).unwrap();
//! node.prepare().unwrap();
//! for (i, v) in [5u64, 3, 8].iter().enumerate() {
//!     node.insert(i, &Accumulator::from_streams(vec![vec![*v]]), None).unwrap();
//! }
//!
//! let mut right = TreeNode::init(vec![0u8; 1024], &descriptor).unwrap();
//! let moved = node.split_to(&mut right, 1).unwrap();
//! assert_eq!(moved.get(0, 0), 11);
//! assert_eq!(node.sums().get(0, 0), 5);
//! ```

#![no_std]

extern crate alloc;

pub mod accumulator;
pub mod descriptor;
pub mod header;
pub mod node;

pub use accumulator::Accumulator;
pub use descriptor::{
    root_map_branch, root_map_ctr_type_hash, root_map_leaf, NodeDescriptor, NodeKind, NodeRegistry,
};
pub use header::{NodeHeader, RootMetadata, NODE_HEADER_SIZE};
pub use node::{resize_node_data, TreeNode};
