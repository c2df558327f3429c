//! Memoria Packed - self-describing packed structures that live inside a
//! single block.
//!
//! This crate provides:
//! - `PackedAllocator`: splits one byte region into resizable streams
//! - `PkdVDTree`: variable-length encoded sequences with a prefix-sum index
//! - `PkdFSeq`: fixed-width sequences
//! - `SubStream` / `Dispatcher`: uniform access to heterogeneous streams
//!
//! # Example
//!
//! ```rust
//! use memoria_packed::{PackedAllocator, PkdVDTree, PkdVDTreeMut};
//!
//! let mut alloc = PackedAllocator::new(4096, 1).unwrap();
//! let mut tree = PkdVDTreeMut::<_>::init(&mut alloc, 0, 1).unwrap();
//! for v in [5u64, 3, 8, 1] {
//!     tree.append(&[v]).unwrap();
//! }
//!
//! let tree: PkdVDTree<'_> = PkdVDTree::open(alloc.element(0));
//! assert_eq!(tree.sum(0, 0, 4), 17);
//! let found = tree.find_ge(0, 9);
//! assert_eq!((found.idx, found.prefix), (2, 8));
//! ```

#![no_std]

extern crate alloc;

pub mod allocator;
pub mod codec;
pub mod dispatcher;
pub mod fseq;
pub mod search;
pub mod stream;
pub mod vdtree;

pub use allocator::{ElementKind, PackedAllocator};
pub use codec::{Codec, VarintCodec};
pub use dispatcher::Dispatcher;
pub use fseq::{PkdFSeq, PkdFSeqMut};
pub use search::{SearchType, WalkResult};
pub use stream::{StreamMut, StreamRef, StreamSpec, SubStream, SubStreamMut};
pub use vdtree::{PkdVDTree, PkdVDTreeMut};
