//! Memoria Store - a versioned, copy-on-write block store kept in memory.
//!
//! This crate provides:
//! - `MemoryStore`: the history of snapshots and the shared block arena
//! - `Snapshot`: a handle to one version; active snapshots accept writes,
//!   committed ones are immutable and can be branched
//! - `RootMap`: the per-snapshot directory of containers
//! - `ContainerOperations` / `ContainerRegistry`: type-specific container
//!   handling, looked up by container type hash
//!
//! Blocks are shared between snapshots until a snapshot updates them; the
//! first update copies the block into a version private to the writer.
//!
//! # Example
//!
//! ```rust
//! use memoria_store::{MemoryStore, StoreConfig};
//!
//! let store = MemoryStore::new(StoreConfig::default()).unwrap();
//! let first = store.master().unwrap().branch().unwrap();
//! let block = first.create_block(0, 1).unwrap();
//! first.with_block_mut(&block, |data| data[..5].copy_from_slice(b"hello")).unwrap();
//! first.release_block(block).unwrap();
//! first.commit().unwrap();
//!
//! let second = first.branch().unwrap();
//! let shared = second.get_block(block.id).unwrap();
//! let private = second.update_block(&shared).unwrap();
//! second.with_block_mut(&private, |data| data[..5].copy_from_slice(b"world")).unwrap();
//! second.release_block(shared).unwrap();
//!
//! assert_eq!(first.with_block(block.id, |d| d[..5].to_vec()).unwrap(), b"hello");
//! assert_eq!(second.with_block(block.id, |d| d[..5].to_vec()).unwrap(), b"world");
//! ```

pub mod block;
pub mod cache;
pub mod config;
pub mod container;
pub mod history;
pub mod ptree;
pub mod root_map;
pub mod snapshot;
pub mod stats;
pub mod store;

pub use block::{Block, BlockHandle, BlockState};
pub use config::StoreConfig;
pub use container::{ContainerOperations, ContainerRegistry, ContainerWalker, TreeContainerOps};
pub use history::{PackReport, SnapshotMetadata, SnapshotStatus};
pub use root_map::RootMap;
pub use snapshot::Snapshot;
pub use stats::StatsSnapshot;
pub use store::{ContainerTypeStat, MemoryStat, MemoryStore, SnapshotMemoryStat};

pub use memoria_core::{BlockGuid, BlockId, CtrId, Error, Result, SnapshotId};
