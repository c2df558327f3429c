//! The in-memory copy-on-write store.

use crate::block::{Block, BlockArena};
use crate::config::StoreConfig;
use crate::container::{ContainerRegistry, ContainerWalker};
use crate::history::{History, HistoryNode, PackReport, SnapshotMetadata, SnapshotStatus};
use crate::ptree::PersistentTree;
use crate::snapshot::Snapshot;
use crate::stats::{StatsSnapshot, StoreStats};
use hashbrown::{HashMap, HashSet};
use memoria_bt::{root_map_branch, root_map_leaf, NodeRegistry};
use memoria_core::{BlockGuid, BlockId, Error, Result, SnapshotId};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Everything behind the store lock.
#[derive(Debug)]
pub(crate) struct StoreState {
    pub(crate) arena: BlockArena,
    pub(crate) history: History,
}

impl StoreState {
    /// The persistent tree of a snapshot that still has data.
    pub(crate) fn tree(&self, snapshot: SnapshotId) -> Result<&PersistentTree> {
        self.history
            .get(snapshot)?
            .tree
            .as_ref()
            .ok_or_else(|| Error::invalid_state(format!("Snapshot {} has no data", snapshot)))
    }

    pub(crate) fn tree_and_arena(&mut self, snapshot: SnapshotId) -> Result<(&mut PersistentTree, &mut BlockArena)> {
        let StoreState { arena, history } = self;
        let tree = history
            .get_mut(snapshot)?
            .tree
            .as_mut()
            .ok_or_else(|| Error::invalid_state(format!("Snapshot {} has no data", snapshot)))?;
        Ok((tree, arena))
    }

    pub(crate) fn check_update_allowed(&self, snapshot: SnapshotId) -> Result<()> {
        match self.history.get(snapshot)?.status {
            SnapshotStatus::Active | SnapshotStatus::DataLocked => Ok(()),
            status => Err(Error::invalid_state(format!(
                "Snapshot {} is {}. No updates permitted.",
                snapshot, status
            ))),
        }
    }

    /// Current version of a block as seen by a snapshot.
    pub(crate) fn block(&self, snapshot: SnapshotId, id: BlockId) -> Result<&Block> {
        let value = self.tree(snapshot)?.find(id).ok_or_else(|| Error::not_found("Block", id))?;
        self.arena.get(value.guid).ok_or_else(|| {
            Error::corrupted(format!("version {} of block {} is not in the arena", value.guid, id))
        })
    }
}

pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    pub(crate) state: Mutex<StoreState>,
    pub(crate) stats: StoreStats,
    pub(crate) nodes: NodeRegistry,
    pub(crate) containers: ContainerRegistry,
}

pub(crate) fn log_lifecycle(config: &StoreConfig, snapshot: SnapshotId, event: &'static str) {
    if config.dump_snapshot_lifecycle {
        tracing::info!(snapshot = %snapshot, event, "snapshot lifecycle");
    } else {
        tracing::debug!(snapshot = %snapshot, event, "snapshot lifecycle");
    }
}

/// Memory use of one container type inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerTypeStat {
    pub ctr_type_hash: u64,
    pub type_name: String,
    pub blocks: usize,
    pub bytes: usize,
}

/// Memory use of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMemoryStat {
    pub snapshot_id: SnapshotId,
    pub status: SnapshotStatus,
    pub blocks: usize,
    pub bytes: usize,
    pub containers: Vec<ContainerTypeStat>,
}

/// Memory use of a store. Totals count every block version once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStat {
    pub total_blocks: usize,
    pub total_bytes: usize,
    pub snapshots: Vec<SnapshotMemoryStat>,
}

impl MemoryStat {
    pub fn snapshot(&self, id: SnapshotId) -> Option<&SnapshotMemoryStat> {
        self.snapshots.iter().find(|s| s.snapshot_id == id)
    }
}

/// A versioned block store kept in memory.
///
/// Cloning the store clones a handle; all clones share the same history.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        Self::with_registries(config, NodeRegistry::with_builtin(), ContainerRegistry::with_builtin())
    }

    /// A store with custom node and container types. The container
    /// directory types are added when missing.
    pub fn with_registries(
        config: StoreConfig,
        mut nodes: NodeRegistry,
        mut containers: ContainerRegistry,
    ) -> Result<Self> {
        config.validate()?;
        nodes.register(root_map_leaf())?;
        nodes.register(root_map_branch())?;
        containers.register_builtin();

        let root_id = SnapshotId::new(Uuid::new_v4().as_u128());
        let root = HistoryNode::root(root_id, config.ptree_branching);
        let state = StoreState {
            arena: BlockArena::new(),
            history: History::new(root),
        };
        tracing::debug!(root = %root_id, block_size = config.block_size, "created memory store");
        Ok(Self {
            inner: Arc::new(StoreInner {
                config,
                state: Mutex::new(state),
                stats: StoreStats::new(),
                nodes,
                containers,
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn node_registry(&self) -> &NodeRegistry {
        &self.inner.nodes
    }

    pub fn container_registry(&self) -> &ContainerRegistry {
        &self.inner.containers
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    fn open(&self, state: &mut StoreState, id: SnapshotId) -> Result<Snapshot> {
        state.history.get_mut(id)?.references += 1;
        Ok(Snapshot::attach(Arc::clone(&self.inner), id))
    }

    /// The snapshot currently designated as master.
    pub fn master(&self) -> Result<Snapshot> {
        let mut state = self.inner.state.lock();
        let id = state.history.master();
        self.open(&mut state, id)
    }

    pub fn set_master(&self, id: SnapshotId) -> Result<()> {
        self.inner.state.lock().history.set_master(id)
    }

    /// Opens a snapshot by id. Active and data-locked snapshots are owned
    /// by the handle that created them and can't be opened again.
    pub fn find(&self, id: SnapshotId) -> Result<Snapshot> {
        let mut state = self.inner.state.lock();
        match state.history.get(id)?.status {
            SnapshotStatus::Active => {
                return Err(Error::invalid_state(format!(
                    "Snapshot {} is still active and can't be opened",
                    id
                )))
            }
            SnapshotStatus::DataLocked => {
                return Err(Error::invalid_state(format!(
                    "Snapshot {} is locked and can't be opened",
                    id
                )))
            }
            SnapshotStatus::Committed | SnapshotStatus::Dropped => {}
        }
        self.open(&mut state, id)
    }

    pub fn find_branch(&self, name: &str) -> Result<Option<Snapshot>> {
        let mut state = self.inner.state.lock();
        match state.history.find_branch(name) {
            Some(id) => self.open(&mut state, id).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_branch(&self, name: &str, id: SnapshotId) -> Result<()> {
        self.inner.state.lock().history.set_branch(name, id)
    }

    pub fn remove_named_branch(&self, name: &str) -> bool {
        self.inner.state.lock().history.remove_branch(name).is_some()
    }

    pub fn branch_names(&self) -> Vec<String> {
        self.inner.state.lock().history.branch_names()
    }

    pub fn branch_head(&self, name: &str) -> Option<SnapshotId> {
        self.inner.state.lock().history.find_branch(name)
    }

    pub fn master_id(&self) -> SnapshotId {
        self.inner.state.lock().history.master()
    }

    pub fn root_snapshot_id(&self) -> SnapshotId {
        self.inner.state.lock().history.root_id()
    }

    pub fn children_of(&self, id: SnapshotId) -> Result<Vec<SnapshotId>> {
        self.inner.state.lock().history.children_of(id)
    }

    /// Leaf snapshots under `start`, the whole history when `None`.
    pub fn heads(&self, start: Option<SnapshotId>) -> Result<Vec<SnapshotId>> {
        self.inner.state.lock().history.heads(start)
    }

    /// `start` and its ancestors, newest first, up to `stop` or the root.
    pub fn linear_history(&self, start: SnapshotId, stop: Option<SnapshotId>) -> Result<Vec<SnapshotId>> {
        self.inner.state.lock().history.linear_history(start, stop)
    }

    pub fn describe(&self, id: SnapshotId) -> Result<SnapshotMetadata> {
        Ok(self.inner.state.lock().history.get(id)?.describe())
    }

    pub fn snapshot_status(&self, id: SnapshotId) -> Result<SnapshotStatus> {
        Ok(self.inner.state.lock().history.get(id)?.status())
    }

    pub fn snapshot_parent(&self, id: SnapshotId) -> Result<Option<SnapshotId>> {
        self.inner.state.lock().history.parent_of(id)
    }

    pub fn snapshot_count(&self) -> usize {
        self.inner.state.lock().history.len()
    }

    /// Number of persistent tree slots referring to a block version.
    pub fn block_ref_count(&self, guid: BlockGuid) -> Option<usize> {
        self.inner.state.lock().arena.ref_count(guid)
    }

    /// Distinct block versions held by the store.
    pub fn block_count(&self) -> usize {
        self.inner.state.lock().arena.len()
    }

    /// Reclaims dropped snapshots and compacts the history.
    pub fn pack(&self) -> PackReport {
        let mut state = self.inner.state.lock();
        let StoreState { arena, history } = &mut *state;
        let report = history.pack(arena);
        self.inner.stats.record_reclaimed(report.blocks_reclaimed);
        report
    }

    pub fn memory_stat(&self) -> MemoryStat {
        let state = self.inner.state.lock();
        let mut snapshots = Vec::new();
        for node in state.history.nodes() {
            let Some(tree) = node.tree.as_ref() else {
                continue;
            };
            let mut per_type: HashMap<u64, (usize, usize)> = HashMap::new();
            let mut seen: HashSet<BlockGuid> = HashSet::new();
            let (mut blocks, mut bytes) = (0, 0);
            for (_, value) in tree.iter() {
                let Some(block) = state.arena.get(value.guid) else {
                    continue;
                };
                if !seen.insert(value.guid) {
                    continue;
                }
                blocks += 1;
                bytes += block.memory_block_size();
                let entry = per_type.entry(block.ctr_type_hash).or_insert((0, 0));
                entry.0 += 1;
                entry.1 += block.memory_block_size();
            }
            let mut containers: Vec<ContainerTypeStat> = per_type
                .into_iter()
                .map(|(hash, (blocks, bytes))| ContainerTypeStat {
                    ctr_type_hash: hash,
                    type_name: self
                        .inner
                        .containers
                        .get(hash)
                        .map(|ops| ops.type_name().to_string())
                        .unwrap_or_else(|_| format!("{:#x}", hash)),
                    blocks,
                    bytes,
                })
                .collect();
            containers.sort_by(|a, b| a.type_name.cmp(&b.type_name));
            snapshots.push(SnapshotMemoryStat {
                snapshot_id: node.snapshot_id(),
                status: node.status(),
                blocks,
                bytes,
                containers,
            });
        }
        snapshots.sort_by_key(|s| s.snapshot_id);
        MemoryStat {
            total_blocks: state.arena.len(),
            total_bytes: state.arena.total_bytes(),
            snapshots,
        }
    }

    /// Walks the containers of every committed snapshot.
    pub fn walk_containers(&self, walker: &mut dyn ContainerWalker) -> Result<()> {
        let ids: Vec<SnapshotId> = {
            let state = self.inner.state.lock();
            let mut ids: Vec<SnapshotId> = state
                .history
                .nodes()
                .filter(|n| n.status() == SnapshotStatus::Committed && n.has_data())
                .map(|n| n.snapshot_id())
                .collect();
            ids.sort();
            ids
        };
        for id in ids {
            let snapshot = self.find(id)?;
            snapshot.walk_containers(walker)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockState;

    fn store() -> MemoryStore {
        MemoryStore::new(StoreConfig::default().with_block_size(512)).unwrap()
    }

    // ==================== Lifecycle ====================

    #[test]
    fn test_root_is_committed_master() {
        let store = store();
        let master = store.master().unwrap();
        assert_eq!(master.id(), store.root_snapshot_id());
        assert!(master.is_committed());
        assert!(master.drop_snapshot().is_err());
        assert!(master.branch().is_ok());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(MemoryStore::new(StoreConfig::default().with_block_size(100)).is_err());
    }

    #[test]
    fn test_branch_requires_commit() {
        let store = store();
        let master = store.master().unwrap();
        let child = master.branch().unwrap();
        let err = child.branch().unwrap_err();
        assert!(err.to_string().contains("still being active"));
        child.lock_data_for_import().unwrap();
        let err = child.branch().unwrap_err();
        assert!(err.to_string().contains("is locked"));
        child.commit().unwrap();
        assert!(child.branch().is_ok());
        assert!(child.commit().is_err());
    }

    #[test]
    fn test_find_rejects_active() {
        let store = store();
        let child = store.master().unwrap().branch().unwrap();
        assert!(store.find(child.id()).is_err());
        child.commit().unwrap();
        let again = store.find(child.id()).unwrap();
        assert_eq!(again.id(), child.id());
    }

    #[test]
    fn test_uncommitted_handle_drop_discards() {
        let store = store();
        let id = {
            let child = store.master().unwrap().branch().unwrap();
            let handle = child.create_block(0, 7).unwrap();
            child.release_block(handle).unwrap();
            assert_eq!(store.block_count(), 1);
            child.id()
        };
        assert_eq!(store.block_count(), 0);
        assert!(store.describe(id).is_err());
        assert!(store.children_of(store.root_snapshot_id()).unwrap().is_empty());
    }

    // ==================== Blocks ====================

    #[test]
    fn test_copy_on_write() {
        let store = store();
        let first = store.master().unwrap().branch().unwrap();
        let h = first.create_block(64, 1).unwrap();
        first.with_block_mut(&h, |d| d[0] = 1).unwrap();
        first.release_block(h).unwrap();
        first.commit().unwrap();

        let second = first.branch().unwrap();
        let read = second.get_block(h.id).unwrap();
        assert_eq!(read.state, BlockState::Read);
        assert!(second.with_block_mut(&read, |d| d[0] = 2).is_err());
        let updated = second.update_block(&read).unwrap();
        assert_ne!(updated.guid, h.guid);
        second.with_block_mut(&updated, |d| d[0] = 2).unwrap();
        second.release_block(updated).unwrap();

        assert_eq!(first.with_block(h.id, |d| d[0]).unwrap(), 1);
        assert_eq!(second.with_block(h.id, |d| d[0]).unwrap(), 2);
        assert_eq!(store.block_ref_count(h.guid), Some(1));
        assert_eq!(store.stats().blocks_cloned, 1);
    }

    #[test]
    fn test_deferred_remove() {
        let store = store();
        let snap = store.master().unwrap().branch().unwrap();
        let h = snap.create_block(0, 1).unwrap();
        snap.remove_block(h.id).unwrap();
        assert!(snap.find_block(h.id).unwrap().is_none());
        assert!(snap.has_block(h.id).unwrap());
        snap.release_block(h).unwrap();
        assert!(!snap.has_block(h.id).unwrap());
        assert!(snap.remove_block(h.id).is_err());
        assert_eq!(store.block_count(), 0);
    }

    #[test]
    fn test_committed_snapshot_is_read_only() {
        let store = store();
        let snap = store.master().unwrap().branch().unwrap();
        snap.commit().unwrap();
        assert!(snap.create_block(0, 1).is_err());
        assert!(snap.set_metadata("late").is_err());
    }

    // ==================== History ====================

    #[test]
    fn test_named_branches_and_pack() {
        let store = store();
        let master = store.master().unwrap();
        let a = master.branch().unwrap();
        a.commit().unwrap();
        store.set_branch("feature", a.id()).unwrap();
        a.drop_snapshot().unwrap();
        let a_id = a.id();
        drop(a);

        let report = store.pack();
        assert_eq!(report.nodes_removed, 1);
        assert_eq!(store.branch_head("feature"), Some(store.root_snapshot_id()));
        assert!(store.describe(a_id).is_err());
        assert_eq!(store.snapshot_count(), 1);
    }

    #[test]
    fn test_memory_stat_counts_shared_blocks_once() {
        let store = store();
        let a = store.master().unwrap().branch().unwrap();
        for _ in 0..3 {
            let h = a.create_block(0, 9).unwrap();
            a.release_block(h).unwrap();
        }
        a.commit().unwrap();
        let b = a.branch().unwrap();
        b.commit().unwrap();

        let stat = store.memory_stat();
        assert_eq!(stat.total_blocks, 3);
        assert_eq!(stat.total_bytes, 3 * 512);
        let a_stat = stat.snapshot(a.id()).unwrap();
        assert_eq!(a_stat.blocks, 3);
        assert_eq!(a_stat.containers.len(), 1);
        assert_eq!(a_stat.containers[0].type_name, "0x9");
        assert_eq!(stat.snapshot(b.id()).unwrap().bytes, 3 * 512);
    }
}
