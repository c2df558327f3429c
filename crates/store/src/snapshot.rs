//! Snapshot handles.
//!
//! A [`Snapshot`] is a counted handle to one history node. Blocks are
//! checked out with [`Snapshot::find_block`] / [`Snapshot::get_block`] and
//! returned with [`Snapshot::release_block`]; their bytes are reached through
//! the `with_block*` closures while the store lock is held.
//!
//! Lock order is the handle's local state first, then the store state.

use crate::block::{Block, BlockHandle, BlockState};
use crate::cache::TwoQueueCache;
use crate::config::StoreConfig;
use crate::container::{ContainerOperations, ContainerRegistry, ContainerWalker};
use crate::history::{HistoryNode, SnapshotMetadata, SnapshotStatus};
use crate::ptree::PTreeValue;
use crate::root_map::RootMap;
use crate::store::{log_lifecycle, StoreInner, StoreState};
use hashbrown::{HashMap, HashSet};
use memoria_bt::{NodeDescriptor, NodeRegistry, RootMetadata, TreeNode};
use memoria_core::{BlockGuid, BlockId, CtrId, Error, Result, SnapshotId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CacheEntry {
    guid: BlockGuid,
    state: BlockState,
}

#[derive(Debug)]
struct CheckedOut {
    entry: CacheEntry,
    count: usize,
}

struct LocalState {
    cache: TwoQueueCache<BlockId, CacheEntry>,
    checked_out: HashMap<BlockId, CheckedOut>,
    open_ctrs: HashSet<CtrId>,
}

impl LocalState {
    fn new(config: &StoreConfig) -> Self {
        Self {
            cache: TwoQueueCache::new(config.cache_capacity, config.cache_in_ratio, config.cache_out_ratio),
            checked_out: HashMap::new(),
            open_ctrs: HashSet::new(),
        }
    }

    fn set_entry(&mut self, id: BlockId, entry: CacheEntry) {
        if let Some(co) = self.checked_out.get_mut(&id) {
            co.entry = entry;
        }
        if let Some(cached) = self.cache.get_mut(&id) {
            *cached = entry;
        }
    }

    fn ensure_not_checked_out<'a>(&self, ids: impl IntoIterator<Item = &'a BlockId>) -> Result<()> {
        match ids.into_iter().find(|id| self.checked_out.contains_key(*id)) {
            Some(id) => Err(Error::invalid_state(format!("Block {} is checked out", id))),
            None => Ok(()),
        }
    }
}

fn handle(id: BlockId, entry: CacheEntry) -> BlockHandle {
    BlockHandle {
        id,
        guid: entry.guid,
        state: entry.state,
    }
}

fn new_uuid() -> u128 {
    Uuid::new_v4().as_u128()
}

fn missing_version(id: BlockId, guid: BlockGuid) -> Error {
    Error::corrupted(format!("version {} of block {} is not in the arena", guid, id))
}

/// A handle to one snapshot of a [`MemoryStore`](crate::MemoryStore).
pub struct Snapshot {
    store: Arc<StoreInner>,
    id: SnapshotId,
    local: Mutex<LocalState>,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("id", &self.id).finish()
    }
}

impl Snapshot {
    /// Wraps a history node whose reference count was already taken.
    pub(crate) fn attach(store: Arc<StoreInner>, id: SnapshotId) -> Self {
        let local = LocalState::new(&store.config);
        Self {
            store,
            id,
            local: Mutex::new(local),
        }
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.store.config
    }

    pub fn node_registry(&self) -> &NodeRegistry {
        &self.store.nodes
    }

    pub fn container_registry(&self) -> &ContainerRegistry {
        &self.store.containers
    }

    pub fn status(&self) -> Result<SnapshotStatus> {
        Ok(self.store.state.lock().history.get(self.id)?.status)
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status(), Ok(SnapshotStatus::Active))
    }

    pub fn is_committed(&self) -> bool {
        matches!(self.status(), Ok(SnapshotStatus::Committed))
    }

    pub fn is_data_locked(&self) -> bool {
        matches!(self.status(), Ok(SnapshotStatus::DataLocked))
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self.status(), Ok(SnapshotStatus::Dropped))
    }

    pub fn parent(&self) -> Result<Option<SnapshotId>> {
        self.store.state.lock().history.parent_of(self.id)
    }

    pub fn describe(&self) -> Result<SnapshotMetadata> {
        Ok(self.store.state.lock().history.get(self.id)?.describe())
    }

    pub fn metadata(&self) -> Result<String> {
        Ok(self.store.state.lock().history.get(self.id)?.metadata.clone())
    }

    /// Replaces the free-form metadata; active snapshots only.
    pub fn set_metadata(&self, metadata: impl Into<String>) -> Result<()> {
        let mut state = self.store.state.lock();
        let node = state.history.get_mut(self.id)?;
        if node.status != SnapshotStatus::Active {
            return Err(Error::invalid_state(format!(
                "Snapshot {} is {}, metadata can't be changed",
                self.id, node.status
            )));
        }
        node.metadata = metadata.into();
        Ok(())
    }

    fn check_update_allowed(&self) -> Result<()> {
        self.store.state.lock().check_update_allowed(self.id)
    }

    fn require_active(&self) -> Result<()> {
        match self.status()? {
            SnapshotStatus::Active => Ok(()),
            status => Err(Error::invalid_state(format!(
                "Snapshot {} is {}, only active snapshots accept this operation",
                self.id, status
            ))),
        }
    }

    fn check_read_allowed(&self) -> Result<()> {
        self.store.state.lock().tree(self.id).map(|_| ())
    }

    /// Fails unless the snapshot may be a source of container imports.
    pub fn check_if_export_allowed(&self) -> Result<()> {
        let state = self.store.state.lock();
        let node = state.history.get(self.id)?;
        match node.status {
            SnapshotStatus::Active => Err(Error::invalid_state(format!("Snapshot {} is still active", self.id))),
            SnapshotStatus::Dropped if !node.has_data() => {
                Err(Error::invalid_state(format!("Snapshot {} has been cleared", self.id)))
            }
            _ => Ok(()),
        }
    }

    // ==================== Lifecycle ====================

    /// Returns checked-out blocks to the cache and applies deferred removals.
    fn flush(&self, local: &mut LocalState, state: &mut StoreState) {
        let entries: Vec<(BlockId, CheckedOut)> = local.checked_out.drain().collect();
        for (id, co) in entries {
            if co.entry.state == BlockState::Delete {
                if let Err(err) = self.remove_from_tree(state, id) {
                    warn!(snapshot = %self.id, block = %id, error = %err, "deferred removal failed");
                }
            } else {
                self.cache_entry(local, id, co.entry);
            }
        }
    }

    fn cache_entry(&self, local: &mut LocalState, id: BlockId, entry: CacheEntry) {
        let evicted = local.cache.insert(id, entry);
        if !evicted.is_empty() {
            self.store.stats.record_evictions(evicted.len());
            trace!(snapshot = %self.id, evicted = evicted.len(), "evicted cached blocks");
        }
    }

    /// Makes the snapshot immutable.
    pub fn commit(&self) -> Result<()> {
        let mut local = self.local.lock();
        let mut state = self.store.state.lock();
        let status = state.history.get(self.id)?.status;
        if !matches!(status, SnapshotStatus::Active | SnapshotStatus::DataLocked) {
            return Err(Error::invalid_state(format!(
                "Snapshot {} is {}, only active snapshots can be committed",
                self.id, status
            )));
        }
        self.flush(&mut local, &mut state);
        state.history.get_mut(self.id)?.status = SnapshotStatus::Committed;
        log_lifecycle(&self.store.config, self.id, "committed");
        Ok(())
    }

    /// Marks the snapshot for reclamation. Its data goes away when the last
    /// handle is released or the store is packed.
    pub fn drop_snapshot(&self) -> Result<()> {
        let mut local = self.local.lock();
        let mut state = self.store.state.lock();
        if self.id == state.history.root_id() {
            return Err(Error::invalid_operation(format!(
                "Can't drop the root snapshot {}",
                self.id
            )));
        }
        if state.history.get(self.id)?.status == SnapshotStatus::Dropped {
            return Ok(());
        }
        self.flush(&mut local, &mut state);
        state.history.get_mut(self.id)?.status = SnapshotStatus::Dropped;
        log_lifecycle(&self.store.config, self.id, "dropped");
        Ok(())
    }

    /// Freezes container creation while containers are imported.
    pub fn lock_data_for_import(&self) -> Result<()> {
        let local = self.local.lock();
        let mut state = self.store.state.lock();
        let node = state.history.get_mut(self.id)?;
        match node.status {
            SnapshotStatus::DataLocked => Ok(()),
            SnapshotStatus::Active if local.open_ctrs.is_empty() => {
                node.status = SnapshotStatus::DataLocked;
                log_lifecycle(&self.store.config, self.id, "data locked");
                Ok(())
            }
            SnapshotStatus::Active => Err(Error::invalid_state(format!(
                "Snapshot {} has {} open containers",
                self.id,
                local.open_ctrs.len()
            ))),
            status => Err(Error::invalid_state(format!(
                "Snapshot {} is {}, data can't be locked",
                self.id, status
            ))),
        }
    }

    /// Starts a new active snapshot on top of this committed one.
    pub fn branch(&self) -> Result<Snapshot> {
        let mut state = self.store.state.lock();
        let node = state.history.get(self.id)?;
        match node.status {
            SnapshotStatus::Committed => {}
            SnapshotStatus::DataLocked => {
                return Err(Error::invalid_state(format!(
                    "Snapshot {} is locked, branching is not possible.",
                    self.id
                )))
            }
            SnapshotStatus::Active => {
                return Err(Error::invalid_state(format!(
                    "Snapshot {} is still being active. Commit it first.",
                    self.id
                )))
            }
            SnapshotStatus::Dropped => {
                return Err(Error::invalid_state(format!(
                    "Snapshot {} is dropped, branching is not possible.",
                    self.id
                )))
            }
        }
        let tree = state.tree(self.id)?.fork();
        let child_id = SnapshotId::new(new_uuid());
        let child = HistoryNode::branch(node, child_id, tree);
        state.history.attach(child)?;
        drop(state);

        log_lifecycle(&self.store.config, child_id, "branched");
        Ok(Snapshot::attach(Arc::clone(&self.store), child_id))
    }

    // ==================== Blocks ====================

    /// Checks a block out; `None` if the snapshot doesn't hold it.
    pub fn find_block(&self, id: BlockId) -> Result<Option<BlockHandle>> {
        let mut local = self.local.lock();
        if let Some(co) = local.checked_out.get_mut(&id) {
            if co.entry.state == BlockState::Delete {
                return Ok(None);
            }
            co.count += 1;
            let entry = co.entry;
            self.store.stats.record_hit();
            return Ok(Some(handle(id, entry)));
        }
        if let Some(entry) = local.cache.get(&id).copied() {
            local.checked_out.insert(id, CheckedOut { entry, count: 1 });
            self.store.stats.record_hit();
            return Ok(Some(handle(id, entry)));
        }

        let state = self.store.state.lock();
        let Some(value) = state.tree(self.id)?.find(id) else {
            return Ok(None);
        };
        self.store.stats.record_miss();
        let entry = CacheEntry {
            guid: value.guid,
            state: if value.snapshot_id == self.id {
                BlockState::Update
            } else {
                BlockState::Read
            },
        };
        local.checked_out.insert(id, CheckedOut { entry, count: 1 });
        Ok(Some(handle(id, entry)))
    }

    /// Checks a block out; a missing block is an error.
    pub fn get_block(&self, id: BlockId) -> Result<BlockHandle> {
        self.find_block(id)?.ok_or_else(|| Error::not_found("Block", id))
    }

    /// Returns a checked-out block. A block released for the last time goes
    /// to the cache, or away if it was removed meanwhile.
    pub fn release_block(&self, handle: BlockHandle) -> Result<()> {
        let mut local = self.local.lock();
        match local.checked_out.get_mut(&handle.id) {
            Some(co) if co.count > 1 => {
                co.count -= 1;
                return Ok(());
            }
            Some(_) => {}
            None => {
                warn!(snapshot = %self.id, block = %handle.id, "release of a block that is not checked out");
                return Ok(());
            }
        }
        let Some(co) = local.checked_out.remove(&handle.id) else {
            return Ok(());
        };
        if co.entry.state == BlockState::Delete {
            let mut state = self.store.state.lock();
            self.remove_from_tree(&mut state, handle.id)
        } else {
            self.cache_entry(&mut local, handle.id, co.entry);
            Ok(())
        }
    }

    /// Makes a block private to this snapshot, cloning a shared version.
    pub fn update_block(&self, handle: &BlockHandle) -> Result<BlockHandle> {
        let mut local = self.local.lock();
        let mut state = self.store.state.lock();
        state.check_update_allowed(self.id)?;
        if let Some(co) = local.checked_out.get(&handle.id) {
            if co.entry.state == BlockState::Delete {
                return Err(Error::invalid_state(format!(
                    "Block {} is scheduled for removal",
                    handle.id
                )));
            }
        }

        let (tree, arena) = state.tree_and_arena(self.id)?;
        let current = tree.find(handle.id).ok_or_else(|| Error::not_found("Block", handle.id))?;
        let guid = if current.snapshot_id == self.id {
            current.guid
        } else {
            let guid = BlockGuid::new(new_uuid());
            let copy = arena
                .get(current.guid)
                .ok_or_else(|| missing_version(handle.id, current.guid))?
                .clone_as(guid);
            arena.insert(copy);
            tree.assign(handle.id, PTreeValue::new(guid, self.id), arena);
            self.store.stats.record_cloned();
            trace!(snapshot = %self.id, block = %handle.id, from = %current.guid, to = %guid, "copy-on-write");
            guid
        };

        let entry = CacheEntry {
            guid,
            state: BlockState::Update,
        };
        local.set_entry(handle.id, entry);
        Ok(self::handle(handle.id, entry))
    }

    fn adopt(&self, local: &mut LocalState, state: &mut StoreState, block: Block) -> Result<BlockHandle> {
        let (id, guid) = (block.id, block.guid);
        let (tree, arena) = state.tree_and_arena(self.id)?;
        arena.insert(block);
        tree.assign(id, PTreeValue::new(guid, self.id), arena);
        let entry = CacheEntry {
            guid,
            state: BlockState::Update,
        };
        local.checked_out.insert(id, CheckedOut { entry, count: 1 });
        self.store.stats.record_created();
        Ok(handle(id, entry))
    }

    /// Creates a zero-filled block, checked out for update. A size of 0
    /// picks the configured block size.
    pub fn create_block(&self, size: usize, ctr_type_hash: u64) -> Result<BlockHandle> {
        let mut local = self.local.lock();
        let mut state = self.store.state.lock();
        state.check_update_allowed(self.id)?;
        let size = if size == 0 { self.store.config.block_size } else { size };
        let raw = new_uuid();
        let block = Block::new(BlockId::new(raw), BlockGuid::new(raw), ctr_type_hash, size);
        let handle = self.adopt(&mut local, &mut state, block)?;
        trace!(snapshot = %self.id, block = %handle.id, size, "created block");
        Ok(handle)
    }

    /// Creates a new block holding a copy of `handle`'s bytes.
    pub fn clone_block(&self, handle: &BlockHandle) -> Result<BlockHandle> {
        let mut local = self.local.lock();
        let mut state = self.store.state.lock();
        state.check_update_allowed(self.id)?;
        let source = state.block(self.id, handle.id)?;
        let raw = new_uuid();
        let block = Block {
            id: BlockId::new(raw),
            guid: BlockGuid::new(raw),
            ctr_type_hash: source.ctr_type_hash,
            data: source.data.clone(),
        };
        self.adopt(&mut local, &mut state, block)
    }

    /// Removes a block. A checked-out block goes away on its last release.
    pub fn remove_block(&self, id: BlockId) -> Result<()> {
        let mut local = self.local.lock();
        let mut state = self.store.state.lock();
        state.check_update_allowed(self.id)?;
        if let Some(co) = local.checked_out.get_mut(&id) {
            co.entry.state = BlockState::Delete;
            local.cache.remove(&id);
            return Ok(());
        }
        local.cache.remove(&id);
        self.remove_from_tree(&mut state, id)
    }

    fn remove_from_tree(&self, state: &mut StoreState, id: BlockId) -> Result<()> {
        let (tree, arena) = state.tree_and_arena(self.id)?;
        let value = tree.remove(id, arena).ok_or_else(|| Error::not_found("Block", id))?;
        self.store.stats.record_removed();
        if !arena.contains(value.guid) {
            self.store.stats.record_reclaimed(1);
        }
        trace!(snapshot = %self.id, block = %id, "removed block");
        Ok(())
    }

    /// Runs `f` over the bytes of a block.
    pub fn with_block<R>(&self, id: BlockId, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let state = self.store.state.lock();
        let block = state.block(self.id, id)?;
        Ok(f(&block.data))
    }

    /// Runs `f` over the bytes of a private block.
    pub fn with_block_mut<R>(&self, handle: &BlockHandle, f: impl FnOnce(&mut Vec<u8>) -> R) -> Result<R> {
        let mut state = self.store.state.lock();
        let guid = self.private_guid(&state, handle.id)?;
        let block = state.arena.get_mut(guid).ok_or_else(|| missing_version(handle.id, guid))?;
        Ok(f(&mut block.data))
    }

    /// Runs `f` over the bytes of two distinct private blocks.
    pub fn with_blocks_mut<R>(
        &self,
        a: &BlockHandle,
        b: &BlockHandle,
        f: impl FnOnce(&mut Vec<u8>, &mut Vec<u8>) -> R,
    ) -> Result<R> {
        let mut state = self.store.state.lock();
        let guid_a = self.private_guid(&state, a.id)?;
        let guid_b = self.private_guid(&state, b.id)?;
        let (x, y) = state
            .arena
            .get_pair_mut(guid_a, guid_b)
            .ok_or_else(|| Error::invalid_operation(format!("blocks {} and {} are not distinct", a.id, b.id)))?;
        Ok(f(&mut x.data, &mut y.data))
    }

    fn private_guid(&self, state: &StoreState, id: BlockId) -> Result<BlockGuid> {
        state.check_update_allowed(self.id)?;
        let value = state.tree(self.id)?.find(id).ok_or_else(|| Error::not_found("Block", id))?;
        if value.snapshot_id != self.id {
            return Err(Error::invalid_state(format!(
                "Block {} is shared with other snapshots, update it first",
                id
            )));
        }
        Ok(value.guid)
    }

    /// Changes the size of a private block, zero-filling growth.
    pub fn resize_block(&self, handle: &BlockHandle, new_size: usize) -> Result<()> {
        self.with_block_mut(handle, |data| data.resize(new_size, 0))
    }

    /// A copy of the current version of a block.
    pub fn read_block(&self, id: BlockId) -> Result<Block> {
        let state = self.store.state.lock();
        state.block(self.id, id).cloned()
    }

    pub fn has_block(&self, id: BlockId) -> Result<bool> {
        Ok(self.store.state.lock().tree(self.id)?.contains(id))
    }

    /// Number of blocks visible in this snapshot.
    pub fn block_count(&self) -> Result<usize> {
        Ok(self.store.state.lock().tree(self.id)?.len())
    }

    pub fn block_ctr_type_hash(&self, id: BlockId) -> Result<u64> {
        let state = self.store.state.lock();
        Ok(state.block(self.id, id)?.ctr_type_hash)
    }

    /// Human-readable description of a block.
    pub fn describe_block(&self, id: BlockId) -> Result<String> {
        let block = self.read_block(id)?;
        Ok(match self.store.containers.get(block.ctr_type_hash) {
            Ok(ops) => ops.describe_block(&block, &self.store.nodes),
            Err(_) => format!("Block {} ({} bytes)", block.id, block.data.len()),
        })
    }

    fn tree_values(&self, ids: &[BlockId]) -> Result<Vec<(BlockId, PTreeValue)>> {
        let state = self.store.state.lock();
        let tree = state.tree(self.id)?;
        ids.iter()
            .map(|&id| tree.find(id).map(|v| (id, v)).ok_or_else(|| Error::not_found("Block", id)))
            .collect()
    }

    // ==================== Containers ====================

    pub(crate) fn directory_root(&self) -> Result<BlockId> {
        Ok(self.store.state.lock().history.get(self.id)?.root_id)
    }

    pub(crate) fn set_directory_root(&self, root: BlockId) -> Result<()> {
        let mut state = self.store.state.lock();
        state.check_update_allowed(self.id)?;
        state.history.get_mut(self.id)?.root_id = root;
        Ok(())
    }

    fn ctr_ops(&self, root: BlockId) -> Result<Arc<dyn ContainerOperations>> {
        let hash = self.block_ctr_type_hash(root)?;
        self.store.containers.get(hash)
    }

    fn ctr_block_ids(&self, root: BlockId) -> Result<Vec<BlockId>> {
        let mut ids = Vec::new();
        self.ctr_ops(root)?.for_each_ctr_node(root, self, &mut |id| {
            ids.push(id);
            Ok(())
        })?;
        Ok(ids)
    }

    /// Creates an empty container whose root node has the given layout.
    pub fn create_ctr(&self, ctr_id: CtrId, ctr_type_hash: u64, descriptor: &NodeDescriptor) -> Result<BlockId> {
        if ctr_id.is_nil() {
            return Err(Error::invalid_operation("container id must not be nil"));
        }
        self.require_active()?;
        if !self.store.containers.contains(ctr_type_hash) {
            return Err(Error::not_found("Container type", format!("{:#x}", ctr_type_hash)));
        }
        let descriptor = self.store.nodes.get(descriptor.hash())?;
        if self.has_ctr(ctr_id)? {
            return Err(Error::already_exists("Container", ctr_id));
        }

        let handle = self.create_block(0, ctr_type_hash)?;
        let meta = RootMetadata {
            ctr_id,
            ctr_type_hash,
            descriptor_hash: descriptor.hash(),
        };
        let init = self
            .with_block_mut(&handle, |data| {
                let mut node = TreeNode::init(data, descriptor)?;
                node.set_root(true);
                node.set_root_metadata(meta)?;
                node.prepare()
            })
            .and_then(|r| r);
        self.release_block(handle)?;
        if let Err(err) = init {
            self.remove_block(handle.id)?;
            return Err(err);
        }

        RootMap::new(self).assign(ctr_id, handle.id)?;
        debug!(snapshot = %self.id, ctr = %ctr_id, root = %handle.id, "created container");
        Ok(handle.id)
    }

    /// Root block of a container. The nil id names the container directory.
    pub fn root_id(&self, ctr_id: CtrId) -> Result<Option<BlockId>> {
        if ctr_id.is_nil() {
            let root = self.directory_root()?;
            return Ok((!root.is_nil()).then_some(root));
        }
        RootMap::new(self).find(ctr_id)
    }

    pub fn find_ctr(&self, ctr_id: CtrId) -> Result<Option<BlockId>> {
        self.root_id(ctr_id)
    }

    pub fn has_ctr(&self, ctr_id: CtrId) -> Result<bool> {
        Ok(self.root_id(ctr_id)?.is_some())
    }

    pub fn set_root(&self, ctr_id: CtrId, root: BlockId) -> Result<()> {
        if ctr_id.is_nil() {
            return self.set_directory_root(root);
        }
        RootMap::new(self).assign(ctr_id, root).map(|_| ())
    }

    pub fn remove_root(&self, ctr_id: CtrId) -> Result<bool> {
        if ctr_id.is_nil() {
            self.set_directory_root(BlockId::NIL)?;
            return Ok(true);
        }
        Ok(RootMap::new(self).remove(ctr_id)?.is_some())
    }

    /// Ids of all containers, in ascending order.
    pub fn container_names(&self) -> Result<Vec<CtrId>> {
        Ok(RootMap::new(self).entries()?.into_iter().map(|(ctr, _)| ctr).collect())
    }

    pub fn ctr_type_name(&self, ctr_id: CtrId) -> Result<String> {
        let root = self.root_id(ctr_id)?.ok_or_else(|| Error::not_found("Container", ctr_id))?;
        Ok(self.ctr_ops(root)?.type_name().to_string())
    }

    /// Removes a container with all its blocks.
    pub fn drop_ctr(&self, ctr_id: CtrId) -> Result<bool> {
        self.check_update_allowed()?;
        let Some(root) = self.root_id(ctr_id)? else {
            return Ok(false);
        };
        let removed = self.ctr_ops(root)?.drop_ctr(root, self)?;
        RootMap::new(self).remove(ctr_id)?;
        self.local.lock().open_ctrs.remove(&ctr_id);
        debug!(snapshot = %self.id, ctr = %ctr_id, blocks = removed, "dropped container");
        Ok(true)
    }

    /// Copies a container under a new id; a nil `to` picks a fresh one.
    pub fn clone_ctr(&self, from: CtrId, to: CtrId) -> Result<CtrId> {
        self.require_active()?;
        let to = if to.is_nil() { CtrId::new(new_uuid()) } else { to };
        if self.has_ctr(to)? {
            return Err(Error::already_exists("Container", to));
        }
        let root = self.root_id(from)?.ok_or_else(|| Error::not_found("Container", from))?;
        let new_root = self.ctr_ops(root)?.clone_ctr(root, to, self)?;
        RootMap::new(self).assign(to, new_root)?;
        debug!(snapshot = %self.id, from = %from, to = %to, "cloned container");
        Ok(to)
    }

    pub fn for_each_ctr_node(&self, ctr_id: CtrId, f: &mut dyn FnMut(BlockId) -> Result<()>) -> Result<()> {
        let root = self.root_id(ctr_id)?.ok_or_else(|| Error::not_found("Container", ctr_id))?;
        self.ctr_ops(root)?.for_each_ctr_node(root, self, f)
    }

    /// Marks a container as open; open containers block
    /// [`lock_data_for_import`](Self::lock_data_for_import).
    pub fn open_ctr(&self, ctr_id: CtrId) -> Result<BlockId> {
        let root = self.root_id(ctr_id)?.ok_or_else(|| Error::not_found("Container", ctr_id))?;
        self.local.lock().open_ctrs.insert(ctr_id);
        Ok(root)
    }

    pub fn close_ctr(&self, ctr_id: CtrId) -> bool {
        self.local.lock().open_ctrs.remove(&ctr_id)
    }

    /// Runs the structural check of every container; true if problems were
    /// found.
    pub fn check(&self) -> Result<bool> {
        let mut problems = false;
        let directory = self.directory_root()?;
        if !directory.is_nil() && self.ctr_ops(directory)?.check(directory, self)? {
            warn!(snapshot = %self.id, "container directory check failed");
            problems = true;
        }
        for (ctr_id, root) in RootMap::new(self).entries()? {
            if self.ctr_ops(root)?.check(root, self)? {
                warn!(snapshot = %self.id, ctr = %ctr_id, "container check failed");
                problems = true;
            }
        }
        Ok(problems)
    }

    pub fn walk_containers(&self, walker: &mut dyn ContainerWalker) -> Result<()> {
        walker.begin_snapshot(self.id);
        let directory = self.directory_root()?;
        if !directory.is_nil() {
            self.ctr_ops(directory)?.walk(CtrId::NIL, directory, self, walker)?;
        }
        for (ctr_id, root) in RootMap::new(self).entries()? {
            self.ctr_ops(root)?.walk(ctr_id, root, self, walker)?;
        }
        walker.end_snapshot(self.id);
        Ok(())
    }

    // ==================== Import and copy ====================

    fn check_same_store(&self, source: &Snapshot) -> Result<()> {
        if !Arc::ptr_eq(&self.store, &source.store) {
            return Err(Error::invalid_operation("snapshots belong to different stores"));
        }
        if source.id == self.id {
            return Err(Error::invalid_operation(format!(
                "Snapshot {} can't import from itself",
                self.id
            )));
        }
        Ok(())
    }

    /// Blocks of the container currently named `ctr_id` that `incoming`
    /// doesn't list.
    fn stale_blocks(&self, ctr_id: CtrId, incoming: &[BlockId]) -> Result<Vec<BlockId>> {
        let Some(root) = self.root_id(ctr_id)? else {
            return Ok(Vec::new());
        };
        let keep: HashSet<BlockId> = incoming.iter().copied().collect();
        Ok(self
            .ctr_block_ids(root)?
            .into_iter()
            .filter(|id| !keep.contains(id))
            .collect())
    }

    /// Shares a container of a committed snapshot. Blocks keep their
    /// versions, so later updates here copy them first.
    pub fn import_new_ctr_from(&self, source: &Snapshot, ctr_id: CtrId) -> Result<()> {
        self.import_from(source, ctr_id, true)
    }

    /// Like [`import_new_ctr_from`](Self::import_new_ctr_from), replacing an
    /// existing container.
    pub fn import_ctr_from(&self, source: &Snapshot, ctr_id: CtrId) -> Result<()> {
        self.import_from(source, ctr_id, false)
    }

    fn import_from(&self, source: &Snapshot, ctr_id: CtrId, require_new: bool) -> Result<()> {
        self.check_same_store(source)?;
        self.check_update_allowed()?;
        source.check_if_export_allowed()?;
        if require_new && self.has_ctr(ctr_id)? {
            return Err(Error::already_exists("Container", ctr_id));
        }
        let root = source
            .root_id(ctr_id)?
            .ok_or_else(|| Error::not_found("Container", ctr_id))?;
        let ids = source.ctr_block_ids(root)?;
        let values = source.tree_values(&ids)?;
        let stale = self.stale_blocks(ctr_id, &ids)?;

        {
            let mut local = self.local.lock();
            let mut state = self.store.state.lock();
            local.ensure_not_checked_out(ids.iter().chain(&stale))?;
            let (tree, arena) = state.tree_and_arena(self.id)?;
            if require_new {
                if let Some(id) = ids.iter().find(|&&id| tree.contains(id)) {
                    return Err(Error::invalid_operation(format!(
                        "Block {} is not new in snapshot {}",
                        id, self.id
                    )));
                }
            }
            for id in &stale {
                tree.remove(*id, arena);
                local.cache.remove(id);
            }
            for (id, value) in values {
                if tree.find(id).map(|v| v.guid) != Some(value.guid) {
                    tree.assign(id, value, arena);
                }
                local.cache.remove(&id);
            }
        }

        RootMap::new(self).assign(ctr_id, root)?;
        debug!(snapshot = %self.id, source = %source.id, ctr = %ctr_id, blocks = ids.len(), "imported container");
        Ok(())
    }

    /// Copies a container of another snapshot into private blocks.
    pub fn copy_new_ctr_from(&self, source: &Snapshot, ctr_id: CtrId) -> Result<()> {
        self.copy_from(source, ctr_id, true)
    }

    /// Like [`copy_new_ctr_from`](Self::copy_new_ctr_from), replacing an
    /// existing container. Blocks already holding the source version are
    /// kept.
    pub fn copy_ctr_from(&self, source: &Snapshot, ctr_id: CtrId) -> Result<()> {
        self.copy_from(source, ctr_id, false)
    }

    fn copy_from(&self, source: &Snapshot, ctr_id: CtrId, require_new: bool) -> Result<()> {
        self.check_same_store(source)?;
        self.check_update_allowed()?;
        source.check_read_allowed()?;
        if require_new && self.has_ctr(ctr_id)? {
            return Err(Error::already_exists("Container", ctr_id));
        }
        let root = source
            .root_id(ctr_id)?
            .ok_or_else(|| Error::not_found("Container", ctr_id))?;
        let ids = source.ctr_block_ids(root)?;
        let blocks = ids
            .iter()
            .map(|&id| source.read_block(id))
            .collect::<Result<Vec<Block>>>()?;
        let stale = self.stale_blocks(ctr_id, &ids)?;

        let mut copied = 0;
        {
            let mut local = self.local.lock();
            let mut state = self.store.state.lock();
            local.ensure_not_checked_out(ids.iter().chain(&stale))?;
            let (tree, arena) = state.tree_and_arena(self.id)?;
            if require_new {
                if let Some(id) = ids.iter().find(|&&id| tree.contains(id)) {
                    return Err(Error::invalid_operation(format!(
                        "Block {} is not new in snapshot {}",
                        id, self.id
                    )));
                }
            }
            for id in &stale {
                tree.remove(*id, arena);
                local.cache.remove(id);
            }
            for block in blocks {
                if tree.find(block.id).map(|v| v.guid) == Some(block.guid) {
                    continue;
                }
                let guid = BlockGuid::new(new_uuid());
                let id = block.id;
                arena.insert(block.clone_as(guid));
                tree.assign(id, PTreeValue::new(guid, self.id), arena);
                local.cache.remove(&id);
                self.store.stats.record_cloned();
                copied += 1;
            }
        }

        RootMap::new(self).assign(ctr_id, root)?;
        debug!(snapshot = %self.id, source = %source.id, ctr = %ctr_id, copied, "copied container");
        Ok(())
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.local.get_mut().checked_out.clear();
        let mut state = self.store.state.lock();
        let (references, status) = match state.history.get_mut(self.id) {
            Ok(node) => {
                node.references = node.references.saturating_sub(1);
                (node.references, node.status)
            }
            Err(_) => return,
        };
        if references > 0 {
            return;
        }

        let StoreState { arena, history } = &mut *state;
        match status {
            SnapshotStatus::Active | SnapshotStatus::DataLocked => {
                let reclaimed = history.delete_data(self.id, arena).unwrap_or(0);
                self.store.stats.record_reclaimed(reclaimed);
                if let Ok(node) = history.get_mut(self.id) {
                    node.status = SnapshotStatus::Dropped;
                }
                if let Err(err) = history.forget(self.id) {
                    warn!(snapshot = %self.id, error = %err, "discarded snapshot stays in history");
                }
                log_lifecycle(&self.store.config, self.id, "discarded");
            }
            SnapshotStatus::Dropped => {
                let reclaimed = history.delete_data(self.id, arena).unwrap_or(0);
                self.store.stats.record_reclaimed(reclaimed);
                log_lifecycle(&self.store.config, self.id, "data deleted");
            }
            SnapshotStatus::Committed => {}
        }
    }
}
