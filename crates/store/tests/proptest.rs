//! Property-based tests for memoria-store using proptest.

use memoria_store::{BlockId, CtrId, MemoryStore, RootMap, StoreConfig};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn small_store() -> MemoryStore {
    MemoryStore::new(StoreConfig::default().with_block_size(512).with_cache_capacity(8)).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Blocks written in a committed snapshot are unaffected by its branches.
    #[test]
    fn branches_never_leak_into_parents(
        ops in prop::collection::vec((0u8..3, any::<usize>(), any::<u8>()), 1..60),
    ) {
        let store = small_store();
        let first = store.master().unwrap().branch().unwrap();
        let mut model: Vec<(BlockId, u8)> = Vec::new();

        for (op, slot, byte) in ops {
            if op == 0 || model.is_empty() {
                let h = first.create_block(64, 1).unwrap();
                first.with_block_mut(&h, |d| d[0] = byte).unwrap();
                first.release_block(h).unwrap();
                model.push((h.id, byte));
            } else if op == 1 {
                let idx = slot % model.len();
                let h = first.get_block(model[idx].0).unwrap();
                let h2 = first.update_block(&h).unwrap();
                first.with_block_mut(&h2, |d| d[0] = byte).unwrap();
                first.release_block(h).unwrap();
                model[idx].1 = byte;
            } else {
                let idx = slot % model.len();
                let (id, _) = model.remove(idx);
                first.remove_block(id).unwrap();
            }
        }
        first.commit().unwrap();
        prop_assert_eq!(store.block_count(), model.len());

        let second = first.branch().unwrap();
        for (id, byte) in &model {
            let h = second.get_block(*id).unwrap();
            let h2 = second.update_block(&h).unwrap();
            second.with_block_mut(&h2, |d| d[0] = byte.wrapping_add(1)).unwrap();
            second.release_block(h).unwrap();
        }
        for (id, byte) in &model {
            prop_assert_eq!(first.with_block(*id, |d| d[0]).unwrap(), *byte);
            prop_assert_eq!(second.with_block(*id, |d| d[0]).unwrap(), byte.wrapping_add(1));
        }
        prop_assert_eq!(store.block_count(), model.len() * 2);

        drop(second);
        prop_assert_eq!(store.block_count(), model.len());
    }

    /// The container directory behaves like an ordered map.
    #[test]
    fn root_map_matches_btreemap(
        ops in prop::collection::vec((any::<bool>(), 1u128..400), 1..300),
    ) {
        let store = small_store();
        let snap = store.master().unwrap().branch().unwrap();
        let map = RootMap::new(&snap);
        let mut model: BTreeMap<u128, BlockId> = BTreeMap::new();

        for (insert, key) in ops {
            let ctr = CtrId::new(key);
            if insert {
                let root = BlockId::new(key + 10_000);
                let previous = map.assign(ctr, root).unwrap();
                prop_assert_eq!(previous, model.insert(key, root));
            } else {
                prop_assert_eq!(map.remove(ctr).unwrap(), model.remove(&key));
            }
        }

        let expected: Vec<(CtrId, BlockId)> = model.iter().map(|(k, v)| (CtrId::new(*k), *v)).collect();
        prop_assert_eq!(map.entries().unwrap(), expected);
        prop_assert!(!snap.check().unwrap());
        if model.is_empty() {
            prop_assert_eq!(snap.block_count().unwrap(), 0);
        }
    }
}
