//! Benchmarks for memoria-store using criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use memoria_store::{BlockId, CtrId, MemoryStore, RootMap, StoreConfig};

fn populated(blocks: usize) -> (MemoryStore, Vec<BlockId>, memoria_store::Snapshot) {
    let store = MemoryStore::new(StoreConfig::default()).unwrap();
    let base = store.master().unwrap().branch().unwrap();
    let ids = (0..blocks)
        .map(|_| {
            let h = base.create_block(0, 1).unwrap();
            base.release_block(h).unwrap();
            h.id
        })
        .collect();
    base.commit().unwrap();
    (store, ids, base)
}

fn branch_and_update_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("branch_cow_update");

    for size in [100, 1000, 10000].iter() {
        let (_store, ids, base) = populated(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let branch = base.branch().unwrap();
                for id in ids.iter().step_by(10) {
                    let h = branch.get_block(*id).unwrap();
                    let h2 = branch.update_block(&h).unwrap();
                    branch.with_block_mut(&h2, |d| d[0] = d[0].wrapping_add(1)).unwrap();
                    branch.release_block(h).unwrap();
                }
                black_box(branch.id())
            });
        });
    }

    group.finish();
}

fn read_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_read");

    for size in [100, 1000, 10000].iter() {
        let (_store, ids, base) = populated(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut sum = 0u64;
                for id in ids.iter().step_by(7) {
                    let h = base.get_block(*id).unwrap();
                    sum += base.with_block(h.id, |d| d[0] as u64).unwrap();
                    base.release_block(h).unwrap();
                }
                black_box(sum)
            });
        });
    }

    group.finish();
}

fn root_map_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("root_map_assign");

    for size in [100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let store = MemoryStore::new(StoreConfig::default().with_block_size(1024)).unwrap();
            let master = store.master().unwrap();
            b.iter(|| {
                let snap = master.branch().unwrap();
                let map = RootMap::new(&snap);
                for i in 1..=size as u128 {
                    map.assign(CtrId::new(i * 2_654_435_761), BlockId::new(i)).unwrap();
                }
                black_box(snap.block_count().unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, branch_and_update_benchmark, read_benchmark, root_map_benchmark);
criterion_main!(benches);
