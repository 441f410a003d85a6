use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mvcc_store::backend::Backend;
use mvcc_store::lease::{NoopLeaseManager, StaticConsistentIndex};
use mvcc_store::Store;

fn open_store() -> Store {
    Store::open(Backend::open_in_memory(), Arc::new(NoopLeaseManager), Arc::new(StaticConsistentIndex::new(1)))
        .expect("open_in_memory store never fails recovery")
}

fn put_and_get(store: &Store, key: &[u8], value: &[u8]) {
    let mut w = store.begin_write().expect("store is not closed");
    w.put(key, value, 0).expect("put");
    w.end().expect("end");

    let r = store.begin_read().expect("store is not closed");
    let (kvs, _) = r.range(key, &[key, &[0u8]].concat(), 0, 0).expect("range");
    black_box(kvs);
}

fn criterion_benchmark(c: &mut Criterion) {
    let store = open_store();
    c.bench_function("put then point read", |b| {
        b.iter(|| put_and_get(&store, b"bench-key", b"bench-value"));
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
