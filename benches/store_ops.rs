use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use kvidxkit::{Direction, EngineType, Store};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempdir::TempDir;

const ENTRIES: u64 = 10_000;

fn engines() -> Vec<(&'static str, EngineType)> {
    let mut list = vec![("memory", EngineType::InMemory)];
    #[cfg(feature = "rocksdb")]
    list.push(("rocksdb", EngineType::RocksDB));
    #[cfg(feature = "redb")]
    list.push(("redb", EngineType::Redb));
    list
}

fn populated_store(engine: EngineType) -> (TempDir, Store) {
    let dir = TempDir::new("kvidx-bench").expect("bench dir");
    let store = Store::new(dir.path().join("bench"), engine).expect("bench store");
    let mut rng = StdRng::seed_from_u64(7);
    store.begin().expect("begin");
    for key in 0..ENTRIES {
        let data: Vec<u8> = (0..rng.gen_range(16..128)).map(|_| rng.gen()).collect();
        store.insert(key, rng.gen(), rng.gen(), &data).expect("insert");
    }
    store.commit().expect("commit");
    (dir, store)
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_1k");
    group.throughput(Throughput::Elements(1_000));
    for (name, engine) in engines() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &engine, |b, &engine| {
            b.iter_batched(
                || {
                    let dir = TempDir::new("kvidx-bench").expect("bench dir");
                    let store = Store::new(dir.path().join("bench"), engine).expect("bench store");
                    (dir, store)
                },
                |(dir, store)| {
                    for key in 0..1_000u64 {
                        store.insert(key, 0, 0, b"benchmark payload").expect("insert");
                    }
                    drop(store);
                    drop(dir);
                },
                BatchSize::PerIteration,
            )
        });
    }
    group.finish();
}

fn bench_point_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("point_get");
    for (name, engine) in engines() {
        let (_dir, store) = populated_store(engine);
        let mut rng = StdRng::seed_from_u64(11);
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.iter(|| {
                let key = rng.gen_range(0..ENTRIES);
                black_box(store.get(black_box(key)).expect("get"));
            })
        });
    }
    group.finish();
}

fn bench_forward_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_full");
    group.throughput(Throughput::Elements(ENTRIES));
    for (name, engine) in engines() {
        let (_dir, store) = populated_store(engine);
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.iter(|| {
                let mut bytes = 0usize;
                for entry in store.range(.., Direction::Forward).expect("range") {
                    bytes += entry.expect("entry").data.len();
                }
                black_box(bytes);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_insert, bench_point_get, bench_forward_scan);
criterion_main!(benches);
