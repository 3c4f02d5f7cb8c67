// Write performance benchmarks for larch

use larch::{CompressionType, Database, Options};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use tempfile::TempDir;

fn fresh(options: Options) -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::create(temp_dir.path(), &["t"], options).unwrap();
    (temp_dir, db)
}

fn benchmark_sequential_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_write");

    for size in [100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let (_dir, mut db) = fresh(Options::default().no_sync(true));
                let table = db.table_mut("t").unwrap();

                for i in 0..size {
                    let key = format!("key{:08}", i);
                    let value = format!("value{:08}", i);
                    table.add(key.as_bytes(), value.as_bytes()).unwrap();
                }
                db.commit().unwrap();

                black_box(&db);
            });
        });
    }

    group.finish();
}

fn benchmark_random_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("random_write");

    for size in [100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let (_dir, mut db) = fresh(Options::default().no_sync(true));
                let table = db.table_mut("t").unwrap();

                use rand::Rng;
                let mut rng = rand::rng();

                for _ in 0..size {
                    let key_num: u32 = rng.random();
                    let key = format!("key{:010}", key_num);
                    let value = format!("value{:010}", key_num);
                    table.add(key.as_bytes(), value.as_bytes()).unwrap();
                }
                db.commit().unwrap();

                black_box(&db);
            });
        });
    }

    group.finish();
}

fn benchmark_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");

    for sync in [false, true] {
        let label = if sync { "synced" } else { "no_sync" };
        let (_dir, mut db) = fresh(Options::default().no_sync(!sync));
        let mut i = 0u64;
        group.bench_function(label, |b| {
            b.iter(|| {
                i += 1;
                db.table_mut("t").unwrap().add(&i.to_be_bytes(), b"value").unwrap();
                black_box(db.commit().unwrap());
            });
        });
    }

    group.finish();
}

fn benchmark_value_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("value_size");

    for value_size in [100, 1000, 10000, 100000].iter() {
        let value = vec![b'x'; *value_size];
        group.throughput(Throughput::Bytes((*value_size * 100) as u64));
        for compression in [CompressionType::None, CompressionType::default()] {
            let id = BenchmarkId::new(format!("{:?}", compression), value_size);
            group.bench_with_input(id, &value, |b, value| {
                b.iter(|| {
                    let (_dir, mut db) = fresh(Options::default().no_sync(true).compression(compression));
                    let table = db.table_mut("t").unwrap();
                    for i in 0..100u32 {
                        table.add(&i.to_be_bytes(), value).unwrap();
                    }
                    db.commit().unwrap();
                    black_box(&db);
                });
            });
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_sequential_write,
    benchmark_random_write,
    benchmark_commit,
    benchmark_value_size
);
criterion_main!(benches);
