// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Storage write/read throughput benchmark.
//!
//! Measures the cost of the revision spin lock's write-lock/unlock pair
//! and the read-lock stability loop, across a few value sizes, isolated
//! from any network I/O.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use lancaster::storage::{CreateSpec, Storage};
use std::hint::black_box as bb;

fn spec(value_size: usize, queue_capacity: u64) -> CreateSpec {
    CreateSpec {
        base_id: 0,
        max_id: 1_024,
        value_size,
        property_size: 0,
        queue_capacity,
        description: "storage_throughput bench".to_string(),
        data_version: 1,
        persist: false,
    }
}

fn bench_write_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("storage_write_record");
    for value_size in [8usize, 64, 256, 1024] {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp
            .path()
            .join(format!("w{value_size}"))
            .to_string_lossy()
            .into_owned();
        let storage = Storage::create(&path, spec(value_size, 1024)).unwrap();
        let value = vec![0xABu8; value_size];
        group.bench_with_input(
            BenchmarkId::from_parameter(value_size),
            &value_size,
            |b, _| {
                b.iter(|| {
                    storage.write_record(bb(0), bb(&value), None).unwrap();
                });
            },
        );
    }
    group.finish();
}

fn bench_read_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("storage_read_record");
    for value_size in [8usize, 64, 256, 1024] {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp
            .path()
            .join(format!("r{value_size}"))
            .to_string_lossy()
            .into_owned();
        let storage = Storage::create(&path, spec(value_size, 0)).unwrap();
        storage
            .write_record(0, &vec![0xCDu8; value_size], None)
            .unwrap();
        group.bench_with_input(
            BenchmarkId::from_parameter(value_size),
            &value_size,
            |b, _| {
                b.iter(|| {
                    let rec = storage.get_record(bb(0)).unwrap();
                    loop {
                        let before = rec.read_lock().unwrap();
                        let _ = bb(rec.value());
                        if before == rec.revision() {
                            break;
                        }
                    }
                });
            },
        );
    }
    group.finish();
}

fn bench_change_queue_drain(c: &mut Criterion) {
    c.bench_function("storage_change_queue_drain_1024", |b| {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("q").to_string_lossy().into_owned();
        let storage = Storage::create(&path, spec(8, 2048)).unwrap();
        b.iter(|| {
            for id in 0..1024 {
                storage.write_record(id, &[0u8; 8], None).unwrap();
            }
            let mut cursor = 0u64;
            let mut out = lancaster::batch::ChangedBatch::default();
            lancaster::batch::read_changed_records(&storage, &mut cursor, 0, 1024, &mut out)
                .unwrap();
            bb(&out);
        });
    });
}

criterion_group!(
    benches,
    bench_write_record,
    bench_read_record,
    bench_change_queue_drain
);
criterion_main!(benches);
