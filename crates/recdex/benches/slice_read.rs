use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use recdex::{
    IndexSlice, IndexedReader, MemoryVfs, PackedArray, Recdex, RecdexConfig, RecordFormat,
};
use serde_json::{Value, json};

const RECORD_COUNTS: [u64; 2] = [1_000, 10_000];

fn record(i: u64) -> Value {
    json!({"seq": i, "name": format!("record-{i}"), "tags": ["a", "b"], "score": i * 3})
}

fn json_reader(count: u64) -> IndexedReader<recdex::JsonLines<Value>> {
    let vfs = Arc::new(MemoryVfs::new());
    let store = Recdex::new(vfs, RecdexConfig::default()).expect("default config");
    let mut writer = store
        .open_json_lines::<Value>("bench.jsonl", "w")
        .expect("open for writing")
        .into_writer()
        .expect("writer");
    writer.extend((0..count).map(record)).expect("write records");
    writer.close().expect("close writer");
    store
        .open_json_lines::<Value>("bench.jsonl", "r")
        .expect("open for reading")
        .into_reader()
        .expect("reader")
}

fn packed_reader(count: u64) -> IndexedReader<PackedArray<Value>> {
    let vfs = Arc::new(MemoryVfs::new());
    let store = Recdex::new(vfs, RecdexConfig::default()).expect("default config");
    let mut writer = store
        .open_packed::<Value>("bench.msgpack", "w")
        .expect("open for writing")
        .into_writer()
        .expect("writer");
    writer.extend((0..count).map(record)).expect("write records");
    writer.close().expect("close writer");
    store
        .open_packed::<Value>("bench.msgpack", "r")
        .expect("open for reading")
        .into_reader()
        .expect("reader")
}

/// Deterministic scattered positions.
fn scattered(count: u64, n: usize) -> Vec<i64> {
    let mut state = 0x9e37_79b9_u64;
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            ((state >> 33) % count) as i64
        })
        .collect()
}

fn bench_reader<F>(c: &mut Criterion, label: &str, make: fn(u64) -> IndexedReader<F>)
where
    F: RecordFormat<Record = Value>,
{
    let mut group = c.benchmark_group(format!("{label}_slice_read"));
    for count in RECORD_COUNTS {
        let reader = make(count);
        let positions = scattered(count, 256);

        group.throughput(Throughput::Elements(positions.len() as u64));
        group.bench_with_input(BenchmarkId::new("random_get", count), &positions, |b, positions| {
            b.iter(|| {
                for &i in positions {
                    criterion::black_box(reader.get(i).expect("get"));
                }
            });
        });

        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::new("contiguous", count), &reader, |b, reader| {
            b.iter(|| {
                let records = reader.batch_get(..).expect("slice").to_vec().expect("read");
                criterion::black_box(records.len());
            });
        });

        group.throughput(Throughput::Elements(count.div_ceil(3)));
        group.bench_with_input(BenchmarkId::new("strided", count), &reader, |b, reader| {
            b.iter(|| {
                let records = reader
                    .batch_get(IndexSlice::step_by(-3))
                    .expect("slice")
                    .to_vec()
                    .expect("read");
                criterion::black_box(records.len());
            });
        });
    }
    group.finish();
}

fn bench_json_lines(c: &mut Criterion) {
    bench_reader(c, "json_lines", json_reader);
}

fn bench_packed(c: &mut Criterion) {
    bench_reader(c, "packed", packed_reader);
}

criterion_group!(benches, bench_json_lines, bench_packed);
criterion_main!(benches);
