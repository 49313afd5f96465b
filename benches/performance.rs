//! Performance benchmarks for the document store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use repodb::{
    deep_merge, Content, CryptoCodec, InMemoryRemote, JsonStore, LocalFileStore,
    OptimisticJsonStore, Quota, StoreContext, UpdateOptions,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// A users document with `n` entries, each a small nested object.
fn users_doc(n: usize, tag: &str) -> Content {
    let mut users = serde_json::Map::new();
    for i in 0..n {
        users.insert(
            format!("{}-{}", tag, i),
            json!({"name": format!("user {}", i), "roles": ["reader"], "meta": {"age": i}}),
        );
    }
    let mut doc = Content::new();
    doc.insert("users".into(), Value::Object(users));
    doc
}

/// Benchmark deep merge with growing documents
fn bench_deep_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("deep_merge");

    for size in [10, 100, 1000] {
        let remote = users_doc(size, "remote");
        let local = users_doc(size, "local");
        group.throughput(Throughput::Elements(size as u64 * 2));
        group.bench_with_input(BenchmarkId::new("users", size), &size, |b, _| {
            b.iter(|| black_box(deep_merge(&remote, &local)));
        });
    }

    group.finish();
}

/// Benchmark encryption and decryption of serialized documents
fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let codec = CryptoCodec::new(&[7u8; 32]).unwrap();

    for size in [10, 1000] {
        let plaintext = serde_json::to_vec(&users_doc(size, "u")).unwrap();
        let sealed = codec.encode(&plaintext).unwrap();
        group.throughput(Throughput::Bytes(plaintext.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &plaintext, |b, data| {
            b.iter(|| black_box(codec.encode(data).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &sealed, |b, data| {
            b.iter(|| black_box(codec.decode(data).unwrap()));
        });
    }

    group.finish();
}

fn bump(mut doc: Content) -> Content {
    let n = doc.get("n").and_then(Value::as_u64).unwrap_or(0);
    doc.insert("n".into(), json!(n + 1));
    doc
}

/// Benchmark a full read-modify-write cycle on each backend
fn bench_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("update");
    let rt = runtime();

    // Enough quota that the benchmark never trips the rate limit.
    let remote = Arc::new(InMemoryRemote::new().with_quota(Quota {
        limit: u64::MAX,
        remaining: u64::MAX,
        reset_at: u64::MAX,
    }));
    let store = OptimisticJsonStore::new(remote, StoreContext::default());
    group.bench_function("in_memory_remote", |b| {
        b.iter(|| {
            rt.block_on(store.update("db/counter.json", &bump, UpdateOptions::default()))
                .unwrap()
        });
    });

    let dir = TempDir::new().unwrap();
    let local = LocalFileStore::open(dir.path(), true).unwrap();
    group.sample_size(20);
    group.bench_function("local_file", |b| {
        b.iter(|| {
            rt.block_on(local.update("db/counter.json", &bump, UpdateOptions::default()))
                .unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_deep_merge, bench_codec, bench_update);
criterion_main!(benches);
