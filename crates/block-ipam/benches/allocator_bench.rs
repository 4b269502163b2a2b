//! Performance benchmarks for block bitmaps, block carving and allocation

use block_ipam::allocator::cidr;
use block_ipam::models::AllocationBitmap;
use block_ipam::{
    AllocationRequest, BlockRecord, EngineConfig, IpFamily, IpamEngine, MemoryDatastore, Pool,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ipnet::IpNet;
use std::str::FromStr;
use std::sync::Arc;

/// Benchmark filling a block from empty
fn bench_block_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_fill");

    for prefix in [26u8, 24, 20].iter() {
        let block = IpNet::from_str(&format!("10.100.0.0/{}", prefix)).unwrap();
        let pool = IpNet::from_str("10.100.0.0/16").unwrap();
        let capacity = 1u64 << (32 - *prefix as u32);

        group.throughput(Throughput::Elements(capacity));
        group.bench_with_input(BenchmarkId::new("prefix", prefix), prefix, |b, _| {
            b.iter(|| {
                let mut record = BlockRecord::new(block, pool, Some("bench"));
                let mut count = 0u32;
                while let Some(ordinal) = record.lowest_free() {
                    record.allocate(ordinal, None, 1);
                    count += 1;
                }
                black_box(count)
            });
        });
    }

    group.finish();
}

/// Benchmark lowest-free search in a fragmented bitmap
fn bench_fragmented_search(c: &mut Criterion) {
    c.bench_function("bitmap_first_clear_fragmented", |b| {
        b.iter_batched(
            || {
                // /16 worth of ordinals, every address but the last taken
                let mut bitmap = AllocationBitmap::new(65536);
                for ordinal in 0..65535 {
                    bitmap.set(ordinal);
                }
                bitmap
            },
            |bitmap| black_box(bitmap.first_clear()),
            criterion::BatchSize::LargeInput,
        );
    });
}

/// Benchmark release and reuse within a full block
fn bench_release_reuse(c: &mut Criterion) {
    let block = IpNet::from_str("10.100.0.0/26").unwrap();
    let pool = IpNet::from_str("10.100.0.0/16").unwrap();

    c.bench_function("block_release_reuse", |b| {
        let mut record = BlockRecord::new(block, pool, Some("bench"));
        while let Some(ordinal) = record.lowest_free() {
            record.allocate(ordinal, None, 1);
        }

        b.iter(|| {
            record.release(black_box(31));
            let ordinal = record.lowest_free();
            if let Some(ordinal) = ordinal {
                record.allocate(ordinal, None, 1);
            }
            black_box(ordinal)
        });
    });
}

/// Benchmark deterministic block carving
fn bench_block_carving(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_carving");

    for (label, pool, prefix) in [
        ("ipv4_/8", "10.0.0.0/8", 26u8),
        ("ipv6_/48", "fd80:24e2:f998::/48", 122u8),
    ] {
        let pool = IpNet::from_str(pool).unwrap();
        group.bench_function(label, |b| {
            b.iter(|| {
                let mut last = None;
                for index in 0..1024u128 {
                    last = cidr::nth_block(&pool, prefix, black_box(index));
                }
                black_box(last)
            });
        });
    }

    group.finish();
}

/// Benchmark end-to-end allocation through the engine
fn bench_engine_allocation(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    c.bench_function("engine_allocate_release", |b| {
        let pool = Pool::new(IpNet::from_str("10.0.0.0/16").unwrap());
        let store = Arc::new(MemoryDatastore::with_pools([pool]).unwrap());
        let engine = IpamEngine::new(store, EngineConfig::for_host("bench")).unwrap();
        let request = AllocationRequest::auto(IpFamily::V4);

        b.iter(|| {
            runtime.block_on(async {
                let allocated = engine.allocate_ip(&request).await.unwrap();
                engine.release_ip(allocated.ip()).await.unwrap();
                black_box(allocated)
            })
        });
    });
}

criterion_group!(
    benches,
    bench_block_fill,
    bench_fragmented_search,
    bench_release_reuse,
    bench_block_carving,
    bench_engine_allocation
);
criterion_main!(benches);
