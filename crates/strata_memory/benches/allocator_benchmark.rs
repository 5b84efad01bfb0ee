//! # Allocator Benchmark
//!
//! Allocate/free cycles for both allocators and free-list compaction.
//!
//! Run with: `cargo bench --package strata_memory`

// Benchmarks don't need docs
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata_memory::{Backing, BlockAllocator, FreeListAllocator, MemoryRegion, Segment};

const REGION_SIZE: usize = 4 << 20;

fn free_list_region(backing: Backing) -> MemoryRegion {
    MemoryRegion::new(REGION_SIZE, 16, Box::new(FreeListAllocator::new(backing)))
        .expect("benchmark region")
}

/// Benchmark: allocate N small spans, then free them all.
fn bench_free_list_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("free_list_cycle");

    for count in [1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let mut region = free_list_region(Backing::Physical);
            let mut live = Vec::with_capacity(count);
            b.iter(|| {
                for i in 0..count {
                    live.push(region.allocate(16 + (i % 8) * 16).expect("room"));
                }
                for mut segment in live.drain(..) {
                    black_box(region.deallocate(&mut segment));
                }
            });
        });
    }

    group.finish();
}

/// Benchmark: fixed-size block allocate/free.
fn bench_block_cycle(c: &mut Criterion) {
    c.bench_function("block_cycle_10000", |b| {
        let mut region = MemoryRegion::new(
            REGION_SIZE,
            1,
            Box::new(BlockAllocator::new(256, Backing::Physical)),
        )
        .expect("benchmark region");
        let mut live = Vec::with_capacity(10_000);
        b.iter(|| {
            for _ in 0..10_000 {
                live.push(region.allocate(200).expect("free block"));
            }
            for mut segment in live.drain(..) {
                black_box(region.deallocate(&mut segment));
            }
        });
    });
}

/// Benchmark: compaction of a region with every other span freed.
fn bench_compaction(c: &mut Criterion) {
    c.bench_function("compact_fragmented_5000", |b| {
        b.iter_with_setup(
            || {
                let mut rng = StdRng::seed_from_u64(3);
                let mut region = free_list_region(Backing::Virtual);
                let live: Vec<Segment> = (0..5_000)
                    .map(|_| region.allocate(rng.gen_range(16..=512)).expect("room"))
                    .collect();
                for mut segment in live.into_iter().step_by(2) {
                    region.deallocate(&mut segment);
                }
                region
            },
            |mut region| black_box(region.compact()),
        );
    });
}

criterion_group!(benches, bench_free_list_cycle, bench_block_cycle, bench_compaction);

criterion_main!(benches);
