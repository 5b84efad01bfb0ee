//! # Allocator Scenario Tests
//!
//! Randomized workloads against whole regions, checking the accounting and
//! layout guarantees after every step.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use strata_memory::{
    Backing, BlockAllocator, CompactionPolicy, FreeListAllocator, MemoryRegion, Range, Segment,
};

const MIB: usize = 1 << 20;

fn free_list(size: usize, alignment: usize, backing: Backing) -> MemoryRegion {
    MemoryRegion::new(size, alignment, Box::new(FreeListAllocator::new(backing))).unwrap()
}

fn assert_accounting(region: &MemoryRegion) {
    let allocator = region.allocator();
    assert_eq!(
        allocator.free_size() + allocator.used_size(),
        region.size(),
        "free + used must cover the region"
    );
}

fn assert_disjoint_and_contained(region: &MemoryRegion, live: &[Segment]) {
    let mut ranges: Vec<Range> = live.iter().map(Segment::range).collect();
    ranges.sort();
    for range in &ranges {
        assert!(region.range().contains(range), "{range} escapes {}", region.range());
    }
    for pair in ranges.windows(2) {
        assert!(!pair[0].overlaps(&pair[1]), "{} overlaps {}", pair[0], pair[1]);
    }
}

/// Test: fill 1 MiB with small random sizes, then free 500 at random.
#[test]
fn test_one_mebibyte_random_fill() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut region = free_list(MIB, 1, Backing::Physical);
    let sizes = [2usize, 8, 4, 32];

    let mut live = Vec::new();
    let mut allocated = 0;
    loop {
        let size = *sizes.choose(&mut rng).unwrap();
        if allocated + size > region.size() {
            break;
        }
        let segment = region.allocate(size).expect("region has room for the draw");
        assert_eq!(segment.size(), size);
        allocated += size;
        live.push(segment);
    }

    let allocator = region.allocator();
    assert_eq!(allocator.used_size(), allocated);
    assert_eq!(allocator.free_size(), region.size() - allocated);

    for _ in 0..500 {
        let index = rng.gen_range(0..live.len());
        let mut segment = live.swap_remove(index);
        assert!(region.deallocate(&mut segment));
        assert!(!segment.is_valid());
        assert_accounting(&region);
    }

    assert!(region.allocator().available().iter().all(|free| free.size() > 0));
    assert!(live.iter().all(|segment| region.owns(segment)));
}

/// Test: a block pool hands out exactly floor(R / B) blocks.
#[test]
fn test_block_pool_capacity() {
    const BLOCK: usize = 48;
    let mut region =
        MemoryRegion::new(1000, 1, Box::new(BlockAllocator::new(BLOCK, Backing::Virtual))).unwrap();
    let capacity = region.size() / BLOCK;

    let mut live: Vec<Segment> = (0..capacity)
        .map(|_| region.allocate(BLOCK).expect("pool has a free block"))
        .collect();
    assert!(region.allocate(1).is_none());
    assert_disjoint_and_contained(&region, &live);

    let mut freed = live.swap_remove(capacity / 2);
    assert!(region.deallocate(&mut freed));

    let again = region.allocate(BLOCK).unwrap();
    assert_eq!(again.size(), BLOCK);
    assert!(region.allocate(BLOCK).is_none());
}

/// Test: allocating then freeing everything leaves one free span.
#[test]
fn test_fragmentation_round_trip() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut region = free_list(64 * 1024, 16, Backing::Virtual);

    let mut live: Vec<Segment> = Vec::new();
    while let Some(segment) = region.allocate(rng.gen_range(1..=512)) {
        live.push(segment);
    }
    live.shuffle(&mut rng);
    for mut segment in live {
        assert!(region.deallocate(&mut segment));
    }

    assert!(region.compact());
    assert_eq!(region.allocator().available(), vec![region.range()]);
    assert!(region.allocator().committed().is_empty());
}

/// Test: random allocate/free interleavings never overlap or escape.
#[test]
fn test_random_interleaving_keeps_layout() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut region = free_list(32 * 1024, 8, Backing::Virtual);
    let mut live: Vec<Segment> = Vec::new();

    for step in 0..4000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            if let Some(segment) = region.allocate(rng.gen_range(1..=256)) {
                assert_eq!(segment.range().begin() % 8, 0);
                live.push(segment);
            }
        } else {
            let index = rng.gen_range(0..live.len());
            let mut segment = live.swap_remove(index);
            assert!(region.deallocate(&mut segment), "step {step}: live segment rejected");
        }
        assert_accounting(&region);
        if step % 100 == 0 {
            assert_disjoint_and_contained(&region, &live);
        }
    }
}

fn compact_preserves(policy: CompactionPolicy) {
    let mut rng = StdRng::seed_from_u64(99);
    let allocator = FreeListAllocator::new(Backing::Physical).with_policy(policy);
    let mut region = MemoryRegion::new(16 * 1024, 8, Box::new(allocator)).unwrap();

    let mut live: Vec<Segment> = Vec::new();
    for _ in 0..200 {
        if let Some(segment) = region.allocate(rng.gen_range(8..=96)) {
            live.push(segment);
        }
    }
    let mut survivors = Vec::new();
    for (index, mut segment) in live.into_iter().enumerate() {
        if index % 3 == 0 {
            assert!(region.deallocate(&mut segment));
        } else {
            survivors.push(segment);
        }
    }
    for (index, segment) in survivors.iter().enumerate() {
        assert!(region.write(segment, &(index as u64)));
    }
    let sizes: Vec<usize> = survivors.iter().map(Segment::size).collect();
    let used = region.allocator().used_size();

    assert!(region.compact());

    assert_eq!(region.allocator().used_size(), used);
    assert_disjoint_and_contained(&region, &survivors);
    for (index, segment) in survivors.iter().enumerate() {
        assert!(segment.is_valid());
        assert!(region.owns(segment));
        assert_eq!(segment.size(), sizes[index]);
        assert_eq!(region.read::<u64>(segment), Some(index as u64));
    }
    assert_accounting(&region);
}

/// Test: compaction keeps handles valid and data intact (first fit).
#[test]
fn test_compact_preserves_handles_first_fit() {
    compact_preserves(CompactionPolicy::FirstFit);
}

/// Test: compaction keeps handles valid and data intact (best fit).
#[test]
fn test_compact_preserves_handles_best_fit() {
    compact_preserves(CompactionPolicy::BestFit);
}

/// Test: handles outlive their region as invalid sentinels.
#[test]
fn test_segment_outliving_region_is_invalid() {
    let mut region = free_list(4096, 1, Backing::Virtual);
    let segment = region.allocate(64).unwrap();
    assert!(segment.is_valid());
    drop(region);
    assert!(!segment.is_valid());
    assert_eq!(segment.range(), Range::EMPTY);
}
