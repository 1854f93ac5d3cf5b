//! Allocation throughput of every allocator against the system allocator.
//!
//! Run with: `cargo bench`

use std::alloc::{Layout, alloc, dealloc};

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use regionalloc::{
    Allocator, FixedAllocator, HeapAllocator, HeapConfig, LinearAllocator, PoolAllocator, RegionFreeList,
};

/// Blocks allocated and freed per iteration.
const BATCH: usize = 1_000;

fn bench_system(c: &mut Criterion) {
    let mut group = c.benchmark_group("system");

    for size in [32usize, 256, 2048] {
        let layout = Layout::from_size_align(size, 16).unwrap();
        let mut pointers = Vec::with_capacity(BATCH);

        group.bench_with_input(BenchmarkId::from_parameter(size), &layout, |b, layout| {
            b.iter(|| {
                for _ in 0..BATCH {
                    pointers.push(unsafe { alloc(*layout) });
                }
                for pointer in pointers.drain(..) {
                    unsafe { dealloc(black_box(pointer), *layout) };
                }
            });
        });
    }

    group.finish();
}

fn bench_heap(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap");
    let mut heap: HeapAllocator = HeapAllocator::new(HeapConfig::default()).unwrap();

    for size in [32usize, 256, 2048] {
        let mut pointers = Vec::with_capacity(BATCH);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                for _ in 0..BATCH {
                    pointers.push(heap.allocate_default(size).unwrap());
                }
                for pointer in pointers.drain(..) {
                    unsafe { heap.deallocate(black_box(pointer)) };
                }
            });
        });
    }

    group.finish();
}

fn bench_pool(c: &mut Criterion) {
    let free_list: RegionFreeList = RegionFreeList::new(0x40000);
    let mut pool = PoolAllocator::new(&free_list, 64).unwrap();
    let mut pointers = Vec::with_capacity(BATCH);

    c.bench_function("pool_64", |b| {
        b.iter(|| {
            for _ in 0..BATCH {
                pointers.push(pool.allocate_default(64).unwrap());
            }
            // Free in reverse to exercise merging with the following run.
            while let Some(pointer) = pointers.pop() {
                unsafe { pool.deallocate(black_box(pointer)) };
            }
        });
    });
}

fn bench_fixed(c: &mut Criterion) {
    let mut fixed: FixedAllocator = FixedAllocator::new(BATCH * 64, 64, 16).unwrap();
    let mut pointers = Vec::with_capacity(BATCH);

    c.bench_function("fixed_64", |b| {
        b.iter(|| {
            for _ in 0..BATCH {
                pointers.push(fixed.allocate_default(64).unwrap());
            }
            for pointer in pointers.drain(..) {
                unsafe { fixed.deallocate(black_box(pointer)) };
            }
        });
    });
}

fn bench_linear(c: &mut Criterion) {
    let mut linear: LinearAllocator = LinearAllocator::new(BATCH * 64 + 0x1000).unwrap();

    c.bench_function("linear_64", |b| {
        b.iter(|| {
            linear.push_marker().unwrap();
            for _ in 0..BATCH {
                black_box(linear.allocate_default(64).unwrap());
            }
            linear.pop_marker();
        });
    });
}

criterion_group!(benches, bench_system, bench_heap, bench_pool, bench_fixed, bench_linear);
criterion_main!(benches);
