//! Allocator benchmarks
//!
//! These benchmarks measure placement and release per metadata algorithm, both
//! on raw block metadata and through a block vector.
//! Run with: `cargo bench --bench alloc_bench`

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use gma::{
    AllocationDesc, AllocationStrategy, BlockMetadata, BlockVector, BlockVectorConfig,
    BudgetTracker, DefragmentationConfig, DefragmentationContext, MetadataAlgorithm,
    SimulatedDevice,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

const ALGORITHMS: [MetadataAlgorithm; 3] = [
    MetadataAlgorithm::Generic,
    MetadataAlgorithm::Linear,
    MetadataAlgorithm::Tlsf,
];

const BLOCK_SIZE: u64 = 64 * 1024 * 1024;

fn vector(algorithm: MetadataAlgorithm) -> BlockVector {
    BlockVector::new(
        BlockVectorConfig {
            preferred_block_size: BLOCK_SIZE,
            explicit_block_size: true,
            algorithm,
            ..Default::default()
        },
        Arc::new(SimulatedDevice::new()),
        Arc::new(BudgetTracker::unlimited()),
    )
    .expect("valid benchmark config")
}

/// Benchmark alloc immediately followed by free on a half-full block
fn bench_metadata_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("metadata_alloc_free");
    group.throughput(Throughput::Elements(1));

    for algorithm in ALGORITHMS {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{:?}", algorithm)),
            &algorithm,
            |b, &algorithm| {
                let mut metadata = BlockMetadata::new(algorithm, BLOCK_SIZE, 0);
                let mut rng = StdRng::seed_from_u64(7);
                let mut live = Vec::new();
                for i in 0..1000 {
                    let size = rng.gen_range(256..16384);
                    if let Some(request) = metadata.create_allocation_request(
                        size,
                        256,
                        false,
                        AllocationStrategy::Default,
                    ) {
                        metadata.alloc(&request, i);
                        live.push(request.handle);
                    }
                }
                if algorithm != MetadataAlgorithm::Linear {
                    for handle in live.iter().step_by(2) {
                        metadata.free(*handle);
                    }
                }

                b.iter(|| {
                    let request = metadata
                        .create_allocation_request(4096, 256, false, AllocationStrategy::Default)
                        .expect("half-full block has room");
                    metadata.alloc(&request, u64::MAX);
                    metadata.free(black_box(request.handle));
                })
            },
        );
    }

    group.finish();
}

/// Benchmark TLSF placement strategies against each other
fn bench_tlsf_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("tlsf_strategy");
    group.throughput(Throughput::Elements(1));

    let strategies = [
        AllocationStrategy::MinTime,
        AllocationStrategy::MinMemory,
        AllocationStrategy::MinOffset,
    ];
    for strategy in strategies {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{:?}", strategy)),
            &strategy,
            |b, &strategy| {
                let mut metadata = BlockMetadata::new(MetadataAlgorithm::Tlsf, BLOCK_SIZE, 0);
                let handles: Vec<_> = (0..512)
                    .filter_map(|i| {
                        let request = metadata.create_allocation_request(
                            1024 + i * 64,
                            1,
                            false,
                            strategy,
                        )?;
                        metadata.alloc(&request, i);
                        Some(request.handle)
                    })
                    .collect();
                for handle in handles.iter().step_by(3) {
                    metadata.free(*handle);
                }

                b.iter(|| {
                    let request = metadata
                        .create_allocation_request(2048, 1, false, strategy)
                        .expect("block has room");
                    metadata.alloc(&request, u64::MAX);
                    metadata.free(request.handle);
                })
            },
        );
    }

    group.finish();
}

/// Benchmark batch allocation through a block vector
fn bench_vector_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_batch");

    for count in [1usize, 16, 256] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let vector = vector(MetadataAlgorithm::Tlsf);
            let desc = AllocationDesc::default();
            b.iter(|| {
                let ids = vector
                    .allocate(4096, 256, &desc, count)
                    .expect("64 MiB block has room");
                for id in ids {
                    vector.free(id).expect("live allocation");
                }
            })
        });
    }

    group.finish();
}

/// Benchmark one Balanced defragmentation of a scattered vector
fn bench_defragmentation(c: &mut Criterion) {
    c.bench_function("defragment_scattered", |b| {
        b.iter_batched(
            || {
                let vector = BlockVector::new(
                    BlockVectorConfig {
                        preferred_block_size: 1024 * 1024,
                        explicit_block_size: true,
                        ..Default::default()
                    },
                    Arc::new(SimulatedDevice::new()),
                    Arc::new(BudgetTracker::unlimited()),
                )
                .expect("valid benchmark config");
                let ids = vector
                    .allocate(16 * 1024, 256, &AllocationDesc::default(), 512)
                    .expect("room for the batch");
                for id in ids.iter().skip(1).step_by(2) {
                    vector.free(*id).expect("live allocation");
                }
                (vector, ids)
            },
            |(vector, ids)| {
                {
                    let mut ctx = DefragmentationContext::for_vector(
                        &vector,
                        DefragmentationConfig::default(),
                    )
                    .expect("tlsf vector");
                    loop {
                        let moves = ctx.pass_begin().expect("pass_begin");
                        if moves.is_empty() || !ctx.pass_end(&moves).expect("pass_end") {
                            break;
                        }
                    }
                }
                for id in ids.iter().step_by(2) {
                    vector.free(*id).expect("live allocation");
                }
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(
    benches,
    bench_metadata_alloc_free,
    bench_tlsf_strategies,
    bench_vector_batch,
    bench_defragmentation
);
criterion_main!(benches);
