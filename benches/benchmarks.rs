//! Benchmarks for forkpoint operations.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::io::Cursor;

use forkpoint::{
    DivergenceLocator, HashAlgorithm, HierarchicalHasher, LocatorBuilder, StreamHashChecker,
};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn bench_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest");

    for size in [4096, 65536, 1_048_576].iter() {
        let data = pattern(*size);

        group.throughput(Throughput::Bytes(*size as u64));
        for algorithm in HashAlgorithm::ALL {
            group.bench_with_input(
                BenchmarkId::new(algorithm.name(), size),
                &data,
                |b, data| {
                    b.iter(|| algorithm.digest(black_box(data)));
                },
            );
        }
    }

    group.finish();
}

fn bench_hierarchical(c: &mut Criterion) {
    let mut group = c.benchmark_group("hierarchical");
    let hasher = HierarchicalHasher::new();

    for size in [65536, 1_048_576, 8_388_608].iter() {
        let data = pattern(*size);
        let len = *size as u64;

        group.throughput(Throughput::Bytes(len));
        group.bench_with_input(BenchmarkId::new("single_pass", size), &data, |b, data| {
            b.iter(|| {
                hasher
                    .hash_stream(Cursor::new(black_box(data)), 0, len, 5, HashAlgorithm::Blake3)
                    .unwrap()
            });
        });
        group.bench_with_input(BenchmarkId::new("random_access", size), &data, |b, data| {
            b.iter(|| {
                hasher
                    .hash_random_access(
                        &mut Cursor::new(black_box(data)),
                        0,
                        len,
                        5,
                        HashAlgorithm::Blake3,
                    )
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_locate(c: &mut Criterion) {
    let mut group = c.benchmark_group("locate");

    for size in [10_240, 1_048_576].iter() {
        let source = pattern(*size);
        let mut target = source.clone();
        target[size * 2 / 3] ^= 0xFF;

        group.throughput(Throughput::Bytes(*size as u64 * 2));
        for fan_out in [2, 5, 16] {
            let locator: DivergenceLocator = LocatorBuilder::new().fan_out(fan_out).build();
            group.bench_with_input(
                BenchmarkId::new(format!("fan_out_{fan_out}"), size),
                &(&source, &target),
                |b, (source, target)| {
                    b.iter(|| {
                        let source = StreamHashChecker::new(Cursor::new(black_box(*source)));
                        let target = StreamHashChecker::new(Cursor::new(black_box(*target)));
                        locator.locate(&source, &target).unwrap()
                    });
                },
            );
        }
    }

    // Identical inputs settle in a single round
    let data = pattern(1_048_576);
    group.bench_function("identical", |b| {
        let locator = DivergenceLocator::new();
        b.iter(|| {
            let source = StreamHashChecker::new(Cursor::new(black_box(&data)));
            let target = StreamHashChecker::new(Cursor::new(black_box(&data)));
            locator.locate(&source, &target).unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_digest, bench_hierarchical, bench_locate);

criterion_main!(benches);
