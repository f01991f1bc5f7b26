//! Benchmarks for merging mutations into a pending request and sealing it.
//!
//! Merges are measured against requests of growing size, since every merge
//! touches the per-column history and sealing walks all of it.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use common::RowChanges;
use retention::{PendingRequest, RowKey};
use tokio::time::Instant;

/// Number of distinct columns touched by the request.
const COLUMN_COUNTS: &[usize] = &[1, 16, 256];

/// Merges recorded before sealing.
const MERGES: usize = 64;

fn request() -> PendingRequest {
    PendingRequest::new(RowKey::new("users", "u1"), Instant::now())
}

fn overwrite(columns: usize, merge: usize) -> RowChanges {
    let column = format!("c{}", merge % columns);
    RowChanges::new().with_change("props", column, format!("v{}", merge))
}

fn increment(columns: usize, merge: usize) -> RowChanges {
    let column = format!("c{}", merge % columns);
    RowChanges::new().with_increment("stats", column, 1)
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("pending/merge");

    for &columns in COLUMN_COUNTS {
        let overwrites: Vec<RowChanges> = (0..MERGES).map(|m| overwrite(columns, m)).collect();
        group.throughput(Throughput::Elements(MERGES as u64));
        group.bench_with_input(
            BenchmarkId::new("overwrite", columns),
            &overwrites,
            |b, overwrites| {
                b.iter(|| {
                    let request = request();
                    for changes in overwrites {
                        request
                            .start_merge()
                            .unwrap()
                            .record_update(None, black_box(changes));
                    }
                    black_box(request)
                });
            },
        );

        let increments: Vec<RowChanges> = (0..MERGES).map(|m| increment(columns, m)).collect();
        group.bench_with_input(
            BenchmarkId::new("increment", columns),
            &increments,
            |b, increments| {
                b.iter(|| {
                    let request = request();
                    for changes in increments {
                        request
                            .start_merge()
                            .unwrap()
                            .record_update(None, black_box(changes));
                    }
                    black_box(request)
                });
            },
        );
    }

    group.finish();
}

fn bench_seal(c: &mut Criterion) {
    let mut group = c.benchmark_group("pending/seal");

    for &columns in COLUMN_COUNTS {
        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("mixed", columns), |b| {
            b.iter_batched(
                || {
                    let request = request();
                    for merge in 0..MERGES {
                        let changes = if merge % 2 == 0 {
                            overwrite(columns, merge)
                        } else {
                            increment(columns, merge)
                        };
                        request
                            .start_merge()
                            .unwrap()
                            .record_update(None, &changes);
                    }
                    request
                },
                |request| black_box(request.seal()),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_merge, bench_seal);
criterion_main!(benches);
