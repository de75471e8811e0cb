// Benchmarks for replicated state machine performance
// Measures batch write application and snapshot encoding

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use raftable_api::{BatchWriteRequest, WriteRequest};
use raftable_consistency::raft::request::RaftRequest;
use raftable_consistency::raft::state::{DatabaseState, encode_snapshot};

fn populated_state(rows: usize) -> DatabaseState {
    let mut state = DatabaseState::new();
    let mut events = Vec::new();
    state.create_table("bench", None, &mut events);
    let mut builder = BatchWriteRequest::builder();
    for i in 0..rows {
        builder = builder.put("bench", &format!("key-{}", i), format!("value-{}", i).into_bytes());
    }
    state.apply(&RaftRequest::Write { batch: builder.build() }, &mut events);
    state
}

fn bench_apply_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_batch");
    for size in [1usize, 10, 100] {
        let mut builder = BatchWriteRequest::builder();
        for i in 0..size {
            builder = builder.add(WriteRequest::put("bench", &format!("key-{}", i), b"value".to_vec()));
        }
        let request = RaftRequest::Write { batch: builder.build() };

        group.bench_with_input(BenchmarkId::from_parameter(size), &request, |b, request| {
            let mut state = populated_state(0);
            let mut events = Vec::with_capacity(size);
            b.iter(|| {
                events.clear();
                black_box(state.apply(black_box(request), &mut events))
            })
        });
    }
    group.finish();
}

fn bench_conditional_abort(c: &mut Criterion) {
    let mut state = populated_state(100);
    let request = RaftRequest::Write {
        batch: BatchWriteRequest::builder()
            .put("bench", "fresh", b"x".to_vec())
            .add(WriteRequest::put_if_absent("bench", "key-1", b"y".to_vec()))
            .build(),
    };
    let mut events = Vec::new();

    c.bench_function("apply_batch_aborted", |b| {
        b.iter(|| black_box(state.apply(black_box(&request), &mut events)))
    });
}

fn bench_encode_snapshot(c: &mut Criterion) {
    let state = populated_state(10_000);
    let mut group = c.benchmark_group("encode_snapshot");
    for compress in [false, true] {
        group.bench_with_input(BenchmarkId::from_parameter(compress), &compress, |b, &compress| {
            b.iter(|| encode_snapshot(black_box(&state), compress))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_apply_batch,
    bench_conditional_abort,
    bench_encode_snapshot
);
criterion_main!(benches);
