//! Performance benchmarks for quill-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quill_engine::{
    default_contract, resolve_conflict, CacheSnapshot, Operation, OperationLog, Provenance, Row,
    Strategy, VersionedRecord,
};
use serde_json::json;

const STORY: &str = "Mara stood at the gate of the old mill. A lantern flickered in the \
                     window while the Guide waited by the river, humming an old song.";

fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().unwrap_or_default()
}

fn segment(id: u64, updated_at: u64) -> VersionedRecord {
    VersionedRecord::new_remote(
        format!("seg_{id}"),
        "segments",
        row(json!({"content": STORY, "title": format!("Segment {id}")})),
        updated_at,
    )
}

fn bench_choice_guard(c: &mut Criterion) {
    let mut group = c.benchmark_group("choice_guard");
    let contract = default_contract();

    let valid = json!(["Open the door", "Call for help", "Wait quietly"]);
    let invalid = json!(["Follow the path", "go", "Find another way"]);

    group.bench_function("validate_valid", |b| {
        b.iter(|| contract.validate(black_box(STORY), Some(black_box(&valid))))
    });

    group.bench_function("validate_invalid", |b| {
        b.iter(|| contract.validate(black_box(STORY), Some(black_box(&invalid))))
    });

    group.bench_function("merge_rejecting", |b| {
        b.iter(|| {
            contract.merge(
                black_box("seg_1"),
                black_box(STORY),
                Some(&valid),
                Provenance::Local,
                black_box(&invalid),
            )
        })
    });

    group.finish();
}

fn bench_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolution");

    let server = segment(1, 2000);
    let client = VersionedRecord::new_local("seg_1", "segments", row(json!({"content": "x"})), 3000);

    for (name, strategy) in [
        ("server_wins", Strategy::ServerWins),
        ("client_wins", Strategy::ClientWins),
        ("timestamp_based", Strategy::TimestampBased),
        ("manual_fallback", Strategy::Manual(None)),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| resolve_conflict(black_box(&server), black_box(&client), &strategy))
        });
    }

    group.finish();
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");

    for size in [100u64, 1000] {
        group.bench_with_input(BenchmarkId::new("next_ready", size), &size, |b, &size| {
            let mut log = OperationLog::new();
            for i in 0..size {
                // Ten operations per record
                log.enqueue(Operation::update(
                    format!("op_{i}"),
                    "segments",
                    format!("seg_{}", i / 10),
                    row(json!({"title": format!("T{i}")})),
                    i,
                ));
            }

            b.iter(|| log.next_ready(black_box(u64::MAX)))
        });
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for size in [100u64, 1000] {
        let mut snapshot = CacheSnapshot::new();
        for i in 0..size {
            snapshot.put_record(segment(i, 1000 + i));
        }
        let json = snapshot.to_json().unwrap_or_default();

        group.bench_with_input(BenchmarkId::new("to_json", size), &snapshot, |b, s| {
            b.iter(|| s.to_json())
        });

        group.bench_with_input(BenchmarkId::new("from_json", size), &json, |b, json| {
            b.iter(|| CacheSnapshot::from_json(black_box(json)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_choice_guard,
    bench_resolution,
    bench_queue,
    bench_snapshot,
);
criterion_main!(benches);
