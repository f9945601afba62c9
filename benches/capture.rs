use baskets::basket::{BasketConfig, Page};
use baskets::capture::CaptureRecord;
use baskets::storage::{Backend, BasketEntry, EmbeddedBackend, MemoryBackend, SqlBackend};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hyper::{HeaderMap, Method};
use tempfile::TempDir;

const CAPACITY: usize = 200;

fn record(size: usize) -> CaptureRecord {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", "application/json".parse().unwrap());
    headers.insert("user-agent", "bench/1.0".parse().unwrap());

    CaptureRecord::from_parts(
        &Method::POST,
        &"/bench/hook?event=push&id=42".parse().unwrap(),
        &headers,
        vec![b'x'; size],
        false,
        "127.0.0.1:50000",
    )
}

fn backends(dir: &TempDir) -> Vec<(&'static str, Box<dyn Backend>)> {
    let backends: Vec<(&'static str, Box<dyn Backend>)> = vec![
        ("memory", Box::new(MemoryBackend::new())),
        (
            "embedded",
            Box::new(EmbeddedBackend::open(&dir.path().join("bench.db")).unwrap()),
        ),
        (
            "sql",
            Box::new(SqlBackend::open(&dir.path().join("bench.sqlite").to_string_lossy()).unwrap()),
        ),
    ];

    for (_, backend) in &backends {
        backend
            .create("bench", &BasketEntry::new("token", BasketConfig::with_capacity(CAPACITY)))
            .unwrap();
    }

    backends
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    let dir = TempDir::new().unwrap();

    for (kind, backend) in backends(&dir) {
        for size in [128, 4_096] {
            let record = record(size);
            group.bench_with_input(BenchmarkId::new(kind, size), &record, |b, record| {
                b.iter(|| backend.append("bench", black_box(record.clone())).unwrap());
            });
        }
    }

    group.finish();
}

fn bench_requests_page(c: &mut Criterion) {
    let mut group = c.benchmark_group("requests_page");
    let dir = TempDir::new().unwrap();

    for (kind, backend) in backends(&dir) {
        for _ in 0..CAPACITY {
            backend.append("bench", record(512)).unwrap();
        }

        group.bench_function(kind, |b| {
            b.iter(|| backend.requests("bench", black_box(Page::new(20, 40))).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_append, bench_requests_page);
criterion_main!(benches);
