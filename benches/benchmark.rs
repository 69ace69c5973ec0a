// Write, query and index-rebuild benchmarks
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quiver::prelude::*;
use rand::prelude::*;
use serde_json::json;

const DIM: usize = 128;

fn random_rows(rng: &mut StdRng, n: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|_| (0..DIM).map(|_| rng.random_range(-1.0f32..1.0f32)).collect())
        .collect()
}

fn batch(rng: &mut StdRng, start: usize, n: usize) -> RecordBatch {
    let ids = (start..start + n).map(|i| format!("doc-{}", i)).collect();
    let metadatas = (start..start + n)
        .map(|i| json!({ "bucket": i % 10, "text": format!("document number {}", i) }).as_object().cloned())
        .collect();
    RecordBatch::new(ids, random_rows(rng, n)).with_metadatas(metadatas)
}

fn populated(size: usize, cache_size: usize) -> (Client, Collection) {
    let client = Client::new(ClientConfig::in_memory().with_cache_size(cache_size)).unwrap();
    let collection = client
        .create_collection("bench", None, None, false, DEFAULT_TENANT, DEFAULT_DATABASE)
        .unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    for start in (0..size).step_by(1000) {
        client
            .add(&collection, batch(&mut rng, start, (size - start).min(1000)))
            .unwrap();
    }
    (client, collection)
}

fn benchmark_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.sample_size(10);

    for size in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::new("resident_index", size), size, |b, &size| {
            let mut rng = StdRng::seed_from_u64(1);
            b.iter_with_setup(
                || {
                    let (client, collection) = populated(0, 4);
                    client.add(&collection, batch(&mut rng, 0, 1)).unwrap();
                    // load the index so writes update it incrementally
                    client
                        .query(&collection, &QueryRequest::new(vec![0.0; DIM], 1))
                        .unwrap();
                    (client, collection, batch(&mut rng, 1, size))
                },
                |(client, collection, records)| client.add(&collection, records).unwrap(),
            );
        });
    }

    group.finish();
}

fn benchmark_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");
    let (client, collection) = populated(10000, 4);
    let mut rng = StdRng::seed_from_u64(7);
    let queries = random_rows(&mut rng, 64);
    // warm the cache
    client
        .query(&collection, &QueryRequest::new(queries[0].clone(), 1))
        .unwrap();

    for k in [1, 10, 100].iter() {
        group.bench_with_input(BenchmarkId::new("unfiltered", k), k, |b, &k| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % queries.len();
                let request = QueryRequest::new(queries[i].clone(), k);
                black_box(client.query(&collection, &request).unwrap())
            });
        });
    }

    let filter = RecordFilter::parse(Some(r#"{"bucket": 3}"#), None).unwrap();
    for k in [10, 100].iter() {
        group.bench_with_input(BenchmarkId::new("filtered", k), k, |b, &k| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % queries.len();
                let request = QueryRequest::new(queries[i].clone(), k)
                    .with_filter(filter.clone())
                    .with_include(Include::ALL);
                black_box(client.query(&collection, &request).unwrap())
            });
        });
    }

    group.finish();
}

fn benchmark_cold_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_load");
    group.sample_size(10);

    for size in [1000, 10000].iter() {
        let (client, collection) = populated(*size, 1);
        group.bench_with_input(BenchmarkId::new("rebuild", size), size, |b, _| {
            b.iter(|| {
                client.index_cache().clear();
                black_box(
                    client
                        .query(&collection, &QueryRequest::new(vec![0.0; DIM], 10))
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_insert, benchmark_search, benchmark_cold_load);
criterion_main!(benches);
