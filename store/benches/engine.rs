use criterion::{criterion_group, criterion_main, Criterion, BenchmarkId};
use tidepool_store::{
    config::StoreConfigBuilder,
    engine::Engine,
};

fn engine(dir: &std::path::Path) -> Engine {
    let config = StoreConfigBuilder::default()
        .directory(dir)
        .build()
        .unwrap();
    let engine = Engine::new();
    engine.open(&config).unwrap();
    engine
}

fn benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine::put");
    for payload_size in [16, 512, 8192].iter() {
        group.bench_with_input(BenchmarkId::new("put", payload_size), payload_size, |b, &size| {
            let dir = tempfile::tempdir().unwrap();
            let engine = engine(dir.path());
            let payload = vec![0x42u8; size];
            b.iter(|| {
                engine.put(1u32, b"bench", &payload).unwrap();
            });
        });
    }
    group.finish();

    let mut group = c.benchmark_group("engine::get");
    for limit in [1, 100, 1024].iter() {
        group.bench_with_input(BenchmarkId::new("get", limit), limit, |b, &limit| {
            let dir = tempfile::tempdir().unwrap();
            let engine = engine(dir.path());
            for i in 0..2000u32 {
                engine.put(1u32, b"bench", &i.to_be_bytes()).unwrap();
            }
            b.iter(|| {
                let res = engine.get(1u32, b"bench", limit).unwrap();
                assert_eq!(res.len(), limit);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmarks);
criterion_main!(benches);
