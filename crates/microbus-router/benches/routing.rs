//! Subscription lookup benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use microbus_router::Router;

/// Routes shaped like the endpoints of a typical microservice.
fn service_routes(endpoints: usize) -> Router<usize> {
    let mut router = Router::new();
    for i in 0..endpoints {
        let _ = router.insert(&format!("/op{i}"), i);
        let _ = router.insert(&format!("/entity{i}/{{key}}"), i);
        let _ = router.insert(&format!("/entity{i}/{{key}}/files/{{path+}}"), i);
    }
    router
}

fn bench_lookup(c: &mut Criterion) {
    let router = service_routes(32);
    let mut group = c.benchmark_group("lookup");
    for (name, path) in [
        ("literal", "/op17"),
        ("capture", "/entity17/8f3a"),
        ("greedy", "/entity17/8f3a/files/2024/05/report.pdf"),
        ("miss", "/entity17/8f3a/nothing"),
    ] {
        group.bench_function(name, |b| b.iter(|| black_box(router.match_path(black_box(path)))));
    }
    group.finish();
}

fn bench_endpoint_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("endpoints");
    for endpoints in [4, 64, 1024] {
        let router = service_routes(endpoints);
        group.bench_with_input(BenchmarkId::from_parameter(endpoints), &router, |b, router| {
            b.iter(|| black_box(router.match_path("/entity3/abc")));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_lookup, bench_endpoint_count);
criterion_main!(benches);
