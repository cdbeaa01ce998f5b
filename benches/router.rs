use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use aurora::request::Method;
use aurora::router::Router;
use aurora::Context;

fn ok_handler(_ctx: &mut Context<'_>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    Ok(())
}

fn build_router(routes: usize) -> Router {
    let mut router = Router::new();
    for i in 0..routes {
        router.register(Method::Get, &format!("/resource/{i}/items/:id"), ok_handler).unwrap();
    }
    router.register(Method::Get, "/health", ok_handler).unwrap();
    router
}

fn static_match(c: &mut Criterion) {
    let router = build_router(64);
    c.bench_function("router/static_match", |b| {
        b.iter(|| black_box(router.matches(Method::Get, black_box("/health"))))
    });
}

fn param_match(c: &mut Criterion) {
    for routes in [8usize, 64, 256] {
        let router = build_router(routes);
        let path = format!("/resource/{}/items/42", routes / 2);
        c.bench_with_input(BenchmarkId::new("router/param_match", routes), &path, |b, path| {
            b.iter(|| black_box(router.matches(Method::Get, black_box(path))))
        });
    }
}

fn no_match(c: &mut Criterion) {
    let router = build_router(64);
    c.bench_function("router/no_match", |b| {
        b.iter(|| black_box(router.matches(Method::Get, black_box("/does/not/exist"))))
    });
}

criterion_group!(benches, static_match, param_match, no_match);
criterion_main!(benches);
