use criterion::{black_box, criterion_group, criterion_main, Criterion};

use aurora::buffer::pool::BufferPool;

fn acquire_release_cycle(c: &mut Criterion) {
    c.bench_function("buffer_pool/acquire_release_tiny", |b| {
        let mut pool = BufferPool::new();
        b.iter(|| {
            let buf = pool.acquire(black_box(256));
            pool.release(buf);
        })
    });
}

fn acquire_without_release(c: &mut Criterion) {
    c.bench_function("buffer_pool/acquire_cold_large", |b| {
        b.iter(|| {
            let mut pool = BufferPool::new();
            black_box(pool.acquire(black_box(32 * 1024)));
        })
    });
}

criterion_group!(benches, acquire_release_cycle, acquire_without_release);
criterion_main!(benches);
