use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use store_arena::{ArenaAllocator, ThreadLocalArena};

fn pool_allocate_free(c: &mut Criterion) {
    let pool = ArenaAllocator::with_pool_size(1);
    pool.request_arena().unwrap();

    let mut group = c.benchmark_group("pool_allocate_free");
    for size in [16usize, 64, 1024, 16 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let ptr = pool.allocate(black_box(size)).unwrap();
                unsafe { pool.free(ptr.as_ptr(), size) };
            })
        });
    }
    group.finish();
}

fn bump_reserve(c: &mut Criterion) {
    let pool = ArenaAllocator::with_pool_size(1);
    let mut region = ThreadLocalArena::new(&pool);
    region.init(1 << 20).unwrap();

    c.bench_function("bump_reserve_64", |b| {
        b.iter(|| {
            if region.reserve(black_box(64), 16).is_err() {
                region.clear();
            }
        })
    });
}

fn bump_fill_and_clear(c: &mut Criterion) {
    let pool = ArenaAllocator::with_pool_size(1);
    let mut region = ThreadLocalArena::new(&pool);
    region.init(64 * 1024).unwrap();

    c.bench_function("bump_fill_64k_then_clear", |b| {
        b.iter(|| {
            while region.allocate(black_box(48)).is_ok() {}
            region.clear();
        })
    });
}

criterion_group!(benches, pool_allocate_free, bump_reserve, bump_fill_and_clear);
criterion_main!(benches);
