use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pgc::{Cache, CacheConfig, PageEntryDescriptor, SearchMethod};
use rand::prelude::*;

fn make_cache() -> Arc<Cache> {
    let config = CacheConfig::builder()
        .partitions(8)
        .clean_size_floor(64 * 1024 * 1024)
        .free_clean_cb(Box::new(|_| {}))
        .save_dirty_cb(Box::new(|_, _| Ok(())))
        .build()
        .expect("valid bench config");
    Cache::new(config)
}

fn desc(section: u64, metric_id: u64, start: i64) -> PageEntryDescriptor {
    PageEntryDescriptor {
        section,
        metric_id,
        start_time: start,
        end_time: start + 60,
        update_every: 1,
        size: 4096,
        data: Arc::from(vec![0u8; 4096]),
        custom_data: None,
        hot: false,
    }
}

fn bench_add_and_release(c: &mut Criterion) {
    let cache = make_cache();
    let mut start = 0i64;
    c.bench_function("add_and_acquire_then_release", |b| {
        b.iter(|| {
            let page = cache.add_and_acquire(desc(1, 1, start));
            cache.release(black_box(page));
            start += 60;
        })
    });
}

fn bench_closest_search(c: &mut Criterion) {
    let cache = make_cache();
    for i in 0..10_000i64 {
        cache.release(cache.add_and_acquire(desc(2, 1, i * 60)));
    }
    let mut rng = StdRng::seed_from_u64(42);
    c.bench_function("closest_search", |b| {
        b.iter(|| {
            let t = rng.gen_range(0..600_000i64);
            if let Some(page) = cache.find(2, 1, black_box(t), SearchMethod::Closest) {
                cache.release(page);
            }
        })
    });
}

fn bench_eviction(c: &mut Criterion) {
    c.bench_function("evict_10000_pages", |b| {
        b.iter_with_setup(
            || {
                let cache = make_cache();
                for i in 0..10_000i64 {
                    cache.release(cache.add_and_acquire(desc(3, 1, i)));
                }
                cache
            },
            |cache| {
                black_box(cache.evict_pages(usize::MAX));
            },
        )
    });
}

criterion_group!(benches, bench_add_and_release, bench_closest_search, bench_eviction);
criterion_main!(benches);
