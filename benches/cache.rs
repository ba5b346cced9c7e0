//! Page cache benchmarks for packfs
//!
//! Measures the hot paths of the transactional core: cached loads, eviction
//! under pressure, and full commits of dirty working sets.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use packfs::storage::{MemFile, PageCache};

fn populated_cache(pages: u32) -> PageCache {
    let mut cache = PageCache::new(Arc::new(MemFile::new()));
    for i in 0..pages {
        let mut page = cache.new_page().unwrap();
        page.write(0, &(i + 1).to_le_bytes());
    }
    cache.commit().unwrap();
    cache
}

fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_load");

    for pages in [64u32, 512] {
        group.throughput(Throughput::Elements(pages as u64));
        group.bench_with_input(BenchmarkId::new("hit", pages), &pages, |b, &pages| {
            let cache = populated_cache(pages);
            b.iter(|| {
                for i in 0..pages {
                    let page = cache.load_page(i).unwrap();
                    black_box(page.read_byte(0));
                }
            });
        });
    }

    group.finish();
}

fn bench_trim(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_trim");
    group.throughput(Throughput::Elements(256));

    group.bench_function("evict_new_pages", |b| {
        b.iter_with_setup(
            || {
                let cache = PageCache::new(Arc::new(MemFile::new()));
                for i in 0..256u32 {
                    let mut page = cache.new_page().unwrap();
                    page.write(0, &i.to_le_bytes());
                }
                cache
            },
            |cache| {
                cache.trim(0).unwrap();
                black_box(cache.cached_pages())
            },
        );
    });

    group.finish();
}

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_commit");

    for dirty in [16u32, 128] {
        group.throughput(Throughput::Elements(dirty as u64));
        group.bench_with_input(
            BenchmarkId::new("dirty_pages", dirty),
            &dirty,
            |b, &dirty| {
                b.iter_with_setup(
                    || {
                        let mut cache = populated_cache(dirty);
                        for i in 0..dirty {
                            let mut page =
                                cache.make_page_writable(cache.load_page(i).unwrap());
                            page.write(0, &(i + 100).to_le_bytes());
                        }
                        cache
                    },
                    |mut cache| {
                        cache.commit().unwrap();
                        black_box(cache.page_count())
                    },
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_load, bench_trim, bench_commit);
criterion_main!(benches);
