use boardgame_gateway::{
    config::CacheConfig,
    service::{details_key, search_key, CachedPayload},
    AdaptiveCache, GameDetailRecord, SearchResultItem, SearchResults, SearchStrategy, TypeFilter,
    GameType,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{seq::SliceRandom, thread_rng, Rng};
use std::{sync::Arc, thread, time::Duration};

fn search_payload(query: &str, items: usize) -> CachedPayload {
    let mut results = SearchResults::empty(query, SearchStrategy::Fuzzy, None);
    for id in 0..items as u64 {
        let mut item = SearchResultItem::unscored(id + 1, format!("{query} {id}"), 2000, GameType::BaseGame);
        item.search_score = 50.0 + (id % 50) as f64;
        results.items.push(item);
    }
    results.total = items;
    CachedPayload::Search(results)
}

// Mixed read/write load from several threads, 70% reads
pub fn cache_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("adaptive_cache");

    for max_size in [1_000usize, 10_000, 100_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(max_size), max_size, |b, &max_size| {
            let queries = (0..100).map(|i| format!("game{i}")).collect::<Vec<_>>();
            let ids = (1..=500u64).collect::<Vec<_>>();

            b.iter(|| {
                let cache = Arc::new(AdaptiveCache::<CachedPayload>::new(CacheConfig {
                    ttl: Duration::from_secs(300),
                    max_size,
                    cleanup_interval: Duration::from_secs(60),
                }));

                let mut handles = vec![];
                for _ in 0..4 {
                    let cache = Arc::clone(&cache);
                    let queries = queries.clone();
                    let ids = ids.clone();

                    handles.push(thread::spawn(move || {
                        let mut rng = thread_rng();
                        for _ in 0..250 {
                            let query = queries.choose(&mut rng).unwrap();
                            let id = *ids.choose(&mut rng).unwrap();

                            if rng.gen_bool(0.3) {
                                if rng.gen_bool(0.5) {
                                    let key = search_key(query, TypeFilter::All, SearchStrategy::Fuzzy);
                                    cache.set(&key, search_payload(query, rng.gen_range(1..30)), None);
                                } else {
                                    let record = GameDetailRecord::new(id, format!("Game {id}"));
                                    cache.set(&details_key(id), CachedPayload::Details(record), None);
                                }
                            } else if rng.gen_bool(0.5) {
                                let key = search_key(query, TypeFilter::All, SearchStrategy::Fuzzy);
                                let _ = cache.get(&key);
                            } else {
                                let _ = cache.get(&details_key(id));
                            }
                        }
                    }));
                }

                for handle in handles {
                    handle.join().unwrap();
                }

                black_box(cache.stats())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, cache_benchmark);
criterion_main!(benches);
