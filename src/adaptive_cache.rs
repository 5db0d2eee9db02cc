// Adaptive result cache sitting in front of the upstream service
// TTLs are resolved per entry from the data and from recent cache behaviour

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::{config::CacheConfig, error::ApiError};

pub const DETAILS_KEY_PREFIX: &str = "details:";
pub const COLLECTION_KEY_PREFIX: &str = "collection:";
pub const SEARCH_KEY_PREFIX: &str = "search:";

const LATENCY_SAMPLES: usize = 100;
const LOOKUP_SAMPLES: usize = 100;
const MIN_MULTIPLIER: f64 = 0.1;
const MAX_MULTIPLIER: f64 = 3.0;

// Data characteristics a cached value exposes to the TTL heuristic
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TtlHints {
    pub item_count: Option<usize>,
    pub exact_strategy: bool,
    pub average_score: Option<f64>,
}

pub trait CacheValue: Clone + Send + Sync + 'static {
    fn ttl_hints(&self) -> TtlHints {
        TtlHints::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Details,
    Collection,
    Other,
}

impl KeyKind {
    pub fn of(key: &str) -> Self {
        if key.starts_with(DETAILS_KEY_PREFIX) {
            KeyKind::Details
        } else if key.starts_with(COLLECTION_KEY_PREFIX) {
            KeyKind::Collection
        } else {
            KeyKind::Other
        }
    }
}

// Everything the TTL multiplier depends on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TtlInputs {
    pub hints: TtlHints,
    pub key_kind: KeyKind,
    pub average_latency: Option<Duration>,
    pub hit_rate: Option<f64>,
}

pub fn ttl_multiplier(inputs: &TtlInputs) -> f64 {
    let mut multiplier: f64 = 1.0;

    if inputs.hints.item_count.map_or(false, |count| count > 10) {
        multiplier *= 1.5;
    }
    if inputs.hints.exact_strategy {
        multiplier *= 1.3;
    }
    if inputs.hints.average_score.map_or(false, |score| score > 70.0) {
        multiplier *= 1.2;
    }

    match inputs.key_kind {
        // detail records rarely change, collections change often
        KeyKind::Details => multiplier *= 2.0,
        KeyKind::Collection => multiplier *= 0.5,
        KeyKind::Other => {}
    }

    if let Some(latency) = inputs.average_latency {
        if latency < Duration::from_secs(1) {
            multiplier *= 1.2;
        } else if latency > Duration::from_secs(3) {
            multiplier *= 0.8;
        }
    }

    if let Some(hit_rate) = inputs.hit_rate {
        if hit_rate > 0.7 {
            multiplier *= 1.1;
        } else if hit_rate < 0.3 {
            multiplier *= 0.9;
        }
    }

    multiplier.clamp(MIN_MULTIPLIER, MAX_MULTIPLIER)
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub total_queries: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expired: u64,
    pub average_query_latency_ms: f64,
    pub average_lookup_time_ns: u128,
}

#[derive(Debug, Default)]
struct Counters {
    total_queries: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
    average_lookup_time_ns: u128,
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

pub struct AdaptiveCache<V: CacheValue> {
    store: DashMap<String, CacheEntry<V>>,
    // insertion order for eviction; stale pairs are skipped
    order: Mutex<VecDeque<(String, u64)>>,
    next_seq: AtomicU64,
    config: CacheConfig,
    counters: RwLock<Counters>,
    latencies: Mutex<VecDeque<Duration>>,
    // hit (true) or miss of the most recent lookups
    recent_lookups: Mutex<VecDeque<bool>>,
}

impl<V: CacheValue> AdaptiveCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            store: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            config,
            counters: RwLock::new(Counters::default()),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_SAMPLES)),
            recent_lookups: Mutex::new(VecDeque::with_capacity(LOOKUP_SAMPLES)),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn update_lookup_time(&self, counters: &mut Counters, elapsed: Duration) {
        let n = counters.total_queries as u128;
        counters.average_lookup_time_ns =
            (counters.average_lookup_time_ns * (n - 1) + elapsed.as_nanos()) / n;
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let start = Instant::now();
        let lookup = self.store.get(key).map(|entry| {
            if entry.is_expired() {
                None
            } else {
                Some(entry.value.clone())
            }
        });

        let value = match lookup {
            Some(Some(value)) => Some(value),
            Some(None) => {
                if self.store.remove_if(key, |_, entry| entry.is_expired()).is_some() {
                    self.counters.write().expired += 1;
                    trace!(key, "expired entry removed on read");
                }
                None
            }
            None => None,
        };

        {
            let mut recent = self.recent_lookups.lock();
            if recent.len() == LOOKUP_SAMPLES {
                recent.pop_front();
            }
            recent.push_back(value.is_some());
        }

        let mut counters = self.counters.write();
        counters.total_queries += 1;
        if value.is_some() {
            counters.hits += 1;
        } else {
            counters.misses += 1;
        }
        self.update_lookup_time(&mut counters, start.elapsed());
        value
    }

    // Lookup that leaves the hit/miss statistics untouched
    pub fn peek(&self, key: &str) -> Option<V> {
        self.store
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone())
    }

    // Hit rate over the most recent lookups
    pub fn hit_rate(&self) -> Option<f64> {
        let recent = self.recent_lookups.lock();
        if recent.is_empty() {
            return None;
        }
        let hits = recent.iter().filter(|hit| **hit).count();
        Some(hits as f64 / recent.len() as f64)
    }

    pub fn average_latency(&self) -> Option<Duration> {
        let latencies = self.latencies.lock();
        if latencies.is_empty() {
            return None;
        }
        let total: Duration = latencies.iter().sum();
        Some(total / latencies.len() as u32)
    }

    // Upstream query latency, feeds the TTL heuristic
    pub fn record_latency(&self, latency: Duration) {
        let mut latencies = self.latencies.lock();
        if latencies.len() == LATENCY_SAMPLES {
            latencies.pop_front();
        }
        latencies.push_back(latency);
    }

    pub fn resolve_ttl(&self, key: &str, value: &V) -> Duration {
        let inputs = TtlInputs {
            hints: value.ttl_hints(),
            key_kind: KeyKind::of(key),
            average_latency: self.average_latency(),
            hit_rate: self.hit_rate(),
        };
        self.config.ttl.mul_f64(ttl_multiplier(&inputs))
    }

    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Duration {
        let ttl = ttl.unwrap_or_else(|| self.resolve_ttl(key, &value));
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        let mut order = self.order.lock();
        if !self.store.contains_key(key) {
            while self.store.len() >= self.config.max_size {
                if !self.evict_oldest(&mut order) {
                    break;
                }
            }
        }

        self.store.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
                seq,
            },
        );
        order.push_back((key.to_string(), seq));

        if order.len() > self.config.max_size * 2 {
            order.retain(|(k, s)| self.store.get(k).map_or(false, |e| e.seq == *s));
        }

        debug!(key, ttl_ms = ttl.as_millis() as u64, "cached");
        ttl
    }

    fn evict_oldest(&self, order: &mut VecDeque<(String, u64)>) -> bool {
        while let Some((key, seq)) = order.pop_front() {
            if self.store.remove_if(&key, |_, entry| entry.seq == seq).is_some() {
                self.counters.write().evictions += 1;
                debug!(key = %key, "evicted oldest entry");
                return true;
            }
        }
        false
    }

    pub fn remove(&self, key: &str) -> bool {
        self.store.remove(key).is_some()
    }

    pub fn sweep_expired(&self) -> usize {
        let before = self.store.len();
        self.store.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.store.len());
        if removed > 0 {
            self.counters.write().expired += removed as u64;
            debug!(removed, "swept expired cache entries");
        }
        removed
    }

    pub fn clear(&self) -> usize {
        let removed = self.store.len();
        self.store.clear();
        self.order.lock().clear();
        removed
    }

    // Removes every key matching the regular expression `pattern`
    pub fn clear_pattern(&self, pattern: &str) -> Result<usize, ApiError> {
        let regex = Regex::new(pattern).map_err(|e| {
            ApiError::validation(
                format!("invalid cache key pattern {pattern:?}: {e}"),
                "The cache pattern is not a valid expression.",
            )
        })?;
        let before = self.store.len();
        self.store.retain(|key, _| !regex.is_match(key));
        Ok(before.saturating_sub(self.store.len()))
    }

    pub fn stats(&self) -> CacheStats {
        let counters = self.counters.read();
        let hit_rate = if counters.total_queries == 0 {
            0.0
        } else {
            counters.hits as f64 / counters.total_queries as f64
        };
        CacheStats {
            size: self.store.len(),
            max_size: self.config.max_size,
            total_queries: counters.total_queries,
            hits: counters.hits,
            misses: counters.misses,
            hit_rate,
            evictions: counters.evictions,
            expired: counters.expired,
            average_query_latency_ms: self
                .average_latency()
                .map_or(0.0, |d| d.as_secs_f64() * 1000.0),
            average_lookup_time_ns: counters.average_lookup_time_ns,
        }
    }

    // Periodic sweep on its own task; holds only a weak reference to the cache
    pub fn start_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = self.config.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match cache.upgrade() {
                    Some(cache) => {
                        cache.sweep_expired();
                    }
                    None => break,
                }
            }
        });
        SweeperHandle {
            handle: Some(handle),
        }
    }
}

pub struct SweeperHandle {
    handle: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
