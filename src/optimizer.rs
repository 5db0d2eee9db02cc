// Request optimisation on top of the rate-limited client:
// adaptive throttling, retry with backoff, id batching and prefetch prediction.

use std::{
    collections::{HashSet, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    config::RetryConfig,
    error::{ApiError, FailureKind},
    rate_limited_client::RateLimitedClient,
};

// Upstream caps the number of ids per thing request
pub const MAX_BATCH_SIZE: usize = 20;
const HEALTH_WINDOW: usize = 20;
const HEALTH_MIN_SAMPLES: usize = 5;
const DEGRADED_FAILURE_RATE: f64 = 0.2;
const UNHEALTHY_FAILURE_RATE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SystemHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl SystemHealth {
    pub fn rate_multiplier(&self) -> f64 {
        match self {
            SystemHealth::Healthy => 1.0,
            SystemHealth::Degraded => 0.6,
            SystemHealth::Unhealthy => 0.2,
        }
    }

    fn from_failure_rate(rate: f64) -> Self {
        if rate >= UNHEALTHY_FAILURE_RATE {
            SystemHealth::Unhealthy
        } else if rate >= DEGRADED_FAILURE_RATE {
            SystemHealth::Degraded
        } else {
            SystemHealth::Healthy
        }
    }
}

// Exponential backoff with jitter
pub fn calculate_backoff(retry_attempt: u32, config: &RetryConfig) -> Duration {
    let base_ms = config.base_delay.as_millis() as f64;
    let max_ms = config.max_delay.as_millis() as f64;
    let base_backoff_ms = (base_ms * config.backoff_multiplier.powf(retry_attempt as f64)).min(max_ms);

    let jitter = rand::random::<f64>() * config.jitter_factor * base_backoff_ms;
    let backoff_ms = (base_backoff_ms * (1.0 - config.jitter_factor / 2.0) + jitter).min(max_ms);

    Duration::from_millis(backoff_ms as u64)
}

// Dedupes (keeping first occurrence) and splits into upstream-sized batches
pub fn batch_ids(ids: &[u64]) -> Vec<Vec<u64>> {
    let mut seen = HashSet::with_capacity(ids.len());
    let unique: Vec<u64> = ids
        .iter()
        .copied()
        .filter(|id| *id != 0 && seen.insert(*id))
        .collect();
    unique.chunks(MAX_BATCH_SIZE).map(<[u64]>::to_vec).collect()
}

// Only outcomes that say something about the upstream count toward health
fn reflects_upstream(kind: FailureKind) -> bool {
    !matches!(
        kind,
        FailureKind::ValidationError | FailureKind::ServiceUnavailable
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OptimizerStats {
    pub health: SystemHealth,
    pub rate_multiplier: f64,
    pub recent_failure_rate: f64,
    pub retries: u64,
    pub batches: u64,
    pub tracked_ids: usize,
}

pub struct ApiOptimizer {
    client: Arc<RateLimitedClient>,
    retry: RetryConfig,
    // true for success
    outcomes: Mutex<VecDeque<bool>>,
    health: RwLock<SystemHealth>,
    access_counts: DashMap<u64, u64>,
    retries: AtomicU64,
    batches: AtomicU64,
}

impl ApiOptimizer {
    pub fn new(client: Arc<RateLimitedClient>, retry: RetryConfig) -> Self {
        Self {
            client,
            retry,
            outcomes: Mutex::new(VecDeque::with_capacity(HEALTH_WINDOW)),
            health: RwLock::new(SystemHealth::Healthy),
            access_counts: DashMap::new(),
            retries: AtomicU64::new(0),
            batches: AtomicU64::new(0),
        }
    }

    pub fn client(&self) -> &Arc<RateLimitedClient> {
        &self.client
    }

    pub fn health(&self) -> SystemHealth {
        *self.health.read()
    }

    // Applies the health level to the client's request rate; returns the multiplier
    pub fn set_system_health(&self, health: SystemHealth) -> f64 {
        let multiplier = health.rate_multiplier();
        let previous = std::mem::replace(&mut *self.health.write(), health);
        if previous != health {
            info!(?previous, current = ?health, multiplier, "adjusting upstream request rate");
        }
        self.client.set_rate_multiplier(multiplier);
        multiplier
    }

    fn recent_failure_rate(outcomes: &VecDeque<bool>) -> f64 {
        if outcomes.is_empty() {
            return 0.0;
        }
        outcomes.iter().filter(|ok| !**ok).count() as f64 / outcomes.len() as f64
    }

    pub fn record_outcome(&self, outcome: Result<(), FailureKind>) -> SystemHealth {
        let success = match outcome {
            Ok(()) => true,
            Err(kind) if reflects_upstream(kind) => false,
            Err(_) => return self.health(),
        };

        let rate = {
            let mut outcomes = self.outcomes.lock();
            if outcomes.len() == HEALTH_WINDOW {
                outcomes.pop_front();
            }
            outcomes.push_back(success);
            if outcomes.len() < HEALTH_MIN_SAMPLES {
                return self.health();
            }
            Self::recent_failure_rate(&outcomes)
        };

        let health = SystemHealth::from_failure_rate(rate);
        if health != self.health() {
            self.set_system_health(health);
        }
        health
    }

    // Runs `operation`, retrying rate-limit failures up to the configured attempt budget
    pub async fn retry_with_backoff<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    self.record_outcome(Ok(()));
                    return Ok(value);
                }
                Err(err) => {
                    self.record_outcome(Err(err.kind));
                    if !err.is_retryable() || attempt >= max_attempts {
                        return Err(err);
                    }
                    let delay = err
                        .retry_after
                        .map(|after| after.min(self.retry.max_delay))
                        .unwrap_or_else(|| calculate_backoff(attempt - 1, &self.retry));
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after rate limit"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub fn plan_batches(&self, ids: &[u64]) -> Vec<Vec<u64>> {
        let batches = batch_ids(ids);
        self.batches
            .fetch_add(batches.len() as u64, Ordering::Relaxed);
        batches
    }

    pub fn record_access(&self, id: u64) {
        *self.access_counts.entry(id).or_insert(0) += 1;
    }

    // Most frequently requested ids that are not cached yet
    pub fn predict_prefetch(&self, is_cached: impl Fn(u64) -> bool, limit: usize) -> Vec<u64> {
        let mut candidates: Vec<(u64, u64)> = self
            .access_counts
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .filter(|(id, _)| !is_cached(*id))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        candidates.into_iter().take(limit).map(|(id, _)| id).collect()
    }

    pub fn stats(&self) -> OptimizerStats {
        let health = self.health();
        OptimizerStats {
            health,
            rate_multiplier: self.client.rate_multiplier(),
            recent_failure_rate: Self::recent_failure_rate(&self.outcomes.lock()),
            retries: self.retries.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            tracked_ids: self.access_counts.len(),
        }
    }
}
