// Circuit breakers guarding each class of upstream operation

use std::{
    collections::{BTreeMap, VecDeque},
    future::Future,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ApiError, FailureKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    // Failures inside `monitoring_period` that open the circuit
    pub failure_threshold: u32,
    // Consecutive half-open successes that close it again
    pub success_threshold: u32,
    // Time after the last failure before a probe is allowed
    pub timeout: Duration,
    pub monitoring_period: Duration,
    // Concurrent probes admitted while half-open
    pub max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
            max_requests: 1,
        }
    }
}

enum State {
    Closed,
    Open,
    HalfOpen { successes: u32, in_flight: u32 },
}

impl State {
    fn as_circuit_state(&self) -> CircuitState {
        match self {
            State::Closed => CircuitState::Closed,
            State::Open => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

struct Inner {
    state: State,
    failures: VecDeque<Instant>,
    last_failure: Option<Instant>,
    last_transition: Instant,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    rejected_requests: u64,
}

impl Inner {
    fn prune(&mut self, window: Duration) {
        let now = Instant::now();
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&mut self, name: &str, next: State) {
        let from = self.state.as_circuit_state();
        let to = next.as_circuit_state();
        self.state = next;
        self.last_transition = Instant::now();
        if to == CircuitState::Closed {
            self.failures.clear();
        }
        if from != to {
            match to {
                CircuitState::Open => warn!(breaker = name, ?from, "circuit opened"),
                CircuitState::HalfOpen => info!(breaker = name, "circuit half-open, probing"),
                CircuitState::Closed => info!(breaker = name, ?from, "circuit closed"),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_requests: u64,
    pub error_counts: BTreeMap<FailureKind, u64>,
    pub since_last_transition: Duration,
}

// Circuit state and recent metrics attached to errors leaving a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub operation: String,
    pub state: CircuitState,
    pub recent_failures: u32,
    pub total_requests: u64,
    pub failure_rate: f64,
}

impl CircuitSnapshot {
    // Open or probing means the upstream has been failing for a while, not just once
    pub fn is_sustained_outage(&self) -> bool {
        self.state != CircuitState::Closed
    }
}

pub enum Admission<'a> {
    Allowed(Permit<'a>),
    Rejected { retry_after: Option<Duration> },
}

// Admission ticket; a permit dropped without an outcome releases its half-open slot
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }

    // Outcome that says nothing about upstream health (e.g. caller input errors)
    pub fn ignore(mut self) {
        self.settled = true;
        self.breaker.release_probe(self.probe);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_probe(self.probe);
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                failures: VecDeque::new(),
                last_failure: None,
                last_transition: Instant::now(),
                total_requests: 0,
                total_successes: 0,
                total_failures: 0,
                rejected_requests: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state.as_circuit_state()
    }

    pub fn try_acquire(&self) -> Admission<'_> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.total_requests += 1;

        if let State::Open = inner.state {
            let elapsed = inner
                .last_failure
                .map(|at| at.elapsed())
                .unwrap_or(self.config.timeout);
            if elapsed >= self.config.timeout {
                inner.transition(
                    &self.name,
                    State::HalfOpen {
                        successes: 0,
                        in_flight: 0,
                    },
                );
            } else {
                inner.rejected_requests += 1;
                return Admission::Rejected {
                    retry_after: Some(self.config.timeout - elapsed),
                };
            }
        }

        match &mut inner.state {
            State::Closed => Admission::Allowed(Permit {
                breaker: self,
                probe: false,
                settled: false,
            }),
            State::HalfOpen { in_flight, .. } => {
                if *in_flight < self.config.max_requests {
                    *in_flight += 1;
                    Admission::Allowed(Permit {
                        breaker: self,
                        probe: true,
                        settled: false,
                    })
                } else {
                    inner.rejected_requests += 1;
                    debug!(breaker = %self.name, "half-open probe limit reached");
                    Admission::Rejected { retry_after: None }
                }
            }
            State::Open => Admission::Rejected { retry_after: None },
        }
    }

    fn on_success(&self, probe: bool) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.total_successes += 1;
        if let State::HalfOpen {
            successes,
            in_flight,
        } = &mut inner.state
        {
            if probe {
                *in_flight = in_flight.saturating_sub(1);
            }
            *successes += 1;
            if *successes >= self.config.success_threshold {
                inner.transition(&self.name, State::Closed);
            }
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let now = Instant::now();
        inner.total_failures += 1;
        inner.last_failure = Some(now);
        inner.failures.push_back(now);
        inner.prune(self.config.monitoring_period);

        match &mut inner.state {
            State::Closed => {
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    inner.transition(&self.name, State::Open);
                }
            }
            State::HalfOpen { in_flight, .. } => {
                if probe {
                    *in_flight = in_flight.saturating_sub(1);
                }
                inner.transition(&self.name, State::Open);
            }
            State::Open => {}
        }
    }

    fn release_probe(&self, probe: bool) {
        if !probe {
            return;
        }
        let mut inner = self.inner.lock();
        if let State::HalfOpen { in_flight, .. } = &mut inner.state {
            *in_flight = in_flight.saturating_sub(1);
        }
    }

    // Forces the circuit open regardless of the aggregate failure count
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        if !matches!(inner.state, State::Open) {
            inner.transition(&self.name, State::Open);
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure = None;
        inner.transition(&self.name, State::Closed);
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let mut inner = self.inner.lock();
        inner.prune(self.config.monitoring_period);
        let success_count = match inner.state {
            State::HalfOpen { successes, .. } => successes,
            _ => 0,
        };
        CircuitMetrics {
            name: self.name.clone(),
            state: inner.state.as_circuit_state(),
            failure_count: inner.failures.len() as u32,
            success_count,
            total_requests: inner.total_requests,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected_requests: inner.rejected_requests,
            error_counts: BTreeMap::new(),
            since_last_transition: inner.last_transition.elapsed(),
        }
    }

    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let permit = match self.try_acquire() {
            Admission::Allowed(permit) => permit,
            Admission::Rejected { retry_after } => {
                return Err(ApiError::circuit_open(&self.name, retry_after));
            }
        };

        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure();
                Err(err)
            }
        }
    }

    // Like `execute`, but a rejected call is answered by `fallback` instead of an error
    pub async fn execute_with_fallback<T, F, Fut, G, GFut>(
        &self,
        operation: F,
        fallback: G,
    ) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
        G: FnOnce(ApiError) -> GFut,
        GFut: Future<Output = Result<T, ApiError>>,
    {
        match self.try_acquire() {
            Admission::Rejected { retry_after } => {
                fallback(ApiError::circuit_open(&self.name, retry_after)).await
            }
            Admission::Allowed(permit) => match operation().await {
                Ok(value) => {
                    permit.success();
                    Ok(value)
                }
                Err(err) => {
                    permit.failure();
                    Err(err)
                }
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomainBreakerConfig {
    pub base: CircuitBreakerConfig,
    pub category_thresholds: BTreeMap<FailureKind, u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    pub search: DomainBreakerConfig,
    pub detail: DomainBreakerConfig,
    pub collection: DomainBreakerConfig,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            search: DomainBreakerConfig {
                base: CircuitBreakerConfig {
                    failure_threshold: 5,
                    success_threshold: 2,
                    timeout: Duration::from_secs(30),
                    monitoring_period: Duration::from_secs(60),
                    max_requests: 1,
                },
                category_thresholds: BTreeMap::from([
                    (FailureKind::RateLimit, 3),
                    (FailureKind::ApiUnavailable, 3),
                    (FailureKind::NetworkError, 5),
                ]),
            },
            detail: DomainBreakerConfig {
                base: CircuitBreakerConfig {
                    failure_threshold: 3,
                    success_threshold: 2,
                    timeout: Duration::from_secs(60),
                    monitoring_period: Duration::from_secs(120),
                    max_requests: 1,
                },
                category_thresholds: BTreeMap::from([
                    (FailureKind::RateLimit, 2),
                    (FailureKind::ApiUnavailable, 2),
                    (FailureKind::NetworkError, 4),
                ]),
            },
            collection: DomainBreakerConfig {
                base: CircuitBreakerConfig {
                    failure_threshold: 3,
                    success_threshold: 1,
                    timeout: Duration::from_secs(120),
                    monitoring_period: Duration::from_secs(300),
                    max_requests: 1,
                },
                category_thresholds: BTreeMap::from([
                    (FailureKind::RateLimit, 2),
                    (FailureKind::ApiUnavailable, 2),
                    (FailureKind::NetworkError, 3),
                ]),
            },
        }
    }
}

#[derive(Default)]
struct CategoryCounters {
    recent: BTreeMap<FailureKind, VecDeque<Instant>>,
    lifetime: BTreeMap<FailureKind, u64>,
}

// Breaker that classifies failures and trips on per-kind thresholds
pub struct UpstreamCircuitBreaker {
    breaker: CircuitBreaker,
    category_thresholds: BTreeMap<FailureKind, u32>,
    counters: Mutex<CategoryCounters>,
}

impl UpstreamCircuitBreaker {
    pub fn new(name: impl Into<String>, config: DomainBreakerConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(name, config.base),
            category_thresholds: config.category_thresholds,
            counters: Mutex::new(CategoryCounters::default()),
        }
    }

    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    pub fn state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn reset(&self) {
        self.breaker.reset();
        self.counters.lock().recent.clear();
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let mut metrics = self.breaker.metrics();
        metrics.error_counts = self.counters.lock().lifetime.clone();
        metrics
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let metrics = self.breaker.metrics();
        let settled = metrics.total_successes + metrics.total_failures;
        let failure_rate = if settled == 0 {
            0.0
        } else {
            metrics.total_failures as f64 / settled as f64
        };
        CircuitSnapshot {
            operation: metrics.name,
            state: metrics.state,
            recent_failures: metrics.failure_count,
            total_requests: metrics.total_requests,
            failure_rate,
        }
    }

    // Counts the failure under its kind; true when that kind reached its own threshold
    fn count_category(&self, kind: FailureKind) -> bool {
        let window = self.breaker.config().monitoring_period;
        let now = Instant::now();
        let mut counters = self.counters.lock();
        *counters.lifetime.entry(kind).or_insert(0) += 1;

        let Some(threshold) = self.category_thresholds.get(&kind).copied() else {
            return false;
        };
        let recent = counters.recent.entry(kind).or_default();
        recent.push_back(now);
        while let Some(oldest) = recent.front() {
            if now.duration_since(*oldest) > window {
                recent.pop_front();
            } else {
                break;
            }
        }
        recent.len() as u32 >= threshold
    }

    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let permit = match self.breaker.try_acquire() {
            Admission::Allowed(permit) => permit,
            Admission::Rejected { retry_after } => {
                return Err(
                    ApiError::circuit_open(self.name(), retry_after).with_circuit(self.snapshot())
                );
            }
        };
        let probe = permit.is_probe();

        match operation().await {
            Ok(value) => {
                permit.success();
                if probe && self.breaker.state() == CircuitState::Closed {
                    self.counters.lock().recent.clear();
                }
                Ok(value)
            }
            Err(err) if err.kind == FailureKind::ValidationError => {
                permit.ignore();
                Err(err)
            }
            Err(err) => {
                permit.failure();
                if self.count_category(err.kind) && self.breaker.state() != CircuitState::Open {
                    warn!(
                        breaker = self.name(),
                        kind = %err.kind,
                        "failure category threshold reached"
                    );
                    self.breaker.trip();
                }
                if self.breaker.state() == CircuitState::Open {
                    self.counters.lock().recent.clear();
                }
                Err(err.with_circuit(self.snapshot()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Search,
    DetailFetch,
    CollectionFetch,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Search => "search",
            Operation::DetailFetch => "detail-fetch",
            Operation::CollectionFetch => "collection-fetch",
        }
    }
}

// One independent breaker per operation class
pub struct BreakerRegistry {
    search: UpstreamCircuitBreaker,
    detail: UpstreamCircuitBreaker,
    collection: UpstreamCircuitBreaker,
}

impl BreakerRegistry {
    pub fn new(settings: &BreakerSettings) -> Self {
        Self {
            search: UpstreamCircuitBreaker::new(Operation::Search.name(), settings.search.clone()),
            detail: UpstreamCircuitBreaker::new(
                Operation::DetailFetch.name(),
                settings.detail.clone(),
            ),
            collection: UpstreamCircuitBreaker::new(
                Operation::CollectionFetch.name(),
                settings.collection.clone(),
            ),
        }
    }

    pub fn get(&self, operation: Operation) -> &UpstreamCircuitBreaker {
        match operation {
            Operation::Search => &self.search,
            Operation::DetailFetch => &self.detail,
            Operation::CollectionFetch => &self.collection,
        }
    }

    pub fn metrics(&self) -> Vec<CircuitMetrics> {
        vec![
            self.search.metrics(),
            self.detail.metrics(),
            self.collection.metrics(),
        ]
    }

    pub fn reset_all(&self) -> usize {
        self.search.reset();
        self.detail.reset();
        self.collection.reset();
        3
    }
}
