// Resilient gateway over the BoardGameGeek XML API

pub mod adaptive_cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod fallback;
pub mod logging;
pub mod models;
pub mod optimizer;
pub mod rate_limited_client;
pub mod relevance;
pub mod repository;
pub mod response_parser;
pub mod service;

// Re-export key types for convenience
pub use adaptive_cache::{AdaptiveCache, CacheStats, CacheValue, TtlHints};
pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitState, Operation, UpstreamCircuitBreaker};
pub use config::Config;
pub use error::{ApiError, ConfigError, FailureKind};
pub use models::{
    CollectionItem, CollectionResponse, FetchOptions, FetchStrategy, GameDetailRecord, GameType,
    SearchFilters, SearchResultItem, SearchResults, SearchStrategy, TypeFilter,
};
pub use rate_limited_client::{HttpResponse, HttpTransport, RateLimitedClient, ReqwestTransport};
pub use repository::{GameRepository, InMemoryGameRepository};
pub use service::{CachedPayload, GameService, ServiceStats};
