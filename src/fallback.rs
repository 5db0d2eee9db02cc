// Degraded responses used when the upstream cannot answer

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    adaptive_cache::AdaptiveCache,
    error::{ApiError, FailureKind},
    models::{
        CollectionResponse, FetchOptions, FetchStrategy, GameDetailRecord, SearchFilters,
        SearchResults, SearchStrategy,
    },
    repository::GameRepository,
    service::{collection_key, search_key, CachedPayload},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FallbackStats {
    pub search: u64,
    pub details: u64,
    pub collection: u64,
    pub partial: u64,
}

pub struct FallbackStrategies {
    cache: Arc<AdaptiveCache<CachedPayload>>,
    repository: Arc<dyn GameRepository>,
    search: AtomicU64,
    details: AtomicU64,
    collection: AtomicU64,
    partial: AtomicU64,
}

impl FallbackStrategies {
    pub fn new(cache: Arc<AdaptiveCache<CachedPayload>>, repository: Arc<dyn GameRepository>) -> Self {
        Self {
            cache,
            repository,
            search: AtomicU64::new(0),
            details: AtomicU64::new(0),
            collection: AtomicU64::new(0),
            partial: AtomicU64::new(0),
        }
    }

    pub fn should_use_fallback(error: &ApiError) -> bool {
        matches!(
            error.kind,
            FailureKind::RateLimit
                | FailureKind::ApiUnavailable
                | FailureKind::NetworkError
                | FailureKind::ServiceUnavailable
        )
    }

    pub fn search_fallback(
        &self,
        query: &str,
        filters: &SearchFilters,
        error: &ApiError,
    ) -> SearchResults {
        self.search.fetch_add(1, Ordering::Relaxed);

        let cached = [SearchStrategy::Exact, SearchStrategy::Fuzzy]
            .into_iter()
            .find_map(|strategy| match self.cache.peek(&search_key(query, filters.game_type, strategy)) {
                Some(CachedPayload::Search(results)) => Some(results),
                _ => None,
            });

        if let Some(mut results) = cached {
            info!(query, error = %error, "serving cached search results as fallback");
            results.strategy = SearchStrategy::Fallback;
            results.from_cache = true;
            results.message = Some(error.user_message().to_string());
            return results;
        }

        warn!(query, error = %error, "no cached search results for fallback");
        if filters.allow_partial == Some(false) {
            return SearchResults::empty(query, SearchStrategy::Fallback, None);
        }
        self.partial.fetch_add(1, Ordering::Relaxed);
        SearchResults::empty(
            query,
            SearchStrategy::Fallback,
            Some(error.user_message().to_string()),
        )
    }

    pub async fn details_fallback(
        &self,
        id: u64,
        options: &FetchOptions,
        error: &ApiError,
    ) -> Option<GameDetailRecord> {
        self.details.fetch_add(1, Ordering::Relaxed);

        match self.repository.find_by_external_id(id).await {
            Ok(Some(mut record)) => {
                info!(id, error = %error, "serving repository record as fallback");
                record.fetch_strategy = FetchStrategy::Fallback;
                return Some(record);
            }
            Ok(None) => {}
            Err(repo_err) => warn!(id, error = %repo_err, "repository lookup failed during fallback"),
        }

        if !options.allow_partial {
            return None;
        }

        self.partial.fetch_add(1, Ordering::Relaxed);
        warn!(id, error = %error, "returning placeholder detail record");
        let mut placeholder = GameDetailRecord::new(id, format!("Game #{id}"));
        placeholder.description = format!(
            "Details for this game are temporarily unavailable. {}",
            error.user_message()
        );
        placeholder.fetch_strategy = FetchStrategy::Partial;
        Some(placeholder)
    }

    pub fn collection_fallback(
        &self,
        username: &str,
        options: &FetchOptions,
        error: &ApiError,
    ) -> CollectionResponse {
        self.collection.fetch_add(1, Ordering::Relaxed);

        if let Some(CachedPayload::Collection(mut cached)) = self.cache.peek(&collection_key(username)) {
            info!(username, error = %error, "serving cached collection as fallback");
            cached.source = FetchStrategy::Fallback;
            cached.message = Some(error.user_message().to_string());
            return cached;
        }

        if !options.allow_partial {
            return CollectionResponse::empty(username, FetchStrategy::Partial, None);
        }
        self.partial.fetch_add(1, Ordering::Relaxed);
        CollectionResponse::empty(
            username,
            FetchStrategy::Partial,
            Some(error.user_message().to_string()),
        )
    }

    pub fn stats(&self) -> FallbackStats {
        FallbackStats {
            search: self.search.load(Ordering::Relaxed),
            details: self.details.load(Ordering::Relaxed),
            collection: self.collection.load(Ordering::Relaxed),
            partial: self.partial.load(Ordering::Relaxed),
        }
    }
}
