// Public entry point: search, details and collections with caching,
// circuit breaking, retries and graceful degradation wired together.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    adaptive_cache::{
        AdaptiveCache, CacheStats, CacheValue, SweeperHandle, TtlHints, COLLECTION_KEY_PREFIX,
        DETAILS_KEY_PREFIX, SEARCH_KEY_PREFIX,
    },
    circuit_breaker::{BreakerRegistry, CircuitMetrics, Operation},
    config::Config,
    error::{ApiError, ConfigError, FailureKind},
    fallback::{FallbackStats, FallbackStrategies},
    models::{
        CollectionResponse, FetchOptions, FetchStrategy, GameDetailRecord, SearchFilters,
        SearchResultItem, SearchResults, SearchStrategy, TypeFilter,
    },
    optimizer::{batch_ids, ApiOptimizer, OptimizerStats},
    rate_limited_client::{ClientStats, HttpTransport, RateLimitedClient, ReqwestTransport},
    relevance::{DetailContext, SearchRelevanceEngine},
    repository::{is_stale, GameRepository},
    response_parser::{ParsedCollection, ResponseParser},
};

const COLLECTION_QUEUED_RETRY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum CachedPayload {
    Search(SearchResults),
    Details(GameDetailRecord),
    Collection(CollectionResponse),
}

impl CacheValue for CachedPayload {
    fn ttl_hints(&self) -> TtlHints {
        match self {
            CachedPayload::Search(results) => TtlHints {
                item_count: Some(results.items.len()),
                exact_strategy: results.strategy == SearchStrategy::Exact,
                average_score: (!results.items.is_empty()).then(|| results.average_score()),
            },
            CachedPayload::Details(_) | CachedPayload::Collection(_) => TtlHints::default(),
        }
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn search_key(query: &str, filter: TypeFilter, strategy: SearchStrategy) -> String {
    format!(
        "{SEARCH_KEY_PREFIX}{}:{}:{}",
        filter.as_str(),
        strategy.as_str(),
        normalize(query)
    )
}

pub fn details_key(id: u64) -> String {
    format!("{DETAILS_KEY_PREFIX}{id}")
}

pub fn collection_key(username: &str) -> String {
    format!("{COLLECTION_KEY_PREFIX}{}", normalize(username))
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub cache: CacheStats,
    pub client: ClientStats,
    pub breakers: Vec<CircuitMetrics>,
    pub optimizer: OptimizerStats,
    pub fallback: FallbackStats,
    pub degraded_parses: u64,
    pub sweeper_running: bool,
}

pub struct GameService {
    config: Config,
    client: Arc<RateLimitedClient>,
    parser: ResponseParser,
    cache: Arc<AdaptiveCache<CachedPayload>>,
    breakers: BreakerRegistry,
    fallback: FallbackStrategies,
    relevance: SearchRelevanceEngine,
    optimizer: ApiOptimizer,
    repository: Arc<dyn GameRepository>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl GameService {
    // Validates the configuration, then spawns the request worker and the cache sweeper;
    // call from within a tokio runtime
    pub fn new(
        config: Config,
        transport: Arc<dyn HttpTransport>,
        repository: Arc<dyn GameRepository>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = Arc::new(RateLimitedClient::new(config.api.clone(), transport));
        let cache = Arc::new(AdaptiveCache::new(config.cache.clone()));
        let sweeper = cache.start_sweeper();

        info!(
            base_url = %config.api.base_url,
            requests_per_second = config.api.requests_per_second,
            cache_ttl_secs = config.cache.ttl.as_secs(),
            "game service started"
        );

        Ok(Self {
            parser: ResponseParser::new(),
            breakers: BreakerRegistry::new(&config.breakers),
            fallback: FallbackStrategies::new(cache.clone(), repository.clone()),
            relevance: SearchRelevanceEngine::new(),
            optimizer: ApiOptimizer::new(client.clone(), config.retry.clone()),
            sweeper: Mutex::new(Some(sweeper)),
            client,
            cache,
            repository,
            config,
        })
    }

    pub fn with_reqwest(config: Config, repository: Arc<dyn GameRepository>) -> Result<Self, ApiError> {
        config.validate()?;
        let transport = Arc::new(ReqwestTransport::new(&config.api)?);
        Ok(Self::new(config, transport, repository)?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub async fn search(&self, query: &str, filters: SearchFilters) -> Result<SearchResults, ApiError> {
        let query = query.trim();
        let length = query.chars().count();
        let min_length = self.config.search.min_query_length;
        if length < min_length {
            return Err(ApiError::validation(
                format!("search query too short: {length} of {min_length} characters"),
                format!("Please enter at least {min_length} characters to search."),
            ));
        }

        let exact_first = filters
            .exact
            .unwrap_or(length <= self.config.search.exact_match_threshold);
        let strategies: &[SearchStrategy] = if exact_first {
            &[SearchStrategy::Exact, SearchStrategy::Fuzzy]
        } else {
            &[SearchStrategy::Fuzzy]
        };
        let limit = filters.max_results.unwrap_or(self.config.search.max_results);

        let mut last = None;
        for (i, &strategy) in strategies.iter().enumerate() {
            let is_last = i + 1 == strategies.len();
            let key = search_key(query, filters.game_type, strategy);

            if let Some(CachedPayload::Search(mut cached)) = self.cache.get(&key) {
                if !cached.items.is_empty() || is_last {
                    debug!(query, strategy = strategy.as_str(), "search served from cache");
                    cached.strategy = SearchStrategy::Cached;
                    cached.from_cache = true;
                    return Ok(cached);
                }
                continue;
            }

            let (mut items, complete) = match self.search_upstream(query, filters.game_type, strategy).await {
                Ok(ranked) => ranked,
                Err(err) => return self.search_failed(query, &filters, err),
            };
            let total = items.len();
            items.truncate(limit);
            let results = SearchResults {
                query: query.to_string(),
                items,
                total,
                strategy,
                from_cache: false,
                message: None,
            };
            if complete {
                self.cache
                    .set(&key, CachedPayload::Search(results.clone()), None);
            } else {
                debug!(query, "partial merge not cached");
            }

            if !results.items.is_empty() {
                return Ok(results);
            }
            debug!(query, strategy = strategy.as_str(), "no results");
            last = Some(results);
        }

        Ok(last.unwrap_or_else(|| SearchResults::empty(query, SearchStrategy::Fuzzy, None)))
    }

    fn search_failed(
        &self,
        query: &str,
        filters: &SearchFilters,
        err: ApiError,
    ) -> Result<SearchResults, ApiError> {
        if FallbackStrategies::should_use_fallback(&err) {
            return Ok(self.fallback.search_fallback(query, filters, &err));
        }
        if err.kind == FailureKind::ParseError {
            warn!(query, error = %err, "unreadable search payload");
            return Ok(SearchResults::empty(
                query,
                SearchStrategy::Fuzzy,
                Some(err.user_message().to_string()),
            ));
        }
        Err(err)
    }

    async fn search_phase(
        &self,
        query: &str,
        filter: TypeFilter,
        exact: bool,
    ) -> Result<Vec<SearchResultItem>, ApiError> {
        let client = &self.client;
        let breaker = self.breakers.get(Operation::Search);
        let raw = self
            .optimizer
            .retry_with_backoff("search", move || {
                breaker.execute(move || client.search_raw(query, filter, exact))
            })
            .await?;
        Ok(self.parser.parse_search(&raw).items)
    }

    // Ranked results, and whether every upstream phase answered
    async fn search_upstream(
        &self,
        query: &str,
        filter: TypeFilter,
        strategy: SearchStrategy,
    ) -> Result<(Vec<SearchResultItem>, bool), ApiError> {
        let exact = strategy == SearchStrategy::Exact;
        let started = Instant::now();
        let mut complete = true;

        let ranked = match filter {
            TypeFilter::All => {
                let base = self.search_phase(query, TypeFilter::BaseGame, exact).await;
                let expansions = self.search_phase(query, TypeFilter::Expansion, exact).await;
                let (base, expansions) = match (base, expansions) {
                    (Err(err), Err(_)) => return Err(err),
                    (base, expansions) => {
                        for err in [&base, &expansions].into_iter().filter_map(|r| r.as_ref().err()) {
                            warn!(query, error = %err, "one search phase failed, merging the other");
                            complete = false;
                        }
                        (base.unwrap_or_default(), expansions.unwrap_or_default())
                    }
                };
                let context = self.detail_context(base.iter().chain(expansions.iter()));
                self.relevance
                    .merge_two_phase(base, expansions, query, strategy, &context)
            }
            single => {
                let raw = self.search_phase(query, single, exact).await?;
                let context = self.detail_context(raw.iter());
                self.relevance.enhance(raw, query, strategy, &context)
            }
        };

        self.cache.record_latency(started.elapsed());
        Ok((ranked, complete))
    }

    // Detail records already cached for the given results
    fn detail_context<'a>(&self, items: impl Iterator<Item = &'a SearchResultItem>) -> DetailContext {
        items
            .filter_map(|item| match self.cache.peek(&details_key(item.id)) {
                Some(CachedPayload::Details(record)) => Some((item.id, record)),
                _ => None,
            })
            .collect()
    }

    // Cached copy, else a fresh repository record
    async fn local_details(&self, id: u64, options: &FetchOptions) -> Option<GameDetailRecord> {
        if options.force_refresh {
            return None;
        }
        if let Some(CachedPayload::Details(mut record)) = self.cache.get(&details_key(id)) {
            record.fetch_strategy = FetchStrategy::Cache;
            return Some(record);
        }
        match self.repository.find_by_external_id(id).await {
            Ok(Some(mut record)) if !is_stale(&record, self.config.stale_after) => {
                debug!(id, "fresh repository record");
                self.cache
                    .set(&details_key(id), CachedPayload::Details(record.clone()), None);
                record.fetch_strategy = FetchStrategy::Repository;
                Some(record)
            }
            Ok(Some(_)) => {
                debug!(id, "repository record is stale, refreshing");
                None
            }
            Ok(None) => None,
            Err(err) => {
                warn!(id, error = %err, "repository lookup failed");
                None
            }
        }
    }

    async fn fetch_details_upstream(&self, ids: &[u64]) -> Result<Vec<GameDetailRecord>, ApiError> {
        let client = &self.client;
        let breaker = self.breakers.get(Operation::DetailFetch);
        let started = Instant::now();
        let raw = self
            .optimizer
            .retry_with_backoff("details", move || {
                breaker.execute(move || client.thing_raw(ids))
            })
            .await?;
        self.cache.record_latency(started.elapsed());

        let mut records = self.parser.parse_details(&raw, ids);
        let synced = Utc::now();
        for record in &mut records {
            record.last_synced = Some(synced);
            record.fetch_strategy = FetchStrategy::Upstream;
            if let Err(err) = self.repository.upsert(record.clone()).await {
                warn!(id = record.id, error = %err, "failed to store detail record");
            }
            self.cache
                .set(&details_key(record.id), CachedPayload::Details(record.clone()), None);
        }
        Ok(records)
    }

    pub async fn get_details(
        &self,
        id: u64,
        options: FetchOptions,
    ) -> Result<Option<GameDetailRecord>, ApiError> {
        if id == 0 {
            return Err(ApiError::validation(
                "game id must be positive",
                "Please choose a valid game.",
            ));
        }
        self.optimizer.record_access(id);

        if let Some(record) = self.local_details(id, &options).await {
            return Ok(Some(record));
        }

        match self.fetch_details_upstream(&[id]).await {
            Ok(records) => Ok(records.into_iter().find(|r| r.id == id)),
            Err(err) if FallbackStrategies::should_use_fallback(&err) => {
                Ok(self.fallback.details_fallback(id, &options, &err).await)
            }
            Err(err) if err.kind == FailureKind::ParseError => {
                warn!(id, error = %err, "unreadable detail payload");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    // Details for many ids, fetched upstream in batches; unknown ids are skipped
    pub async fn get_details_batch(
        &self,
        ids: &[u64],
        options: FetchOptions,
    ) -> Result<Vec<GameDetailRecord>, ApiError> {
        let unique = batch_ids(ids).concat();
        let mut found: HashMap<u64, GameDetailRecord> = HashMap::with_capacity(unique.len());
        let mut missing = vec![];

        for &id in &unique {
            self.optimizer.record_access(id);
            match self.local_details(id, &options).await {
                Some(record) => {
                    found.insert(id, record);
                }
                None => missing.push(id),
            }
        }

        for batch in self.optimizer.plan_batches(&missing) {
            match self.fetch_details_upstream(&batch).await {
                Ok(records) => found.extend(records.into_iter().map(|r| (r.id, r))),
                Err(err) if FallbackStrategies::should_use_fallback(&err) => {
                    for &id in &batch {
                        if let Some(record) = self.fallback.details_fallback(id, &options, &err).await {
                            found.insert(id, record);
                        }
                    }
                }
                Err(err) if err.kind == FailureKind::ParseError => {
                    warn!(batch = ?batch, error = %err, "unreadable detail batch");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(unique.iter().filter_map(|id| found.remove(id)).collect())
    }

    // Warms the cache for the given ids; returns how many records were fetched
    pub async fn prefetch_details(&self, ids: &[u64]) -> usize {
        let uncached: Vec<u64> = batch_ids(ids)
            .concat()
            .into_iter()
            .filter(|id| self.cache.peek(&details_key(*id)).is_none())
            .collect();

        let mut fetched = 0;
        for batch in self.optimizer.plan_batches(&uncached) {
            match self.fetch_details_upstream(&batch).await {
                Ok(records) => fetched += records.len(),
                Err(err) => {
                    warn!(error = %err, "prefetch stopped");
                    break;
                }
            }
        }
        debug!(requested = ids.len(), fetched, "prefetch finished");
        fetched
    }

    // Prefetches the most requested ids that are not cached
    pub async fn prefetch_predicted(&self, limit: usize) -> usize {
        let cache = &self.cache;
        let predicted = self
            .optimizer
            .predict_prefetch(|id| cache.peek(&details_key(id)).is_some(), limit);
        if predicted.is_empty() {
            return 0;
        }
        self.prefetch_details(&predicted).await
    }

    pub async fn get_collection(
        &self,
        username: &str,
        options: FetchOptions,
    ) -> Result<CollectionResponse, ApiError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(ApiError::validation(
                "collection username is empty",
                "Please enter a BoardGameGeek username.",
            ));
        }

        let key = collection_key(username);
        if !options.force_refresh {
            if let Some(CachedPayload::Collection(mut cached)) = self.cache.get(&key) {
                cached.source = FetchStrategy::Cache;
                return Ok(cached);
            }
        }

        let client = &self.client;
        let parser = &self.parser;
        let breaker = self.breakers.get(Operation::CollectionFetch);
        // a queued reply passes the breaker as a success and is retried outside it
        let fetched = self
            .optimizer
            .retry_with_backoff("collection", move || async move {
                let reply = breaker
                    .execute(move || async move {
                        match client.collection_raw(username).await {
                            Ok(raw) => collection_outcome(username, parser.parse_collection(&raw)),
                            Err(err) if err.is_queued() => Ok(CollectionReply::Queued(
                                err.retry_after.unwrap_or(COLLECTION_QUEUED_RETRY),
                            )),
                            Err(err) => Err(err),
                        }
                    })
                    .await?;
                match reply {
                    CollectionReply::Ready(parsed) => Ok::<_, ApiError>(parsed),
                    CollectionReply::Queued(after) => Err(ApiError::rate_limit(format!(
                        "collection for {username} is still being prepared upstream"
                    ))
                    .with_status(202)
                    .with_retry_after(after)),
                }
            })
            .await;

        match fetched {
            Ok(parsed) => {
                let response = CollectionResponse {
                    username: username.to_string(),
                    total: parsed.total,
                    items: parsed.items,
                    source: FetchStrategy::Upstream,
                    message: None,
                };
                self.cache
                    .set(&key, CachedPayload::Collection(response.clone()), None);
                Ok(response)
            }
            Err(err) if FallbackStrategies::should_use_fallback(&err) => {
                Ok(self.fallback.collection_fallback(username, &options, &err))
            }
            Err(err) if err.kind == FailureKind::ParseError => {
                warn!(username, error = %err, "unreadable collection payload");
                Ok(CollectionResponse::empty(
                    username,
                    FetchStrategy::Partial,
                    Some(err.user_message().to_string()),
                ))
            }
            Err(err) => Err(err),
        }
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            cache: self.cache.stats(),
            client: self.client.stats(),
            breakers: self.breakers.metrics(),
            optimizer: self.optimizer.stats(),
            fallback: self.fallback.stats(),
            degraded_parses: self.parser.degraded_parses(),
            sweeper_running: self
                .sweeper
                .lock()
                .as_ref()
                .map_or(false, SweeperHandle::is_running),
        }
    }

    pub fn stats_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.stats())
    }

    pub fn clear(&self) -> usize {
        let removed = self.cache.clear();
        info!(removed, "cache cleared");
        removed
    }

    // Removes cached entries whose key matches the regular expression
    pub fn clear_pattern(&self, pattern: &str) -> Result<usize, ApiError> {
        let removed = self.cache.clear_pattern(pattern)?;
        info!(pattern, removed, "cache entries cleared");
        Ok(removed)
    }

    pub fn reset_breakers(&self) -> usize {
        self.breakers.reset_all()
    }

    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
            info!("game service stopped");
        }
    }
}

// Upstream answers unknown users with an error document and
// not-yet-built collections with a notice
enum CollectionReply {
    Ready(ParsedCollection),
    Queued(Duration),
}

fn collection_outcome(username: &str, parsed: ParsedCollection) -> Result<CollectionReply, ApiError> {
    if let Some(message) = &parsed.error {
        return Err(ApiError::validation(
            format!("upstream rejected collection request for {username}: {message}"),
            "That BoardGameGeek user could not be found.",
        ));
    }
    if parsed.queued {
        return Ok(CollectionReply::Queued(COLLECTION_QUEUED_RETRY));
    }
    Ok(CollectionReply::Ready(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        circuit_breaker::CircuitState,
        models::GameType,
        rate_limited_client::mock_transport::{self, MockTransport},
        repository::InMemoryGameRepository,
    };

    const BASE_SEARCH: &str = r#"<items total="2">
  <item type="boardgame" id="13"><name type="primary" value="CATAN"/><yearpublished value="1995"/></item>
  <item type="boardgame" id="926"><name type="primary" value="Catan: Seafarers"/><yearpublished value="1997"/></item>
</items>"#;

    const EXPANSION_SEARCH: &str = r#"<items total="1">
  <item type="boardgameexpansion" id="926"><name type="primary" value="Catan: Seafarers"/><yearpublished value="1997"/></item>
</items>"#;

    const RA_SEARCH: &str = r#"<items total="1">
  <item type="boardgame" id="12"><name type="primary" value="Ra"/><yearpublished value="1999"/></item>
</items>"#;

    const CATAN_THING: &str = r#"<items>
  <item type="boardgame" id="13">
    <name type="primary" value="CATAN"/>
    <description>Trade &amp;amp; build</description>
    <yearpublished value="1995"/>
    <minplayers value="3"/>
    <maxplayers value="4"/>
    <statistics><ratings><usersrated value="120000"/><average value="7.1"/></ratings></statistics>
  </item>
</items>"#;

    const COLLECTION: &str = r#"<items totalitems="1">
  <item objecttype="thing" objectid="13" subtype="boardgame">
    <name sortindex="1">CATAN</name>
    <status own="1"/>
    <numplays>3</numplays>
  </item>
</items>"#;

    fn service_with(transport: Arc<MockTransport>) -> (GameService, Arc<InMemoryGameRepository>) {
        let repo = Arc::new(InMemoryGameRepository::new());
        let mut config = Config::default();
        config.api.requests_per_second = 2.0;
        config.api.burst_limit = 5;
        (GameService::new(config, transport, repo.clone()).unwrap(), repo)
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected_at_construction() {
        let transport = Arc::new(MockTransport::new());
        let repo = Arc::new(InMemoryGameRepository::new());
        let mut config = Config::default();
        config.api.requests_per_second = 0.0;

        let err = GameService::new(config.clone(), transport.clone(), repo.clone()).err();
        assert_eq!(
            err,
            Some(ConfigError::NotPositive {
                field: "requests_per_second"
            })
        );

        let err = GameService::with_reqwest(config, repo).err().unwrap();
        assert_eq!(err.kind, FailureKind::ValidationError);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn short_queries_fail_validation_without_upstream_calls() {
        let transport = Arc::new(MockTransport::new());
        let (service, _) = service_with(transport.clone());

        let err = service.search(" a ", SearchFilters::default()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::ValidationError);
        assert_ne!(err.user_message(), err.message);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn all_types_search_merges_both_phases() {
        let transport = Arc::new(MockTransport::new());
        transport.push(mock_transport::ok_xml(BASE_SEARCH));
        transport.push(mock_transport::ok_xml(EXPANSION_SEARCH));
        let (service, _) = service_with(transport.clone());

        let filters = SearchFilters {
            game_type: TypeFilter::All,
            ..Default::default()
        };
        let results = service.search("Catan", filters.clone()).await.unwrap();

        assert_eq!(results.strategy, SearchStrategy::Fuzzy);
        assert_eq!(results.items.len(), 2);
        assert_eq!(results.items[0].id, 13);
        assert!(results.items[0].is_exact_match);
        assert_eq!(results.items[1].id, 926);
        assert_eq!(results.items[1].corrected_type, GameType::Expansion);

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].ends_with("type=boardgame"));
        assert!(calls[1].ends_with("type=boardgameexpansion"));

        let again = service.search("catan", filters).await.unwrap();
        assert_eq!(again.strategy, SearchStrategy::Cached);
        assert!(again.from_cache);
        assert_eq!(again.items, results.items);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn half_merged_search_is_not_cached() {
        let transport = Arc::new(MockTransport::new());
        transport.push(mock_transport::ok_xml(BASE_SEARCH));
        transport.push(mock_transport::status(503));
        transport.push(mock_transport::ok_xml(BASE_SEARCH));
        transport.push(mock_transport::ok_xml(EXPANSION_SEARCH));
        let (service, _) = service_with(transport.clone());

        let filters = SearchFilters {
            game_type: TypeFilter::All,
            ..Default::default()
        };
        let partial = service.search("Catan", filters.clone()).await.unwrap();
        assert_eq!(partial.strategy, SearchStrategy::Fuzzy);
        assert_eq!(partial.items.len(), 2);
        assert_eq!(service.stats().cache.size, 0);

        let full = service.search("Catan", filters).await.unwrap();
        assert!(!full.from_cache);
        assert_eq!(full.items[1].corrected_type, GameType::Expansion);
        assert_eq!(transport.call_count(), 4);
        assert_eq!(service.stats().cache.size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn short_queries_try_exact_then_fuzzy() {
        let transport = Arc::new(MockTransport::new());
        transport.push(mock_transport::ok_xml(r#"<items total="0"></items>"#));
        transport.push(mock_transport::ok_xml(RA_SEARCH));
        let (service, _) = service_with(transport.clone());

        let results = service.search("Ra", SearchFilters::default()).await.unwrap();
        assert_eq!(results.strategy, SearchStrategy::Fuzzy);
        assert_eq!(results.items[0].name, "Ra");

        let calls = transport.calls();
        assert!(calls[0].contains("exact=1"));
        assert!(!calls[1].contains("exact=1"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_storm_opens_detail_breaker_and_degrades() {
        let transport = Arc::new(MockTransport::new());
        for _ in 0..3 {
            transport.push(mock_transport::empty());
        }
        let (service, _) = service_with(transport.clone());

        let record = service
            .get_details(13, FetchOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.fetch_strategy, FetchStrategy::Partial);
        assert!(record.description.contains("temporarily unavailable"));
        assert_eq!(transport.call_count(), 2);
        assert_eq!(
            service.breakers().get(Operation::DetailFetch).state(),
            CircuitState::Open
        );
        assert_eq!(
            service.breakers().get(Operation::Search).state(),
            CircuitState::Closed
        );

        // circuit open: answered locally
        let again = service
            .get_details(13, FetchOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.fetch_strategy, FetchStrategy::Partial);
        assert_eq!(transport.call_count(), 2);

        let opted_out = FetchOptions {
            allow_partial: false,
            ..Default::default()
        };
        assert!(service.get_details(13, opted_out).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_repository_record_is_tagged_as_fallback() {
        let transport = Arc::new(MockTransport::new());
        transport.push(mock_transport::empty());
        transport.push(mock_transport::empty());
        let (service, repo) = service_with(transport.clone());
        let mut stored = GameDetailRecord::new(13, "CATAN");
        stored.last_synced = Some(Utc::now() - chrono::Duration::days(3));
        repo.upsert(stored).await.unwrap();

        let record = service
            .get_details(13, FetchOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.name, "CATAN");
        assert_eq!(record.fetch_strategy, FetchStrategy::Fallback);
        assert_eq!(transport.call_count(), 2);
        assert_eq!(service.stats().fallback.details, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn details_are_synced_to_repository_and_cached() {
        let transport = Arc::new(MockTransport::new());
        transport.push(mock_transport::ok_xml(CATAN_THING));
        let (service, repo) = service_with(transport.clone());

        let record = service
            .get_details(13, FetchOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.name, "CATAN");
        assert_eq!(record.description, "Trade & build");
        assert_eq!(record.fetch_strategy, FetchStrategy::Upstream);
        assert!(record.last_synced.is_some());
        assert_eq!(repo.len(), 1);

        let cached = service
            .get_details(13, FetchOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.fetch_strategy, FetchStrategy::Cache);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_repository_records_skip_upstream() {
        let transport = Arc::new(MockTransport::new());
        let (service, repo) = service_with(transport.clone());
        let mut stored = GameDetailRecord::new(822, "Carcassonne");
        stored.last_synced = Some(Utc::now());
        repo.upsert(stored).await.unwrap();

        let record = service
            .get_details(822, FetchOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.fetch_strategy, FetchStrategy::Repository);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_fetch_uses_one_request_for_uncached_ids() {
        let transport = Arc::new(MockTransport::new());
        transport.push(mock_transport::ok_xml(CATAN_THING));
        let (service, _) = service_with(transport.clone());

        let records = service
            .get_details_batch(&[13, 13, 99], FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 13);

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("id=13%2C99"));
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_warms_the_detail_cache() {
        let transport = Arc::new(MockTransport::new());
        transport.push(mock_transport::ok_xml(CATAN_THING));
        let (service, _) = service_with(transport.clone());

        assert_eq!(service.prefetch_details(&[13]).await, 1);
        assert_eq!(service.prefetch_details(&[13]).await, 0);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_collection_is_retried() {
        let transport = Arc::new(MockTransport::new());
        transport.push(mock_transport::status(202));
        transport.push(mock_transport::ok_xml(COLLECTION));
        let (service, _) = service_with(transport.clone());

        let collection = service
            .get_collection("alice", FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(collection.source, FetchStrategy::Upstream);
        assert_eq!(collection.items.len(), 1);
        assert!(collection.items[0].owned);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_queued_replies_do_not_open_the_collection_breaker() {
        let transport = Arc::new(MockTransport::new());
        transport.push(mock_transport::status(202));
        transport.push(mock_transport::status(202));
        transport.push(mock_transport::ok_xml(COLLECTION));
        let (service, _) = service_with(transport.clone());

        let collection = service
            .get_collection("alice", FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(collection.source, FetchStrategy::Upstream);
        assert_eq!(collection.items.len(), 1);
        assert_eq!(transport.call_count(), 3);
        assert_eq!(
            service.breakers().get(Operation::CollectionFetch).state(),
            CircuitState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_collection_user_is_a_validation_error() {
        let transport = Arc::new(MockTransport::new());
        transport.push(mock_transport::ok_xml(
            "<errors><error><message>Invalid username specified</message></error></errors>",
        ));
        let (service, _) = service_with(transport.clone());

        let err = service
            .get_collection("nobody", FetchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ValidationError);
        assert_eq!(transport.call_count(), 1);
        assert_eq!(
            service.breakers().get(Operation::CollectionFetch).state(),
            CircuitState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_upstream_degrades_search() {
        let transport = Arc::new(MockTransport::new());
        transport.push(mock_transport::status(503));
        let (service, _) = service_with(transport.clone());

        let results = service
            .search("Gloomhaven", SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(results.strategy, SearchStrategy::Fallback);
        assert!(results.items.is_empty());
        assert!(results.message.is_some());
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_and_cache_clearing() {
        let transport = Arc::new(MockTransport::new());
        transport.push(mock_transport::ok_xml(CATAN_THING));
        transport.push(mock_transport::ok_xml(BASE_SEARCH));
        let (service, _) = service_with(transport.clone());

        service.get_details(13, FetchOptions::default()).await.unwrap();
        service.search("Catan", SearchFilters::default()).await.unwrap();

        let stats = service.stats();
        assert_eq!(stats.cache.size, 2);
        assert_eq!(stats.client.requests_sent, 2);
        assert_eq!(stats.breakers.len(), 3);
        assert!(stats.sweeper_running);
        assert!(service.stats_json().unwrap().contains("\"cache\""));

        assert!(service.clear_pattern("(").is_err());
        assert_eq!(service.clear_pattern("^details:").unwrap(), 1);
        assert_eq!(service.clear(), 1);

        service.shutdown();
        assert!(!service.stats().sweeper_running);
    }
}
