// Configuration for the gateway, with environment overrides

use std::{env, str::FromStr, time::Duration};

use crate::error::ConfigError;

// BoardGameGeek asks API consumers to stay well below a couple of requests per second
pub const MAX_REQUESTS_PER_SECOND: f64 = 2.0;
pub const MAX_BURST: u32 = 5;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub requests_per_second: f64,
    pub burst_limit: u32,
    pub request_timeout: Duration,
    pub queue_size: usize,
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://boardgamegeek.com/xmlapi2".to_string(),
            requests_per_second: 1.0,
            burst_limit: 1,
            request_timeout: Duration::from_secs(10),
            queue_size: 256,
            user_agent: "boardgame_gateway/0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_size: usize,
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_size: 1000,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    // Queries up to this many characters try the upstream exact mode first
    pub exact_match_threshold: usize,
    pub min_query_length: usize,
    pub max_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            exact_match_threshold: 3,
            min_query_length: 2,
            max_results: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    // Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    pub cache: CacheConfig,
    pub search: SearchConfig,
    pub retry: RetryConfig,
    pub breakers: crate::circuit_breaker::BreakerSettings,
    pub debug: bool,
    // Repository records older than this are refreshed from upstream
    pub stale_after: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            cache: CacheConfig::default(),
            search: SearchConfig::default(),
            retry: RetryConfig::default(),
            breakers: crate::circuit_breaker::BreakerSettings::default(),
            debug: false,
            stale_after: Duration::from_secs(24 * 60 * 60),
        }
    }
}

fn read_env<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

fn read_env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
        },
        Err(_) => Ok(None),
    }
}

impl Config {
    // Defaults overridden by BGG_* environment variables, then validated
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(url) = env::var("BGG_API_BASE_URL") {
            config.api.base_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(rps) = read_env::<f64>("BGG_REQUESTS_PER_SECOND")? {
            config.api.requests_per_second = rps;
        }
        if let Some(burst) = read_env::<u32>("BGG_BURST_LIMIT")? {
            config.api.burst_limit = burst;
        }
        if let Some(ms) = read_env::<u64>("BGG_REQUEST_TIMEOUT_MS")? {
            config.api.request_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = read_env::<u64>("BGG_CACHE_TTL_SECONDS")? {
            config.cache.ttl = Duration::from_secs(secs);
        }
        if let Some(size) = read_env::<usize>("BGG_CACHE_MAX_SIZE")? {
            config.cache.max_size = size;
        }
        if let Some(secs) = read_env::<u64>("BGG_CACHE_CLEANUP_INTERVAL_SECONDS")? {
            config.cache.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(len) = read_env::<usize>("BGG_EXACT_MATCH_THRESHOLD")? {
            config.search.exact_match_threshold = len;
        }
        if let Some(attempts) = read_env::<u32>("BGG_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = read_env::<u64>("BGG_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = read_env::<u64>("BGG_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(multiplier) = read_env::<f64>("BGG_RETRY_BACKOFF_MULTIPLIER")? {
            config.retry.backoff_multiplier = multiplier;
        }
        if let Some(debug) = read_env_bool("BGG_DEBUG")? {
            config.debug = debug;
        }
        if let Some(hours) = read_env::<u64>("BGG_STALE_AFTER_HOURS")? {
            config.stale_after = Duration::from_secs(hours * 60 * 60);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.api.base_url.starts_with("http://") || self.api.base_url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidBaseUrl(self.api.base_url.clone()));
        }
        if !(self.api.requests_per_second > 0.0) {
            return Err(ConfigError::NotPositive {
                field: "requests_per_second",
            });
        }
        if self.api.requests_per_second > MAX_REQUESTS_PER_SECOND {
            return Err(ConfigError::AboveLimit {
                field: "requests_per_second",
                value: self.api.requests_per_second,
                limit: MAX_REQUESTS_PER_SECOND,
            });
        }
        if self.api.burst_limit == 0 {
            return Err(ConfigError::NotPositive {
                field: "burst_limit",
            });
        }
        if self.api.burst_limit > MAX_BURST {
            return Err(ConfigError::AboveLimit {
                field: "burst_limit",
                value: self.api.burst_limit as f64,
                limit: MAX_BURST as f64,
            });
        }
        if self.api.request_timeout.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "request_timeout",
            });
        }
        if self.cache.ttl.is_zero() {
            return Err(ConfigError::NotPositive { field: "cache.ttl" });
        }
        if self.cache.max_size == 0 {
            return Err(ConfigError::NotPositive {
                field: "cache.max_size",
            });
        }
        if self.cache.cleanup_interval.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "cache.cleanup_interval",
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::NotPositive {
                field: "retry.max_attempts",
            });
        }
        if !(self.retry.backoff_multiplier > 0.0) {
            return Err(ConfigError::NotPositive {
                field: "retry.backoff_multiplier",
            });
        }
        Ok(())
    }
}
