// Public records handed to callers

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameType {
    BaseGame,
    Expansion,
    Accessory,
}

impl GameType {
    // Maps the upstream `type` attribute; unknown types count as base games
    pub fn from_upstream(value: &str) -> Self {
        match value {
            "boardgameexpansion" => GameType::Expansion,
            "boardgameaccessory" => GameType::Accessory,
            _ => GameType::BaseGame,
        }
    }

    pub fn upstream_name(&self) -> &'static str {
        match self {
            GameType::BaseGame => "boardgame",
            GameType::Expansion => "boardgameexpansion",
            GameType::Accessory => "boardgameaccessory",
        }
    }
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GameType::BaseGame => "base-game",
            GameType::Expansion => "expansion",
            GameType::Accessory => "accessory",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TypeFilter {
    #[default]
    BaseGame,
    Expansion,
    All,
}

impl TypeFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeFilter::BaseGame => "boardgame",
            TypeFilter::Expansion => "boardgameexpansion",
            TypeFilter::All => "all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchStrategy {
    Exact,
    Fuzzy,
    Cached,
    Fallback,
}

impl SearchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStrategy::Exact => "exact",
            SearchStrategy::Fuzzy => "fuzzy",
            SearchStrategy::Cached => "cached",
            SearchStrategy::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FetchStrategy {
    #[default]
    Upstream,
    Cache,
    Repository,
    // Stored copy (cache or repository) served because upstream failed
    Fallback,
    // Placeholder or empty result served because upstream failed
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RelevanceFactors {
    pub name_match: f64,
    pub year_match: f64,
    pub type_match: f64,
    pub popularity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResultItem {
    pub id: u64,
    pub name: String,
    pub year_published: i32,
    pub upstream_type: GameType,
    pub thumbnail: Option<String>,
    pub search_score: f64,
    pub is_exact_match: bool,
    pub corrected_type: GameType,
    pub factors: RelevanceFactors,
}

impl SearchResultItem {
    // Unscored item straight from the upstream payload
    pub fn unscored(id: u64, name: impl Into<String>, year: i32, upstream_type: GameType) -> Self {
        Self {
            id,
            name: name.into(),
            year_published: year,
            upstream_type,
            thumbnail: None,
            search_score: 0.0,
            is_exact_match: false,
            corrected_type: upstream_type,
            factors: RelevanceFactors::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub game_type: TypeFilter,
    // Some(true) forces exact mode, Some(false) forces fuzzy
    pub exact: Option<bool>,
    pub max_results: Option<usize>,
    pub allow_partial: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub query: String,
    pub items: Vec<SearchResultItem>,
    pub total: usize,
    pub strategy: SearchStrategy,
    pub from_cache: bool,
    pub message: Option<String>,
}

impl SearchResults {
    pub fn empty(query: &str, strategy: SearchStrategy, message: Option<String>) -> Self {
        Self {
            query: query.to_string(),
            items: vec![],
            total: 0,
            strategy,
            from_cache: false,
            message,
        }
    }

    pub fn average_score(&self) -> f64 {
        if self.items.is_empty() {
            return 0.0;
        }
        self.items.iter().map(|i| i.search_score).sum::<f64>() / self.items.len() as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkedItem {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameEdition {
    pub id: u64,
    pub name: String,
    pub year_published: i32,
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LanguageDependence {
    // Poll level of the winning answer, 0 when nobody voted
    pub level: u32,
    pub description: String,
    pub votes: u32,
    pub total_votes: u32,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameDetailRecord {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub year_published: i32,
    pub thumbnail: String,
    pub image: String,
    pub min_players: u32,
    pub max_players: u32,
    pub playing_time: u32,
    pub min_play_time: u32,
    pub max_play_time: u32,
    pub min_age: u32,
    pub average_rating: f64,
    pub bayes_average: f64,
    pub users_rated: u32,
    pub rank: u32,
    pub weight: f64,
    pub mechanics: Vec<String>,
    pub categories: Vec<String>,
    pub designers: Vec<String>,
    pub artists: Vec<String>,
    pub publishers: Vec<String>,
    pub languages: Vec<String>,
    pub alternate_names: Vec<String>,
    pub editions: Vec<GameEdition>,
    pub language_dependence: LanguageDependence,
    pub expansions: Vec<LinkedItem>,
    // Base games that list this item as one of their expansions
    pub expands: Vec<LinkedItem>,
    pub game_type: GameType,
    pub fetch_strategy: FetchStrategy,
    pub last_synced: Option<DateTime<Utc>>,
}

impl GameDetailRecord {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: String::new(),
            year_published: 0,
            thumbnail: String::new(),
            image: String::new(),
            min_players: 0,
            max_players: 0,
            playing_time: 0,
            min_play_time: 0,
            max_play_time: 0,
            min_age: 0,
            average_rating: 0.0,
            bayes_average: 0.0,
            users_rated: 0,
            rank: 0,
            weight: 0.0,
            mechanics: vec![],
            categories: vec![],
            designers: vec![],
            artists: vec![],
            publishers: vec![],
            languages: vec![],
            alternate_names: vec![],
            editions: vec![],
            language_dependence: LanguageDependence::default(),
            expansions: vec![],
            expands: vec![],
            game_type: GameType::BaseGame,
            fetch_strategy: FetchStrategy::Upstream,
            last_synced: None,
        }
    }

    // Inbound expansion links confirm the item is an expansion
    pub fn is_confirmed_expansion(&self) -> bool {
        !self.expands.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionItem {
    pub id: u64,
    pub name: String,
    pub year_published: i32,
    pub game_type: GameType,
    pub owned: bool,
    pub wishlist: bool,
    pub num_plays: u32,
    pub user_rating: f64,
    pub thumbnail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionResponse {
    pub username: String,
    pub items: Vec<CollectionItem>,
    pub total: usize,
    pub source: FetchStrategy,
    pub message: Option<String>,
}

impl CollectionResponse {
    pub fn empty(username: &str, source: FetchStrategy, message: Option<String>) -> Self {
        Self {
            username: username.to_string(),
            items: vec![],
            total: 0,
            source,
            message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
    // When false, failures yield an empty/absent result instead of a placeholder
    pub allow_partial: bool,
    // Skip cache and repository and go straight to upstream
    pub force_refresh: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            allow_partial: true,
            force_refresh: false,
        }
    }
}
