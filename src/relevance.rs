// Relevance scoring, type correction and de-duplication of search results

use std::{
    collections::{HashMap, HashSet},
    sync::OnceLock,
};

use regex::{Regex, RegexSet};
use tracing::debug;

use crate::models::{GameDetailRecord, GameType, RelevanceFactors, SearchResultItem, SearchStrategy};

pub const NAME_WEIGHT: f64 = 0.6;
pub const YEAR_WEIGHT: f64 = 0.2;
pub const TYPE_WEIGHT: f64 = 0.1;
pub const POPULARITY_WEIGHT: f64 = 0.1;

const YEAR_TOLERANCE: f64 = 10.0;
// Rating count at which popularity saturates
const POPULARITY_SATURATION: f64 = 100_000.0;

// Detail records already known for some result ids
pub type DetailContext = HashMap<u64, GameDetailRecord>;

fn expansion_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"(?i)\bexpansions?\b",
            r"(?i)\bmini[- ]?expansion\b",
            r"(?i)\bseason\s+\d+\b",
            r"(?i)\bpromos?\b",
            r"(?i)\b(scenario|character|map|hero|upgrade|booster)\s+packs?\b",
            r"(?i)\badd[- ]?on\b",
            r"(?i)\bextension\b",
            r"(?i)\berweiterung\b",
        ])
        .expect("static patterns compile")
    })
}

fn accessory_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"(?i)\bsleeves?\b",
            r"(?i)\b(game\s+)?inserts?\b",
            r"(?i)\borganizers?\b",
            r"(?i)\bplaymats?\b",
            r"(?i)\b(dice|coin|token)\s+sets?\b",
            r"(?i)\bmetal\s+coins\b",
        ])
        .expect("static patterns compile")
    })
}

fn year_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{4})\b").expect("static pattern compiles"))
}

// Splits an embedded publication year out of the query. A query that is only a
// number (e.g. "1830") is a title, not a year.
pub fn split_query_year(query: &str) -> (String, Option<i32>) {
    let query = query.trim();
    let Some(found) = year_pattern().find(query) else {
        return (query.to_string(), None);
    };
    let year = found.as_str().parse::<i32>().ok().filter(|y| (1900..=2100).contains(y));
    let rest = format!("{}{}", &query[..found.start()], &query[found.end()..]);
    let rest = rest.split_whitespace().collect::<Vec<_>>().join(" ");

    match year {
        Some(year) if !rest.is_empty() => (rest, Some(year)),
        _ => (query.to_string(), None),
    }
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a.chars().count();
    }

    let mut prev_row: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr_row = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr_row[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr_row[j + 1] = (curr_row[j] + 1)
                .min(prev_row[j + 1] + 1)
                .min(prev_row[j] + cost);
        }
        std::mem::swap(&mut prev_row, &mut curr_row);
    }

    prev_row[b_chars.len()]
}

pub fn name_match(query: &str, name: &str) -> f64 {
    let query = query.trim().to_lowercase();
    let name = name.trim().to_lowercase();
    if query.is_empty() || name.is_empty() {
        return 0.0;
    }

    if name == query {
        1.0
    } else if name.starts_with(&query) {
        0.9
    } else if name.contains(&query) {
        0.7
    } else {
        let max_len = query.chars().count().max(name.chars().count()) as f64;
        let distance = levenshtein(&query, &name) as f64;
        (1.0 - distance / max_len).max(0.0) * 0.6
    }
}

pub fn year_match(query_year: Option<i32>, item_year: i32) -> f64 {
    match query_year {
        None => 0.5,
        Some(_) if item_year <= 0 => 0.0,
        Some(wanted) => (1.0 - (wanted - item_year).abs() as f64 / YEAR_TOLERANCE).max(0.0),
    }
}

pub fn type_match(game_type: GameType) -> f64 {
    match game_type {
        GameType::BaseGame => 1.0,
        GameType::Expansion => 0.8,
        GameType::Accessory => 0.6,
    }
}

pub fn popularity(detail: Option<&GameDetailRecord>) -> f64 {
    match detail {
        Some(d) if d.users_rated > 0 => {
            ((1.0 + d.users_rated as f64).ln() / (1.0 + POPULARITY_SATURATION).ln()).min(1.0)
        }
        _ => 0.5,
    }
}

pub fn combined_score(factors: &RelevanceFactors) -> f64 {
    let weighted = factors.name_match * NAME_WEIGHT
        + factors.year_match * YEAR_WEIGHT
        + factors.type_match * TYPE_WEIGHT
        + factors.popularity * POPULARITY_WEIGHT;
    (weighted * 100.0).round().clamp(0.0, 100.0)
}

// "<base title>: <subtitle>" where the base title is a base game in the same result set
fn extends_known_base(name: &str, base_names: &HashSet<String>) -> bool {
    name.split_once(':').map_or(false, |(prefix, rest)| {
        let prefix = prefix.trim().to_lowercase();
        !rest.trim().is_empty() && base_names.contains(&prefix)
    })
}

// Corrected type; overrides only ever move an item away from base game
pub fn classify(
    item: &SearchResultItem,
    base_names: &HashSet<String>,
    detail: Option<&GameDetailRecord>,
) -> GameType {
    if detail.map_or(false, GameDetailRecord::is_confirmed_expansion) {
        return GameType::Expansion;
    }
    if item.upstream_type != GameType::BaseGame {
        return item.upstream_type;
    }
    if accessory_patterns().is_match(&item.name) {
        return GameType::Accessory;
    }
    if expansion_patterns().is_match(&item.name) || extends_known_base(&item.name, base_names) {
        return GameType::Expansion;
    }
    GameType::BaseGame
}

fn prefer(existing: &SearchResultItem, candidate: &SearchResultItem) -> bool {
    let existing_exp = existing.corrected_type == GameType::Expansion;
    let candidate_exp = candidate.corrected_type == GameType::Expansion;
    if existing_exp != candidate_exp {
        return candidate_exp;
    }
    candidate.search_score > existing.search_score
}

// One item per id, keeping first-seen order
pub fn deduplicate(items: Vec<SearchResultItem>) -> Vec<SearchResultItem> {
    let mut positions: HashMap<u64, usize> = HashMap::with_capacity(items.len());
    let mut unique: Vec<SearchResultItem> = Vec::with_capacity(items.len());

    for item in items {
        match positions.get(&item.id) {
            Some(&at) => {
                if prefer(&unique[at], &item) {
                    unique[at] = item;
                }
            }
            None => {
                positions.insert(item.id, unique.len());
                unique.push(item);
            }
        }
    }
    unique
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SearchRelevanceEngine;

impl SearchRelevanceEngine {
    pub fn new() -> Self {
        Self
    }

    // Scores, corrects, de-duplicates and ranks raw upstream results
    pub fn enhance(
        &self,
        raw: Vec<SearchResultItem>,
        query: &str,
        strategy: SearchStrategy,
        context: &DetailContext,
    ) -> Vec<SearchResultItem> {
        let (text, query_year) = split_query_year(query);
        let base_names: HashSet<String> = raw
            .iter()
            .filter(|i| i.upstream_type == GameType::BaseGame)
            .map(|i| i.name.trim().to_lowercase())
            .collect();

        let raw_count = raw.len();
        let scored: Vec<SearchResultItem> = raw
            .into_iter()
            .map(|mut item| {
                let detail = context.get(&item.id);
                item.corrected_type = classify(&item, &base_names, detail);

                let mut name = name_match(&text, &item.name);
                item.is_exact_match = name == 1.0;
                // upstream exact mode also matches alternate names
                if strategy == SearchStrategy::Exact {
                    if let Some(detail) = detail {
                        name = detail
                            .alternate_names
                            .iter()
                            .map(|alternate| name_match(&text, alternate))
                            .fold(name, f64::max);
                    }
                }

                item.factors = RelevanceFactors {
                    name_match: name,
                    year_match: year_match(query_year, item.year_published),
                    type_match: type_match(item.corrected_type),
                    popularity: popularity(detail),
                };
                item.search_score = combined_score(&item.factors);
                item
            })
            .collect();

        let mut ranked = deduplicate(scored);
        ranked.sort_by(|a, b| b.search_score.total_cmp(&a.search_score));

        debug!(
            query,
            strategy = strategy.as_str(),
            raw = raw_count,
            ranked = ranked.len(),
            "ranked search results"
        );
        ranked
    }

    // Base-game and expansion phases of an all-types search, ranked together
    pub fn merge_two_phase(
        &self,
        base_games: Vec<SearchResultItem>,
        expansions: Vec<SearchResultItem>,
        query: &str,
        strategy: SearchStrategy,
        context: &DetailContext,
    ) -> Vec<SearchResultItem> {
        let mut merged = base_games;
        merged.extend(expansions);
        self.enhance(merged, query, strategy, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: u64, name: &str, year: i32, game_type: GameType) -> SearchResultItem {
        SearchResultItem::unscored(id, name, year, game_type)
    }

    #[test]
    fn levenshtein_distances() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("sitting", "kitten"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("über", "uber"), 1);
    }

    #[test]
    fn name_match_tiers() {
        assert_eq!(name_match("catan", "CATAN"), 1.0);
        assert_eq!(name_match("catan", "Catan: Seafarers"), 0.9);
        assert_eq!(name_match("seafarers", "Catan: Seafarers"), 0.7);
        let fuzzy = name_match("catna", "catan");
        assert!(fuzzy > 0.0 && fuzzy < 0.6, "{fuzzy}");
        assert_eq!(name_match("zzzzzzzz", "ab"), 0.0);
        // shortcuts are directional, distance is not
        assert!(name_match("Catan: Seafarers", "catan") < 0.6);
    }

    #[test]
    fn year_factor_decays_over_ten_years() {
        assert_eq!(year_match(None, 1995), 0.5);
        assert_eq!(year_match(Some(1995), 0), 0.0);
        assert_eq!(year_match(Some(1995), 1995), 1.0);
        assert!((year_match(Some(1995), 2000) - 0.5).abs() < 1e-9);
        assert_eq!(year_match(Some(1995), 2010), 0.0);
    }

    #[test]
    fn query_year_extraction() {
        assert_eq!(split_query_year("Catan 1995"), ("Catan".to_string(), Some(1995)));
        assert_eq!(split_query_year("1830"), ("1830".to_string(), None));
        assert_eq!(split_query_year("Gloomhaven"), ("Gloomhaven".to_string(), None));
    }

    #[test]
    fn classification_overrides() {
        let bases: HashSet<String> = ["catan".to_string()].into_iter().collect();
        let none = HashSet::new();

        let seafarers = raw(926, "Catan: Seafarers", 1997, GameType::BaseGame);
        assert_eq!(classify(&seafarers, &bases, None), GameType::Expansion);
        assert_eq!(classify(&seafarers, &none, None), GameType::BaseGame);

        let season = raw(1, "Pandemic Legacy: Season 2", 2017, GameType::BaseGame);
        assert_eq!(classify(&season, &none, None), GameType::Expansion);

        let named = raw(2, "Wingspan European Expansion", 2019, GameType::BaseGame);
        assert_eq!(classify(&named, &none, None), GameType::Expansion);

        let sleeves = raw(3, "Dominion Card Sleeves", 2010, GameType::BaseGame);
        assert_eq!(classify(&sleeves, &none, None), GameType::Accessory);

        let plain = raw(4, "Azul", 2017, GameType::BaseGame);
        assert_eq!(classify(&plain, &none, None), GameType::BaseGame);

        let mut detail = GameDetailRecord::new(4, "Azul");
        detail.expands.push(crate::models::LinkedItem {
            id: 5,
            name: "Base".to_string(),
        });
        assert_eq!(classify(&plain, &none, Some(&detail)), GameType::Expansion);
    }

    #[test]
    fn exact_name_match_is_flagged_and_ranked_first() {
        let engine = SearchRelevanceEngine::new();
        let ranked = engine.enhance(
            vec![
                raw(926, "Catan: Seafarers", 1997, GameType::BaseGame),
                raw(13, "CATAN", 1995, GameType::BaseGame),
            ],
            "catan",
            SearchStrategy::Fuzzy,
            &DetailContext::new(),
        );
        assert_eq!(ranked[0].id, 13);
        assert!(ranked[0].is_exact_match);
        assert_eq!(ranked[0].factors.name_match, 1.0);
        assert_eq!(ranked[0].search_score, 85.0);
        assert_eq!(ranked[1].corrected_type, GameType::Expansion);
        assert_eq!(ranked[1].search_score, 77.0);
        assert!(!ranked[1].is_exact_match);
    }

    #[test]
    fn popularity_uses_known_rating_counts() {
        assert_eq!(popularity(None), 0.5);
        let mut detail = GameDetailRecord::new(13, "CATAN");
        detail.users_rated = 200_000;
        assert_eq!(popularity(Some(&detail)), 1.0);
        detail.users_rated = 100;
        let p = popularity(Some(&detail));
        assert!(p > 0.3 && p < 0.5, "{p}");
    }

    #[test]
    fn scores_stay_within_bounds() {
        let engine = SearchRelevanceEngine::new();
        let names = ["", "a", "CATAN", "Catan 1995 Edition", "zzzzzzzzzzzzzzzzzzzz"];
        let queries = ["ca", "catan 1995", "zz", "1830"];
        for query in queries {
            let items = names
                .iter()
                .enumerate()
                .map(|(i, n)| raw(i as u64 + 1, n, 1990 + i as i32, GameType::BaseGame))
                .collect();
            for item in engine.enhance(items, query, SearchStrategy::Exact, &DetailContext::new()) {
                assert!((0.0..=100.0).contains(&item.search_score));
                for f in [
                    item.factors.name_match,
                    item.factors.year_match,
                    item.factors.type_match,
                    item.factors.popularity,
                ] {
                    assert!((0.0..=1.0).contains(&f));
                }
            }
        }
    }

    #[test]
    fn exact_mode_keeps_edit_distance_for_unrelated_names() {
        let engine = SearchRelevanceEngine::new();
        let items = vec![raw(1, "Zzzzzzzz", 2000, GameType::BaseGame)];
        let ranked = engine.enhance(items, "catan", SearchStrategy::Exact, &DetailContext::new());
        assert_eq!(ranked[0].factors.name_match, 0.0);
        assert!(!ranked[0].is_exact_match);
    }

    #[test]
    fn exact_mode_scores_alternate_names_from_details() {
        let engine = SearchRelevanceEngine::new();
        let mut detail = GameDetailRecord::new(13, "CATAN");
        detail.alternate_names = vec!["Die Siedler von Catan".to_string()];
        let context = DetailContext::from([(13, detail)]);

        let items = vec![raw(13, "CATAN", 1995, GameType::BaseGame)];
        let ranked = engine.enhance(items, "die siedler von catan", SearchStrategy::Exact, &context);
        assert_eq!(ranked[0].factors.name_match, 1.0);
        assert!(!ranked[0].is_exact_match);

        let items = vec![raw(13, "CATAN", 1995, GameType::BaseGame)];
        let fuzzy = engine.enhance(items, "die siedler von catan", SearchStrategy::Fuzzy, &context);
        assert!(fuzzy[0].factors.name_match < 0.6);
    }

    #[test]
    fn deduplication_prefers_expansions_and_is_idempotent() {
        let mut base = raw(926, "Catan: Seafarers", 1997, GameType::BaseGame);
        base.search_score = 90.0;
        let mut expansion = raw(926, "Catan: Seafarers", 1997, GameType::Expansion);
        expansion.search_score = 40.0;
        let mut low = raw(13, "CATAN", 1995, GameType::BaseGame);
        low.search_score = 10.0;
        let mut high = low.clone();
        high.search_score = 60.0;

        let once = deduplicate(vec![base.clone(), low, expansion.clone(), high]);
        assert_eq!(once.len(), 2);
        assert_eq!(once[0].corrected_type, GameType::Expansion);
        assert_eq!(once[1].search_score, 60.0);
        assert_eq!(deduplicate(once.clone()), once);

        // order of the pair does not matter
        let reversed = deduplicate(vec![expansion, base]);
        assert_eq!(reversed[0].corrected_type, GameType::Expansion);
    }

    #[test]
    fn two_phase_merge_keeps_one_copy_per_id() {
        let engine = SearchRelevanceEngine::new();
        let merged = engine.merge_two_phase(
            vec![
                raw(13, "CATAN", 1995, GameType::BaseGame),
                raw(926, "Catan: Seafarers", 1997, GameType::BaseGame),
            ],
            vec![raw(926, "Catan: Seafarers", 1997, GameType::Expansion)],
            "Catan",
            SearchStrategy::Fuzzy,
            &DetailContext::new(),
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, 13);
        assert_eq!(merged[1].id, 926);
        assert_eq!(merged[1].corrected_type, GameType::Expansion);
        assert!(merged.windows(2).all(|w| w[0].search_score >= w[1].search_score));
    }
}
