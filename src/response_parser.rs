// Parsing of upstream XML payloads into structured records
// The XML is first read into a strict element tree, then mapped onto the public types.
// Malformed documents fall back to a regex scan; nothing here returns an error to callers.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
};

use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{
    CollectionItem, GameDetailRecord, GameEdition, GameType, LanguageDependence, LinkedItem,
    SearchResultItem,
};

#[derive(Error, Debug, PartialEq)]
pub enum ProcessingError {
    #[error("XML parse error: {0}")]
    XmlParseError(String),

    #[error("Unbalanced document: {0}")]
    Unbalanced(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: HashMap<String, String>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.name == name)
    }

    // `value` attribute of the first child called `name`
    pub fn child_value(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(|c| c.attr("value"))
    }

    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    fn child_number<T: FromStr + Default>(&self, name: &str) -> T {
        number(self.child_value(name))
    }
}

fn number<T: FromStr + Default>(raw: Option<&str>) -> T {
    raw.and_then(|v| v.trim().parse::<T>().ok()).unwrap_or_default()
}

fn named_entity(name: &str) -> Option<&'static str> {
    let decoded = match name {
        "amp" => "&",
        "lt" => "<",
        "gt" => ">",
        "quot" => "\"",
        "apos" => "'",
        "nbsp" => " ",
        "copy" => "©",
        "reg" => "®",
        "trade" => "™",
        "hellip" => "…",
        "mdash" => "—",
        "ndash" => "–",
        "lsquo" => "‘",
        "rsquo" => "’",
        "ldquo" => "“",
        "rdquo" => "”",
        "laquo" => "«",
        "raquo" => "»",
        "bull" => "•",
        "middot" => "·",
        "deg" => "°",
        "times" => "×",
        "euro" => "€",
        "pound" => "£",
        "eacute" => "é",
        "egrave" => "è",
        "aacute" => "á",
        "iacute" => "í",
        "oacute" => "ó",
        "uacute" => "ú",
        "ntilde" => "ñ",
        "auml" => "ä",
        "ouml" => "ö",
        "uuml" => "ü",
        "szlig" => "ß",
        _ => return None,
    };
    Some(decoded)
}

fn decode_entity(entity: &str) -> Option<String> {
    if let Some(numeric) = entity.strip_prefix('#') {
        let code = match numeric.strip_prefix('x').or_else(|| numeric.strip_prefix('X')) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => numeric.parse::<u32>().ok()?,
        };
        return char::from_u32(code).map(String::from);
    }
    named_entity(entity).map(str::to_string)
}

// Single pass of HTML entity decoding; unknown entities are left as written
pub fn decode_html_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start + 1..];
        let decoded = candidate
            .find(';')
            .filter(|end| *end > 0 && *end <= 10)
            .and_then(|end| decode_entity(&candidate[..end]).map(|d| (d, end)));

        match decoded {
            Some((text, end)) => {
                out.push_str(&text);
                rest = &candidate[end + 1..];
            }
            None => {
                out.push('&');
                rest = candidate;
            }
        }
    }
    out.push_str(rest);
    out
}

// XML escaping first, then the HTML entities the upstream double-encodes
fn decode_text(raw: &[u8]) -> String {
    let once = decode_html_entities(&String::from_utf8_lossy(raw));
    decode_html_entities(&once)
}

fn element_from(start: &BytesStart) -> Result<XmlElement, ProcessingError> {
    let mut element = XmlElement::named(String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr.map_err(|e| ProcessingError::XmlParseError(e.to_string()))?;
        element.attributes.insert(
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            decode_text(&attr.value),
        );
    }
    Ok(element)
}

fn attach(stack: &mut [XmlElement], element: XmlElement) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
    }
}

// Reads the whole document into a tree under a synthetic `#document` root
pub fn build_tree(xml: &str) -> Result<XmlElement, ProcessingError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut stack = vec![XmlElement::named("#document")];

    loop {
        match reader.read_event_into(&mut buf) {
            Err(e) => {
                return Err(ProcessingError::XmlParseError(format!(
                    "at byte {}: {e}",
                    reader.buffer_position()
                )))
            }
            Ok(Event::Start(e)) => stack.push(element_from(&e)?),
            Ok(Event::Empty(e)) => {
                let element = element_from(&e)?;
                attach(&mut stack, element);
            }
            Ok(Event::End(e)) => {
                if stack.len() < 2 {
                    return Err(ProcessingError::Unbalanced(format!(
                        "unexpected </{}>",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }
                if let Some(element) = stack.pop() {
                    attach(&mut stack, element);
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&decode_text(&e));
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&decode_html_entities(&String::from_utf8_lossy(&e)));
                }
            }
            Ok(Event::Eof) => break,
            _ => {}
        }
        buf.clear();
    }

    if stack.len() != 1 {
        return Err(ProcessingError::Unbalanced(format!(
            "{} unclosed element(s)",
            stack.len() - 1
        )));
    }
    Ok(stack.remove(0))
}

// Items under an `<items>` wrapper, or the single `<item>` document element
fn item_elements(document: &XmlElement) -> Vec<&XmlElement> {
    match document.children.first() {
        Some(root) if root.name == "items" => root.children_named("item").collect(),
        Some(root) if root.name == "item" => vec![root],
        _ => vec![],
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSearch {
    pub items: Vec<SearchResultItem>,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedCollection {
    pub items: Vec<CollectionItem>,
    pub total: usize,
    // Upstream `<errors>` message, e.g. an unknown username
    pub error: Option<String>,
    // Upstream accepted the request but is still building the collection
    pub queued: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPayload {
    Search(ParsedSearch),
    Details(Vec<GameDetailRecord>),
}

#[derive(Debug, Default)]
pub struct ResponseParser {
    degraded_parses: AtomicU64,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn degraded_parses(&self) -> u64 {
        self.degraded_parses.load(Ordering::Relaxed)
    }

    pub fn parse(&self, raw: &str, is_search: bool) -> ParsedPayload {
        if is_search {
            ParsedPayload::Search(self.parse_search(raw))
        } else {
            ParsedPayload::Details(self.parse_details(raw, &[]))
        }
    }

    fn tree(&self, raw: &str) -> Option<XmlElement> {
        match build_tree(raw) {
            Ok(tree) => Some(tree),
            Err(e) => {
                self.degraded_parses.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "malformed upstream XML, using degraded parser");
                None
            }
        }
    }

    pub fn parse_search(&self, raw: &str) -> ParsedSearch {
        let Some(document) = self.tree(raw) else {
            return degraded::search(raw);
        };

        let items: Vec<SearchResultItem> = item_elements(&document)
            .into_iter()
            .filter_map(map_search_item)
            .collect();
        let total = document
            .children
            .first()
            .and_then(|root| root.attr("total"))
            .and_then(|t| t.parse::<usize>().ok())
            .unwrap_or(items.len());

        debug!(items = items.len(), total, "parsed search payload");
        ParsedSearch { items, total }
    }

    // One record per requested id (all ids in document order when none requested)
    pub fn parse_details(&self, raw: &str, requested_ids: &[u64]) -> Vec<GameDetailRecord> {
        let Some(document) = self.tree(raw) else {
            return degraded::details(raw, requested_ids);
        };

        let elements = item_elements(&document);
        let ids: Vec<u64> = if requested_ids.is_empty() {
            let mut ids = vec![];
            for element in &elements {
                let id = number::<u64>(element.attr("id"));
                if id != 0 && !ids.contains(&id) {
                    ids.push(id);
                }
            }
            ids
        } else {
            requested_ids.to_vec()
        };

        ids.into_iter()
            .filter_map(|id| select_primary(&elements, id))
            .map(map_detail)
            .collect()
    }

    pub fn parse_collection(&self, raw: &str) -> ParsedCollection {
        let Some(document) = self.tree(raw) else {
            return ParsedCollection::default();
        };

        let Some(root) = document.children.first() else {
            return ParsedCollection::default();
        };

        match root.name.as_str() {
            "errors" | "error" => {
                let message = root
                    .child("error")
                    .and_then(|e| e.child_text("message"))
                    .or_else(|| root.child_text("message"))
                    .or_else(|| root.attr("message"))
                    .unwrap_or("unknown upstream error")
                    .to_string();
                ParsedCollection {
                    error: Some(message),
                    ..Default::default()
                }
            }
            "message" => ParsedCollection {
                queued: true,
                ..Default::default()
            },
            "items" => {
                let items: Vec<CollectionItem> = root
                    .children_named("item")
                    .filter_map(map_collection_item)
                    .collect();
                let total = number::<usize>(root.attr("totalitems")).max(items.len());
                ParsedCollection {
                    items,
                    total,
                    ..Default::default()
                }
            }
            _ => ParsedCollection::default(),
        }
    }
}

// First entry of the canonical board game type for `id`, else the first entry for it
fn select_primary<'a>(elements: &[&'a XmlElement], id: u64) -> Option<&'a XmlElement> {
    let matching: Vec<&XmlElement> = elements
        .iter()
        .copied()
        .filter(|e| number::<u64>(e.attr("id")) == id)
        .collect();
    matching
        .iter()
        .copied()
        .find(|e| e.attr("type") == Some("boardgame"))
        .or_else(|| matching.first().copied())
}

fn primary_name(element: &XmlElement) -> String {
    element
        .children_named("name")
        .find(|n| n.attr("type") == Some("primary"))
        .or_else(|| element.child("name"))
        .map(|n| {
            n.attr("value")
                .map(str::to_string)
                .unwrap_or_else(|| n.text.clone())
        })
        .unwrap_or_default()
}

fn map_search_item(element: &XmlElement) -> Option<SearchResultItem> {
    let id = number::<u64>(element.attr("id"));
    if id == 0 {
        return None;
    }
    let mut item = SearchResultItem::unscored(
        id,
        primary_name(element),
        element.child_number("yearpublished"),
        GameType::from_upstream(element.attr("type").unwrap_or_default()),
    );
    item.thumbnail = element
        .child_text("thumbnail")
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    Some(item)
}

fn map_language_dependence(poll: &XmlElement) -> LanguageDependence {
    let results: Vec<(u32, String, u32)> = poll
        .children_named("results")
        .flat_map(|r| r.children_named("result"))
        .map(|r| {
            (
                number::<u32>(r.attr("level")),
                r.attr("value").unwrap_or_default().to_string(),
                number::<u32>(r.attr("numvotes")),
            )
        })
        .collect();

    let counted: u32 = results.iter().map(|(_, _, votes)| votes).sum();
    let total_votes = number::<u32>(poll.attr("totalvotes")).max(counted);

    let mut winner: Option<&(u32, String, u32)> = None;
    for result in &results {
        if winner.map_or(true, |w| result.2 > w.2) {
            winner = Some(result);
        }
    }

    match winner {
        Some((level, description, votes)) if *votes > 0 => LanguageDependence {
            level: *level,
            description: description.clone(),
            votes: *votes,
            total_votes,
            percentage: if total_votes == 0 {
                0.0
            } else {
                (*votes as f64 / total_votes as f64 * 1000.0).round() / 10.0
            },
        },
        _ => LanguageDependence {
            total_votes,
            ..Default::default()
        },
    }
}

fn map_edition(version: &XmlElement) -> GameEdition {
    GameEdition {
        id: number(version.attr("id")),
        name: primary_name(version),
        year_published: version.child_number("yearpublished"),
        languages: version
            .children_named("link")
            .filter(|l| l.attr("type") == Some("language"))
            .filter_map(|l| l.attr("value").map(str::to_string))
            .collect(),
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !value.is_empty() && !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

fn map_detail(element: &XmlElement) -> GameDetailRecord {
    let mut record = GameDetailRecord::new(number(element.attr("id")), primary_name(element));
    record.game_type = GameType::from_upstream(element.attr("type").unwrap_or_default());
    record.description = element.child_text("description").unwrap_or_default().trim().to_string();
    record.thumbnail = element.child_text("thumbnail").unwrap_or_default().to_string();
    record.image = element.child_text("image").unwrap_or_default().to_string();
    record.year_published = element.child_number("yearpublished");
    record.min_players = element.child_number("minplayers");
    record.max_players = element.child_number("maxplayers");
    record.playing_time = element.child_number("playingtime");
    record.min_play_time = element.child_number("minplaytime");
    record.max_play_time = element.child_number("maxplaytime");
    record.min_age = element.child_number("minage");

    record.alternate_names = element
        .children_named("name")
        .filter(|n| n.attr("type") == Some("alternate"))
        .filter_map(|n| n.attr("value").map(str::to_string))
        .collect();

    for link in element.children_named("link") {
        let value = link.attr("value").unwrap_or_default();
        let linked = || LinkedItem {
            id: number(link.attr("id")),
            name: value.to_string(),
        };
        match link.attr("type").unwrap_or_default() {
            "boardgamecategory" => push_unique(&mut record.categories, value),
            "boardgamemechanic" => push_unique(&mut record.mechanics, value),
            "boardgamedesigner" => push_unique(&mut record.designers, value),
            "boardgameartist" => push_unique(&mut record.artists, value),
            "boardgamepublisher" => push_unique(&mut record.publishers, value),
            "language" => push_unique(&mut record.languages, value),
            "boardgameexpansion" if link.attr("inbound") == Some("true") => {
                record.expands.push(linked())
            }
            "boardgameexpansion" => record.expansions.push(linked()),
            _ => {}
        }
    }

    if let Some(poll) = element
        .children_named("poll")
        .find(|p| p.attr("name") == Some("language_dependence"))
    {
        record.language_dependence = map_language_dependence(poll);
    }

    if let Some(versions) = element.child("versions") {
        record.editions = versions.children_named("item").map(map_edition).collect();
        for edition in &record.editions {
            for language in &edition.languages {
                push_unique(&mut record.languages, language);
            }
        }
    }

    if let Some(ratings) = element.child("statistics").and_then(|s| s.child("ratings")) {
        record.users_rated = ratings.child_number("usersrated");
        record.average_rating = ratings.child_number("average");
        record.bayes_average = ratings.child_number("bayesaverage");
        record.weight = ratings.child_number("averageweight");
        record.rank = ratings
            .child("ranks")
            .and_then(|ranks| {
                ranks
                    .children_named("rank")
                    .find(|r| r.attr("name") == Some("boardgame"))
            })
            .map(|r| number::<u32>(r.attr("value")))
            .unwrap_or_default();
    }

    record
}

fn map_collection_item(element: &XmlElement) -> Option<CollectionItem> {
    let id = number::<u64>(element.attr("objectid"));
    if id == 0 {
        return None;
    }
    let status = element.child("status");
    let flag = |name: &str| status.and_then(|s| s.attr(name)) == Some("1");
    Some(CollectionItem {
        id,
        name: element.child_text("name").unwrap_or_default().to_string(),
        year_published: number(element.child_text("yearpublished")),
        game_type: GameType::from_upstream(element.attr("subtype").unwrap_or_default()),
        owned: flag("own"),
        wishlist: flag("wishlist"),
        num_plays: number(element.child_text("numplays")),
        user_rating: element
            .child("stats")
            .and_then(|s| s.child_value("rating"))
            .map(|v| number::<f64>(Some(v)))
            .unwrap_or_default(),
        thumbnail: element.child_text("thumbnail").unwrap_or_default().to_string(),
    })
}

// Regex extraction for documents the tree parser rejects; covers fewer fields
mod degraded {
    use super::*;

    fn compiled(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
        cell.get_or_init(|| Regex::new(pattern).expect("static pattern compiles"))
    }

    fn item_re() -> &'static Regex {
        static CELL: OnceLock<Regex> = OnceLock::new();
        compiled(&CELL, r#"(?s)<item\b([^>]*)>(.*?)</item>"#)
    }

    fn attr_re() -> &'static Regex {
        static CELL: OnceLock<Regex> = OnceLock::new();
        compiled(&CELL, r#"\b([A-Za-z_]+)="([^"]*)""#)
    }

    fn primary_name_re() -> &'static Regex {
        static CELL: OnceLock<Regex> = OnceLock::new();
        compiled(&CELL, r#"<name\b[^>]*\btype="primary"[^>]*\bvalue="([^"]*)""#)
    }

    fn any_name_re() -> &'static Regex {
        static CELL: OnceLock<Regex> = OnceLock::new();
        compiled(&CELL, r#"<name\b[^>]*\bvalue="([^"]*)""#)
    }

    fn tag_value_re() -> &'static Regex {
        static CELL: OnceLock<Regex> = OnceLock::new();
        compiled(&CELL, r#"<([A-Za-z_]+)\b[^>]*\bvalue="([^"]*)""#)
    }

    fn description_re() -> &'static Regex {
        static CELL: OnceLock<Regex> = OnceLock::new();
        compiled(&CELL, r#"(?s)<description>(.*?)</description>"#)
    }

    fn attrs(raw: &str) -> HashMap<String, String> {
        attr_re()
            .captures_iter(raw)
            .map(|c| (c[1].to_string(), decode_text(c[2].as_bytes())))
            .collect()
    }

    fn name(body: &str) -> String {
        primary_name_re()
            .captures(body)
            .or_else(|| any_name_re().captures(body))
            .map(|c| decode_text(c[1].as_bytes()))
            .unwrap_or_default()
    }

    fn value<T: FromStr + Default>(body: &str, tag: &str) -> T {
        number(
            tag_value_re()
                .captures_iter(body)
                .find(|c| &c[1] == tag)
                .and_then(|c| c.get(2))
                .map(|m| m.as_str()),
        )
    }

    pub(super) fn search(raw: &str) -> ParsedSearch {
        let items: Vec<SearchResultItem> = item_re()
            .captures_iter(raw)
            .filter_map(|c| {
                let attrs = attrs(&c[1]);
                let id = number::<u64>(attrs.get("id").map(String::as_str));
                if id == 0 {
                    return None;
                }
                let body = &c[2];
                Some(SearchResultItem::unscored(
                    id,
                    name(body),
                    value(body, "yearpublished"),
                    GameType::from_upstream(attrs.get("type").map_or("", String::as_str)),
                ))
            })
            .collect();
        let total = items.len();
        ParsedSearch { items, total }
    }

    // Same primary selection as the tree parser: first `boardgame` entry per id, else the first
    pub(super) fn details(raw: &str, requested_ids: &[u64]) -> Vec<GameDetailRecord> {
        let entries: Vec<(bool, GameDetailRecord)> = item_re()
            .captures_iter(raw)
            .filter_map(|c| {
                let attrs = attrs(&c[1]);
                let id = number::<u64>(attrs.get("id").map(String::as_str));
                if id == 0 {
                    return None;
                }
                let body = &c[2];
                let mut record = GameDetailRecord::new(id, name(body));
                record.game_type =
                    GameType::from_upstream(attrs.get("type").map_or("", String::as_str));
                record.description = description_re()
                    .captures(body)
                    .map(|d| decode_text(d[1].trim().as_bytes()))
                    .unwrap_or_default();
                record.year_published = value(body, "yearpublished");
                record.min_players = value(body, "minplayers");
                record.max_players = value(body, "maxplayers");
                record.playing_time = value(body, "playingtime");
                record.average_rating = value(body, "average");
                Some((attrs.get("type").map(String::as_str) == Some("boardgame"), record))
            })
            .collect();

        let mut ids: Vec<u64> = requested_ids.to_vec();
        if ids.is_empty() {
            for (_, record) in &entries {
                if !ids.contains(&record.id) {
                    ids.push(record.id);
                }
            }
        }

        ids.into_iter()
            .filter_map(|id| {
                let mut matching = entries.iter().filter(|(_, r)| r.id == id);
                let first = matching.clone().next()?;
                let primary = matching.find(|(canonical, _)| *canonical).unwrap_or(first);
                Some(primary.1.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub const SEARCH_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<items total="3" termsofuse="https://boardgamegeek.com/xmlapi/termsofuse">
  <item type="boardgame" id="13">
    <name type="primary" value="CATAN"/>
    <yearpublished value="1995" />
  </item>
  <item type="boardgame" id="926">
    <name type="primary" value="Catan: Seafarers"/>
    <yearpublished value="1997" />
  </item>
  <item type="boardgame" id="9209">
    <name type="alternate" value="Ticket to Ride &amp; Friends"/>
  </item>
</items>"#;

    pub const THING_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<items termsofuse="https://boardgamegeek.com/xmlapi/termsofuse">
  <item type="boardgameexpansion" id="13">
    <name type="primary" sortindex="1" value="Wrong Entry"/>
  </item>
  <item type="boardgame" id="13">
    <thumbnail>https://cf.geekdo-images.com/thumb.jpg</thumbnail>
    <image>https://cf.geekdo-images.com/image.jpg</image>
    <name type="primary" sortindex="1" value="CATAN"/>
    <name type="alternate" sortindex="1" value="Die Siedler von Catan"/>
    <name type="alternate" sortindex="1" value="Settlers of Catan"/>
    <description>Trade &amp;amp; build.&amp;#10;Klaus Teuber&amp;#039;s classic &amp;copy;</description>
    <yearpublished value="1995" />
    <minplayers value="3" />
    <maxplayers value="4" />
    <poll name="language_dependence" title="Language Dependence" totalvotes="20">
      <results>
        <result level="1" value="No necessary in-game text" numvotes="15"/>
        <result level="2" value="Some necessary text" numvotes="5"/>
      </results>
    </poll>
    <playingtime value="120" />
    <minplaytime value="60" />
    <maxplaytime value="120" />
    <minage value="10" />
    <link type="boardgamecategory" id="1021" value="Economic" />
    <link type="boardgamemechanic" id="2072" value="Dice Rolling" />
    <link type="boardgamedesigner" id="11" value="Klaus Teuber" />
    <link type="boardgamepublisher" id="37" value="KOSMOS" />
    <link type="boardgameexpansion" id="926" value="Catan: Seafarers" />
    <versions>
      <item type="boardgameversion" id="1001">
        <name type="primary" value="English edition"/>
        <yearpublished value="2015"/>
        <link type="language" id="2184" value="English"/>
      </item>
      <item type="boardgameversion" id="1002">
        <name type="primary" value="German edition"/>
        <yearpublished value="1995"/>
        <link type="language" id="2188" value="German"/>
      </item>
    </versions>
    <statistics page="1">
      <ratings>
        <usersrated value="120000" />
        <average value="7.1" />
        <bayesaverage value="6.9" />
        <ranks>
          <rank type="subtype" id="1" name="boardgame" friendlyname="Board Game Rank" value="500" bayesaverage="6.9" />
          <rank type="family" id="5497" name="strategygames" friendlyname="Strategy Game Rank" value="300" bayesaverage="6.9" />
        </ranks>
        <averageweight value="2.3" />
      </ratings>
    </statistics>
  </item>
</items>"#;

    const COLLECTION_XML: &str = r#"<items totalitems="2" termsofuse="x" pubdate="Mon, 01 Jan 2024">
  <item objecttype="thing" objectid="13" subtype="boardgame" collid="1">
    <name sortindex="1">CATAN</name>
    <yearpublished>1995</yearpublished>
    <thumbnail>https://thumb</thumbnail>
    <stats minplayers="3" maxplayers="4"><rating value="8"/></stats>
    <status own="1" prevowned="0" fortrade="0" want="0" wanttoplay="0" wanttobuy="0" wishlist="0" preordered="0"/>
    <numplays>12</numplays>
  </item>
  <item objecttype="thing" objectid="926" subtype="boardgameexpansion" collid="2">
    <name sortindex="1">Catan: Seafarers</name>
    <stats><rating value="N/A"/></stats>
    <status own="0" wishlist="1"/>
    <numplays>0</numplays>
  </item>
</items>"#;

    #[test]
    fn decodes_html_entities() {
        assert_eq!(
            decode_html_entities("Ticket to Ride &amp; Friends"),
            "Ticket to Ride & Friends"
        );
        assert_eq!(
            decode_html_entities("&lt;b&gt; &quot;x&quot; &#039;y&#039; &nbsp;&copy;&reg;&trade;"),
            "<b> \"x\" 'y'  ©®™"
        );
        assert_eq!(decode_html_entities("&#x41;&#66;&eacute;"), "ABé");
        // not entities: stays as written
        assert_eq!(decode_html_entities("R&D & more &bogus; &"), "R&D & more &bogus; &");
    }

    #[test]
    fn parses_search_results() {
        let parser = ResponseParser::new();
        let parsed = parser.parse_search(SEARCH_XML);
        assert_eq!(parsed.total, 3);
        assert_eq!(parsed.items.len(), 3);
        assert_eq!(parsed.items[0].id, 13);
        assert_eq!(parsed.items[0].name, "CATAN");
        assert_eq!(parsed.items[0].year_published, 1995);
        assert_eq!(parsed.items[0].upstream_type, GameType::BaseGame);
        assert_eq!(parsed.items[2].name, "Ticket to Ride & Friends");
        // missing year defaults to 0
        assert_eq!(parsed.items[2].year_published, 0);
    }

    #[test]
    fn parses_detail_and_prefers_board_game_entry() {
        let parser = ResponseParser::new();
        let records = parser.parse_details(THING_XML, &[13]);
        assert_eq!(records.len(), 1);
        let record = &records[0];

        assert_eq!(record.name, "CATAN");
        assert_eq!(record.game_type, GameType::BaseGame);
        assert_eq!(record.description, "Trade & build.\nKlaus Teuber's classic ©");
        assert_eq!(record.min_players, 3);
        assert_eq!(record.max_players, 4);
        assert_eq!(record.playing_time, 120);
        assert_eq!(record.min_age, 10);
        assert_eq!(record.rank, 500);
        assert_eq!(record.users_rated, 120000);
        assert!((record.average_rating - 7.1).abs() < f64::EPSILON);
        assert!((record.weight - 2.3).abs() < f64::EPSILON);
        assert_eq!(record.categories, vec!["Economic"]);
        assert_eq!(record.mechanics, vec!["Dice Rolling"]);
        assert_eq!(record.designers, vec!["Klaus Teuber"]);
        assert_eq!(record.publishers, vec!["KOSMOS"]);
        assert_eq!(
            record.alternate_names,
            vec!["Die Siedler von Catan", "Settlers of Catan"]
        );
        assert_eq!(record.editions.len(), 2);
        assert_eq!(record.editions[0].languages, vec!["English"]);
        assert_eq!(record.languages, vec!["English", "German"]);
        assert_eq!(record.expansions.len(), 1);
        assert!(!record.is_confirmed_expansion());

        let dependence = &record.language_dependence;
        assert_eq!(dependence.level, 1);
        assert_eq!(dependence.votes, 15);
        assert_eq!(dependence.total_votes, 20);
        assert_eq!(dependence.percentage, 75.0);
    }

    #[test]
    fn falls_back_to_first_entry_without_board_game_type() {
        let xml = r#"<items><item type="boardgameexpansion" id="926">
            <name type="primary" value="Catan: Seafarers"/>
            <link type="boardgameexpansion" id="13" value="CATAN" inbound="true"/>
        </item></items>"#;
        let records = ResponseParser::new().parse_details(xml, &[926]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].game_type, GameType::Expansion);
        assert!(records[0].is_confirmed_expansion());
        assert_eq!(records[0].expands[0].id, 13);
    }

    #[test]
    fn single_item_document_is_accepted() {
        let xml = r#"<item type="boardgame" id="5"><name type="primary" value="Acquire"/></item>"#;
        match ResponseParser::new().parse(xml, false) {
            ParsedPayload::Details(records) => assert_eq!(records[0].name, "Acquire"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn empty_or_unknown_structure_is_an_empty_payload() {
        let parser = ResponseParser::new();
        assert_eq!(parser.parse_search(""), ParsedSearch::default());
        assert_eq!(parser.parse_search("<html><body>oops</body></html>").items.len(), 0);
        assert!(parser.parse_details("<items></items>", &[1]).is_empty());
        assert_eq!(parser.degraded_parses(), 0);
    }

    #[test]
    fn malformed_xml_uses_degraded_parser() {
        let parser = ResponseParser::new();
        let broken = r#"<items total="1"><item type="boardgame" id="13">
            <name type="primary" value="CATAN"/><yearpublished value="1995"/>
            </item><oops></items>"#;
        let parsed = parser.parse_search(broken);
        assert_eq!(parser.degraded_parses(), 1);
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].name, "CATAN");
        assert_eq!(parsed.items[0].year_published, 1995);

        let details = parser.parse_details(
            r#"<items><item type="boardgame" id="13"><name type="primary" value="CATAN"/>
            <description>Trade</description><minplayers value="3"/></item><broken></items>"#,
            &[13],
        );
        assert_eq!(details[0].min_players, 3);
        assert_eq!(details[0].description, "Trade");
    }

    #[test]
    fn degraded_details_follow_requested_ids_and_primary_entry() {
        let parser = ResponseParser::new();
        let broken = r#"<items>
            <item type="boardgameexpansion" id="13"><name type="primary" value="Wrong Entry"/></item>
            <item type="boardgame" id="13"><name type="primary" value="CATAN"/><minplayers value="3"/><maxplayers value="4"/></item>
            <item type="boardgame" id="822"><name type="primary" value="Carcassonne"/></item>
            <oops></items>"#;

        let details = parser.parse_details(broken, &[13]);
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].name, "CATAN");
        assert_eq!(details[0].min_players, 3);
        assert_eq!(details[0].max_players, 4);

        let all = parser.parse_details(broken, &[]);
        let ids: Vec<u64> = all.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![13, 822]);
        assert!(parser.parse_details(broken, &[99]).is_empty());
    }

    #[test]
    fn parses_collection() {
        let parsed = ResponseParser::new().parse_collection(COLLECTION_XML);
        assert_eq!(parsed.total, 2);
        assert_eq!(parsed.items[0].name, "CATAN");
        assert!(parsed.items[0].owned);
        assert_eq!(parsed.items[0].num_plays, 12);
        assert_eq!(parsed.items[0].user_rating, 8.0);
        assert_eq!(parsed.items[1].game_type, GameType::Expansion);
        assert!(parsed.items[1].wishlist);
        assert_eq!(parsed.items[1].user_rating, 0.0);
    }

    #[test]
    fn collection_errors_and_queue_notices() {
        let parser = ResponseParser::new();
        let err = parser.parse_collection(
            "<errors><error><message>Invalid username specified</message></error></errors>",
        );
        assert_eq!(err.error.as_deref(), Some("Invalid username specified"));

        let queued = parser.parse_collection(
            "<message>Your request for this collection has been accepted and will be processed.</message>",
        );
        assert!(queued.queued);
    }
}
