//! Classifies raw user input into a typed `Query`: an explicit provider
//! search, a URL, or a local file path. Parsing is pure and never touches the
//! network.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use url::Url;

use super::Provider;
use crate::music::utils::music_manager::{MusicError, MusicResult};

/// Prefix forcing a query to be treated as a local file path.
const LOCAL_PREFIX: &str = "local:";

/// Matches absolute/relative Unix paths, home-relative paths and Windows drive paths.
static LOCAL_PATH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:/|\./|\.\./|~/|[A-Za-z]:[\\/])").expect("local path regex is valid")
});

/// Matches the Yandex Music hosts across its regional domains.
static YANDEX_HOST_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^music\.yandex\.[a-z]{2,3}$").expect("yandex host regex is valid")
});

/// How the node should interpret the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryKind {
    Search,
    Url,
    Local,
}

/// A parsed, immutable user query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    pub raw_text: String,
    pub provider: Provider,
    pub search_term: String,
    pub kind: QueryKind,
}

impl Query {
    /// Builds a search query directly, bypassing prefix detection.
    pub fn search(provider: Provider, term: impl Into<String>) -> MusicResult<Self> {
        let term = term.into();
        let prefix = provider.search_prefix().ok_or_else(|| {
            MusicError::InvalidQuery(format!("{} cannot be searched", provider.display_name()))
        })?;
        let term = term.trim().to_string();
        if term.is_empty() {
            return Err(MusicError::InvalidQuery("Search term is empty".to_string()));
        }
        Ok(Self {
            raw_text: format!("{}{}", prefix, term),
            provider,
            search_term: term,
            kind: QueryKind::Search,
        })
    }

    /// The identifier handed to a node's load endpoint.
    pub fn identifier(&self) -> String {
        match (self.kind, self.provider.search_prefix()) {
            (QueryKind::Search, Some(prefix)) => format!("{}{}", prefix, self.search_term),
            _ => self.search_term.clone(),
        }
    }

    pub fn is_search(&self) -> bool {
        self.kind == QueryKind::Search
    }

    /// The message shown when the query produced nothing.
    pub fn not_found_message(&self) -> String {
        format!(
            "No tracks were found for your query on {}.",
            self.provider.display_name()
        )
    }
}

/// Parses raw strings, routing bare search terms to a default provider.
#[derive(Debug, Clone, Copy)]
pub struct QueryParser {
    default_provider: Provider,
}

impl Default for QueryParser {
    fn default() -> Self {
        Self {
            default_provider: Provider::YoutubeMusic,
        }
    }
}

impl QueryParser {
    /// Creates a parser; the default provider must support search.
    pub fn new(default_provider: Provider) -> MusicResult<Self> {
        if !default_provider.is_searchable() {
            return Err(MusicError::ConfigError(format!(
                "{} cannot be used as the default search provider",
                default_provider.display_name()
            )));
        }
        Ok(Self { default_provider })
    }

    pub fn default_provider(&self) -> Provider {
        self.default_provider
    }

    /// Classifies `raw` into a `Query`.
    pub fn parse(&self, raw: &str) -> MusicResult<Query> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(MusicError::InvalidQuery("Query is empty".to_string()));
        }

        for provider in Provider::ALL {
            if let Some(prefix) = provider.search_prefix() {
                if let Some(term) = strip_prefix_ignore_case(text, prefix) {
                    return Self::build(raw, provider, term, QueryKind::Search);
                }
            }
        }

        if let Some(path) = strip_prefix_ignore_case(text, LOCAL_PREFIX) {
            return Self::build(raw, Provider::Local, path, QueryKind::Local);
        }

        // Checked before URL parsing: "C:\music" parses as a URL with scheme "c".
        if LOCAL_PATH_REGEX.is_match(text) {
            return Self::build(raw, Provider::Local, text, QueryKind::Local);
        }

        if let Ok(url) = Url::parse(text) {
            match url.scheme() {
                "file" => {
                    return Self::build(raw, Provider::Local, url.path(), QueryKind::Local);
                }
                "http" | "https" => {
                    return Self::build(raw, provider_for_url(&url), text, QueryKind::Url);
                }
                _ => {}
            }
        }

        Self::build(raw, self.default_provider, text, QueryKind::Search)
    }

    fn build(raw: &str, provider: Provider, term: &str, kind: QueryKind) -> MusicResult<Query> {
        let term = term.trim();
        if term.is_empty() {
            return Err(MusicError::InvalidQuery(format!(
                "Query for {} is empty",
                provider.display_name()
            )));
        }
        Ok(Query {
            raw_text: raw.to_string(),
            provider,
            search_term: term.to_string(),
            kind,
        })
    }
}

/// Parses with the default parser (YouTube Music for bare terms).
pub fn parse(raw: &str) -> MusicResult<Query> {
    QueryParser::default().parse(raw)
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        text.get(prefix.len()..)
    } else {
        None
    }
}

/// Attributes a URL to the catalog that owns its host.
fn provider_for_url(url: &Url) -> Provider {
    let host = url
        .host_str()
        .unwrap_or_default()
        .trim_start_matches("www.")
        .trim_start_matches("m.")
        .to_ascii_lowercase();

    match host.as_str() {
        "music.youtube.com" => Provider::YoutubeMusic,
        "youtube.com" | "youtu.be" => Provider::Youtube,
        "open.spotify.com" | "play.spotify.com" => Provider::Spotify,
        "deezer.com" | "deezer.page.link" | "link.deezer.com" => Provider::Deezer,
        "music.apple.com" | "itunes.apple.com" => Provider::AppleMusic,
        "soundcloud.com" | "on.soundcloud.com" => Provider::SoundCloud,
        h if YANDEX_HOST_REGEX.is_match(h) => Provider::YandexMusic,
        _ => Provider::Url,
    }
}
