//! This module defines the providers a track can come from and the features a
//! node can advertise, along with the query parser, the normalized `Track`
//! model and the resolver that turns queries into tracks.

/// Submodule classifying raw user input into typed queries.
pub mod query;
/// Submodule fanning queries out to capable nodes.
pub mod resolver;
/// Submodule defining the `Track` struct and its binary encoding.
pub mod track_metadata;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::music::utils::music_manager::MusicError;

/// An external search/content source a track can be resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Provider {
    Deezer,
    Youtube,
    YoutubeMusic,
    Spotify,
    AppleMusic,
    SoundCloud,
    YandexMusic,
    /// Plain HTTP source that no catalog claims.
    Url,
    /// Local file on the node's filesystem.
    Local,
}

impl Provider {
    /// Every provider, in prefix-matching order.
    pub const ALL: [Provider; 9] = [
        Provider::Deezer,
        Provider::Youtube,
        Provider::YoutubeMusic,
        Provider::Spotify,
        Provider::AppleMusic,
        Provider::SoundCloud,
        Provider::YandexMusic,
        Provider::Url,
        Provider::Local,
    ];

    /// Machine-readable tag, used in configuration and in the track encoding.
    pub fn tag(self) -> &'static str {
        match self {
            Provider::Deezer => "deezer",
            Provider::Youtube => "youtube",
            Provider::YoutubeMusic => "youtube_music",
            Provider::Spotify => "spotify",
            Provider::AppleMusic => "applemusic",
            Provider::SoundCloud => "soundcloud",
            Provider::YandexMusic => "yandexmusic",
            Provider::Url => "http",
            Provider::Local => "local",
        }
    }

    /// Human-readable name used in user-facing messages.
    pub fn display_name(self) -> &'static str {
        match self {
            Provider::Deezer => "Deezer",
            Provider::Youtube => "YouTube",
            Provider::YoutubeMusic => "YouTube Music",
            Provider::Spotify => "Spotify",
            Provider::AppleMusic => "Apple Music",
            Provider::SoundCloud => "SoundCloud",
            Provider::YandexMusic => "Yandex Music",
            Provider::Url => "HTTP",
            Provider::Local => "Local Files",
        }
    }

    /// The search prefix understood by nodes, if this provider can be searched.
    pub fn search_prefix(self) -> Option<&'static str> {
        match self {
            Provider::Deezer => Some("dzsearch:"),
            Provider::Youtube => Some("ytsearch:"),
            Provider::YoutubeMusic => Some("ytmsearch:"),
            Provider::Spotify => Some("spsearch:"),
            Provider::AppleMusic => Some("amsearch:"),
            Provider::SoundCloud => Some("scsearch:"),
            Provider::YandexMusic => Some("ymsearch:"),
            Provider::Url | Provider::Local => None,
        }
    }

    pub fn is_searchable(self) -> bool {
        self.search_prefix().is_some()
    }

    /// Maps a node-reported `sourceName` onto a provider.
    /// Unknown sources are treated as plain HTTP.
    pub fn from_source_name(source: &str) -> Provider {
        match source.to_ascii_lowercase().as_str() {
            "deezer" => Provider::Deezer,
            "youtube" => Provider::Youtube,
            "youtube_music" | "youtubemusic" | "ytmusic" => Provider::YoutubeMusic,
            "spotify" => Provider::Spotify,
            "applemusic" | "apple_music" => Provider::AppleMusic,
            "soundcloud" => Provider::SoundCloud,
            "yandexmusic" | "yandex_music" | "yandex" => Provider::YandexMusic,
            "local" => Provider::Local,
            _ => Provider::Url,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Provider {
    type Err = MusicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Provider::ALL
            .into_iter()
            .find(|provider| provider.tag() == lowered)
            .or(match lowered.as_str() {
                "url" => Some(Provider::Url),
                "apple_music" => Some(Provider::AppleMusic),
                "yandex_music" => Some(Provider::YandexMusic),
                "ytmusic" | "youtubemusic" => Some(Provider::YoutubeMusic),
                _ => None,
            })
            .ok_or_else(|| MusicError::ConfigError(format!("Unknown provider: {}", s)))
    }
}

impl TryFrom<String> for Provider {
    type Error = MusicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Provider> for String {
    fn from(value: Provider) -> Self {
        value.tag().to_string()
    }
}

/// A capability a node advertises.
///
/// Playback is implied for every node; provider features gate resolution,
/// `Lyrics` gates lyric fetches and `Filters` gates effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Feature {
    Playback,
    Provider(Provider),
    Lyrics,
    Filters,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feature::Playback => f.write_str("playback"),
            Feature::Provider(provider) => f.write_str(provider.tag()),
            Feature::Lyrics => f.write_str("lyrics"),
            Feature::Filters => f.write_str("filters"),
        }
    }
}

impl FromStr for Feature {
    type Err = MusicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "playback" => Ok(Feature::Playback),
            "lyrics" => Ok(Feature::Lyrics),
            "filters" => Ok(Feature::Filters),
            other => other.parse().map(Feature::Provider),
        }
    }
}

impl TryFrom<String> for Feature {
    type Error = MusicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Feature> for String {
    fn from(value: Feature) -> Self {
        value.to_string()
    }
}
