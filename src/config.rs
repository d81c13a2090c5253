//! Runtime configuration: a JSON file plus a few environment overrides.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::music::audio_sources::Provider;
use crate::music::utils::music_manager::{MusicError, MusicResult};
use crate::music::utils::node_pool::NodeConfig;
use crate::utils::database::APPDATA_DB;

/// Env var naming the configuration file
pub const CONFIG_PATH_VAR: &str = "RUSTY_MUSIC_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "rusty_music.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackCacheConfig {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for TrackCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LyricsConfig {
    /// How far behind playback a chunk may fall before it is skipped
    #[serde(with = "humantime_serde")]
    pub catch_up_window: Duration,
}

impl Default for LyricsConfig {
    fn default() -> Self {
        Self {
            catch_up_window: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MusicConfig {
    pub default_search_provider: Provider,
    pub nodes: Vec<NodeConfig>,
    pub track_cache: TrackCacheConfig,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    pub settings_db_path: PathBuf,
    pub lyrics: LyricsConfig,
}

impl Default for MusicConfig {
    fn default() -> Self {
        Self {
            default_search_provider: Provider::YoutubeMusic,
            nodes: Vec::new(),
            track_cache: TrackCacheConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
            settings_db_path: PathBuf::from(APPDATA_DB),
            lyrics: LyricsConfig::default(),
        }
    }
}

impl MusicConfig {
    /// Load from the file named by `RUSTY_MUSIC_CONFIG`, then apply env overrides.
    pub fn load() -> MusicResult<Self> {
        let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_path(&path)?;
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Read a config file. A missing file yields the defaults.
    pub fn from_path(path: impl AsRef<Path>) -> MusicResult<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                info!("Loading configuration from {}", path.display());
                Self::from_json(&raw)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "No configuration file at {}, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(MusicError::ConfigError(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn from_json(raw: &str) -> MusicResult<Self> {
        serde_json::from_str(raw).map_err(|e| MusicError::ConfigError(e.to_string()))
    }

    /// Apply `DEFAULT_SEARCH_PROVIDER` and `SETTINGS_DB_PATH` from `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> MusicResult<()> {
        if let Some(provider) = lookup("DEFAULT_SEARCH_PROVIDER") {
            self.default_search_provider = provider.parse().map_err(|_| {
                MusicError::ConfigError(format!("unknown search provider '{}'", provider))
            })?;
            debug!(
                "Default search provider overridden to {}",
                self.default_search_provider.display_name()
            );
        }
        if let Some(path) = lookup("SETTINGS_DB_PATH") {
            self.settings_db_path = PathBuf::from(path);
        }
        Ok(())
    }
}
