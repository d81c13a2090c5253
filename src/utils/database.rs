//! Settings persistence: a small key/value store interface, a SQLite
//! implementation of it, and the typed per-session and global settings kept
//! in it.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::music::utils::SessionId;
use crate::music::utils::effects::EqualizerPreset;
use crate::music::utils::music_manager::MusicResult;
use crate::music::utils::queue_manager::RepeatMode;

/// The default filename for the SQLite database.
pub const APPDATA_DB: &str = "application_data.db";
/// Key of the process-wide settings.
pub const GLOBAL_KEY: &str = "global";

/// Asynchronous key/value settings storage.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> MusicResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> MusicResult<()>;

    async fn delete(&self, key: &str) -> MusicResult<()>;
}

/// Settings store backed by a SQLite file. Values are stored as JSON text.
pub struct SqliteSettingsStore {
    path: PathBuf,
}

impl SqliteSettingsStore {
    /// Opens (creating if needed) the database and its `settings` table.
    pub async fn open(path: impl AsRef<Path>) -> MusicResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db_path = path.clone();
        tokio::task::spawn_blocking(move || create_tables(&db_path)).await??;
        info!("Opened settings database at {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Creates the `settings` table if it doesn't exist.
fn create_tables(path: &Path) -> rusqlite::Result<()> {
    let conn = Connection::open(path)?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

#[async_trait]
impl SettingsStore for SqliteSettingsStore {
    async fn get(&self, key: &str) -> MusicResult<Option<Value>> {
        let path = self.path.clone();
        let key = key.to_string();
        let raw: Option<String> = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(path)?;
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                [&key],
                |row| row.get(0),
            )
            .optional()
        })
        .await??;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> MusicResult<()> {
        let path = self.path.clone();
        let key = key.to_string();
        let raw = serde_json::to_string(&value)?;
        debug!("Storing settings under '{}'", key);
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(path)?;
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, raw, Utc::now().timestamp()],
            )
        })
        .await??;
        Ok(())
    }

    async fn delete(&self, key: &str) -> MusicResult<()> {
        let path = self.path.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(path)?;
            conn.execute("DELETE FROM settings WHERE key = ?1", [&key])
        })
        .await??;
        Ok(())
    }
}

/// In-memory settings store, lost on exit.
#[derive(Default)]
pub struct MemorySettingsStore {
    values: DashMap<String, Value>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self, key: &str) -> MusicResult<Option<Value>> {
        Ok(self.values.get(key).map(|value| value.clone()))
    }

    async fn set(&self, key: &str, value: Value) -> MusicResult<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> MusicResult<()> {
        self.values.remove(key);
        Ok(())
    }
}

/// An "when alone in the channel" timer setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AloneSetting {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub time: Duration,
}

/// Persisted per-session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Last used equalizer; absent when it was never set or was reset.
    pub equalizer_preset: Option<EqualizerPreset>,
    pub repeat_mode: RepeatMode,
    pub auto_play: bool,
    pub volume: u16,
    pub alone_pause: AloneSetting,
    pub alone_dc: AloneSetting,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            equalizer_preset: None,
            repeat_mode: RepeatMode::Off,
            auto_play: false,
            volume: 100,
            alone_pause: AloneSetting {
                enabled: false,
                time: Duration::from_secs(60),
            },
            alone_dc: AloneSetting {
                enabled: false,
                time: Duration::from_secs(300),
            },
        }
    }
}

/// Persisted process-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    /// Whether nodes flagged as managed may be used.
    pub managed_node_enabled: bool,
    pub auto_update_nodes: bool,
    pub config_folder_path: Option<PathBuf>,
    pub java_path: Option<PathBuf>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            managed_node_enabled: false,
            auto_update_nodes: true,
            config_folder_path: None,
            java_path: None,
        }
    }
}

pub fn session_key(session_id: SessionId) -> String {
    format!("session:{}", session_id)
}

/// Settings of a session, defaults when none were stored.
pub async fn load_session_settings(
    store: &dyn SettingsStore,
    session_id: SessionId,
) -> MusicResult<SessionSettings> {
    match store.get(&session_key(session_id)).await? {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(SessionSettings::default()),
    }
}

pub async fn save_session_settings(
    store: &dyn SettingsStore,
    session_id: SessionId,
    settings: &SessionSettings,
) -> MusicResult<()> {
    store
        .set(&session_key(session_id), serde_json::to_value(settings)?)
        .await
}

pub async fn load_global_settings(store: &dyn SettingsStore) -> MusicResult<GlobalSettings> {
    match store.get(GLOBAL_KEY).await? {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(GlobalSettings::default()),
    }
}

pub async fn save_global_settings(
    store: &dyn SettingsStore,
    settings: &GlobalSettings,
) -> MusicResult<()> {
    store.set(GLOBAL_KEY, serde_json::to_value(settings)?).await
}
