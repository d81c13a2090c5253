//! The narrow interface this crate uses to talk to a playback node, and a
//! reqwest implementation speaking a Lavalink-v4-shaped REST protocol.

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::SessionId;
use super::effects::EffectsState;
use super::lyrics_scheduler::{LyricsDocument, TimedLine};
use super::music_manager::{MusicError, MusicResult};
use crate::music::audio_sources::Provider;
use crate::music::audio_sources::track_metadata::{Track, TrackInfo};

/// Operations a node must support. Every call is a suspension point.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Resolves an identifier (search, URL or path) into tracks.
    async fn load_tracks(&self, identifier: &str) -> MusicResult<LoadResult>;

    /// Applies a partial player update (voice, track, pause, volume, filters...).
    async fn update_player(&self, session_id: SessionId, update: &PlayerUpdate) -> MusicResult<()>;

    /// Tears down the node-side player of a session.
    async fn destroy_player(&self, session_id: SessionId) -> MusicResult<()>;

    /// Fetches lyrics for a track, `None` when the node has none.
    async fn fetch_lyrics(&self, track: &Track) -> MusicResult<Option<LyricsDocument>>;

    /// Current node statistics, used by the heartbeat.
    async fn stats(&self) -> MusicResult<NodeStats>;
}

/// A track as a node reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTrack {
    #[serde(default)]
    pub encoded: Option<String>,
    pub info: NodeTrackInfo,
    /// Provider-reported rank; lower is better.
    #[serde(default)]
    pub rank: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTrackInfo {
    pub identifier: String,
    pub author: String,
    pub length: u64,
    #[serde(default)]
    pub is_stream: bool,
    pub title: String,
    #[serde(default)]
    pub uri: Option<String>,
    pub source_name: String,
    #[serde(default)]
    pub artwork_url: Option<String>,
}

impl NodeTrack {
    /// Normalizes the node's representation into a `Track`.
    pub fn into_track(self, node_identifier: &str) -> Track {
        let info = TrackInfo {
            title: self.info.title,
            author: self.info.author,
            identifier: self.info.identifier,
            source: Provider::from_source_name(&self.info.source_name),
            uri: self.info.uri,
            artwork_url: self.info.artwork_url,
            duration_ms: self.info.length,
            is_stream: self.info.is_stream,
        };
        let track = match self.encoded {
            Some(encoded) if !encoded.is_empty() => Track::from_encoded_info(encoded, info),
            _ => Track::from_info(info),
        };
        track.with_origin_node(node_identifier)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    #[serde(default)]
    pub selected_track: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePlaylist {
    pub info: PlaylistInfo,
    pub tracks: Vec<NodeTrack>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadError {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub cause: Option<String>,
}

/// Outcome of a node load call.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadResult {
    Track(NodeTrack),
    Playlist(NodePlaylist),
    Search(Vec<NodeTrack>),
    Empty,
    Error(LoadError),
}

impl LoadResult {
    /// All reported tracks, ordered by provider rank (stable for ties).
    pub fn into_ranked_tracks(self) -> Vec<NodeTrack> {
        let mut tracks = match self {
            LoadResult::Track(track) => vec![track],
            LoadResult::Playlist(playlist) => playlist.tracks,
            LoadResult::Search(tracks) => tracks,
            LoadResult::Empty | LoadResult::Error(_) => Vec::new(),
        };
        tracks.sort_by_key(|track| track.rank.unwrap_or(u32::MAX));
        tracks
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLoadResult {
    load_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl TryFrom<RawLoadResult> for LoadResult {
    type Error = MusicError;

    fn try_from(raw: RawLoadResult) -> Result<Self, MusicError> {
        Ok(match raw.load_type.as_str() {
            "track" => LoadResult::Track(serde_json::from_value(raw.data)?),
            "playlist" => LoadResult::Playlist(serde_json::from_value(raw.data)?),
            "search" => LoadResult::Search(serde_json::from_value(raw.data)?),
            "empty" => LoadResult::Empty,
            "error" => LoadResult::Error(serde_json::from_value(raw.data).unwrap_or_default()),
            other => {
                return Err(MusicError::ProviderError(format!(
                    "unknown load type '{}'",
                    other
                )));
            }
        })
    }
}

/// Partial player update; absent fields are left untouched by the node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<TrackUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceUpdate>,
}

/// `encoded: None` serializes as `null`, which stops playback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackUpdate {
    pub encoded: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceUpdate {
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EqualizerBand {
    pub band: u8,
    pub gain: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timescale {
    pub speed: f64,
    pub pitch: f64,
    pub rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Filters {
    pub equalizer: Vec<EqualizerBand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timescale: Option<Timescale>,
}

impl PlayerUpdate {
    pub fn connect(channel_id: u64) -> Self {
        Self {
            voice: Some(VoiceUpdate {
                channel_id: channel_id.to_string(),
            }),
            ..Default::default()
        }
    }

    pub fn play(track: &Track, position_ms: u64) -> Self {
        Self {
            track: Some(TrackUpdate {
                encoded: Some(track.encoded_id.clone()),
            }),
            position: Some(position_ms),
            paused: Some(false),
            ..Default::default()
        }
    }

    pub fn stop() -> Self {
        Self {
            track: Some(TrackUpdate { encoded: None }),
            ..Default::default()
        }
    }

    pub fn paused(paused: bool) -> Self {
        Self {
            paused: Some(paused),
            ..Default::default()
        }
    }

    pub fn seek(position_ms: u64) -> Self {
        Self {
            position: Some(position_ms),
            ..Default::default()
        }
    }

    pub fn volume(volume: u16) -> Self {
        Self {
            volume: Some(volume),
            ..Default::default()
        }
    }

    pub fn filters(effects: &EffectsState) -> Self {
        Self {
            filters: Some(effects.to_filters()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub cpu: CpuStats,
}

impl NodeStats {
    /// Lavalink-style penalty: one point per playing player plus an
    /// exponential CPU term.
    pub fn load_score(&self) -> u32 {
        let cpu_penalty = (1.05f64.powf(100.0 * self.cpu.system_load) * 10.0 - 10.0).round();
        let cpu_penalty = if cpu_penalty.is_finite() && cpu_penalty > 0.0 {
            cpu_penalty.min(f64::from(u32::MAX)) as u32
        } else {
            0
        };
        self.playing_players.saturating_add(cpu_penalty)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeLyricsLine {
    timestamp: u64,
    #[serde(default)]
    duration: Option<u64>,
    line: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeLyrics {
    #[serde(default)]
    source_name: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    lines: Vec<NodeLyricsLine>,
    #[serde(default = "default_exact")]
    exact: bool,
}

fn default_exact() -> bool {
    true
}

impl From<NodeLyrics> for LyricsDocument {
    fn from(value: NodeLyrics) -> Self {
        let starts: Vec<u64> = value.lines.iter().map(|line| line.timestamp).collect();
        let timed_lines: Vec<TimedLine> = value
            .lines
            .into_iter()
            .enumerate()
            .map(|(i, line)| {
                // Missing durations run until the next line starts.
                let duration_ms = line.duration.unwrap_or_else(|| {
                    starts
                        .get(i + 1)
                        .map_or(0, |next| next.saturating_sub(line.timestamp))
                });
                TimedLine {
                    text: line.line,
                    start_ms: line.timestamp,
                    duration_ms,
                }
            })
            .collect();

        let full_text = value.text.unwrap_or_else(|| {
            timed_lines
                .iter()
                .map(|line| line.text.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        });

        LyricsDocument {
            exact: value.exact,
            provider: value
                .provider
                .or(value.source_name)
                .unwrap_or_else(|| "unknown".to_string()),
            full_text,
            timed_lines,
        }
    }
}

/// REST client for one node.
pub struct RestNodeClient {
    http: Client,
    base_url: String,
    password: String,
    /// Node-side session key under which this client's players live.
    session: String,
}

impl RestNodeClient {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        password: impl Into<String>,
        session: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            password: password.into(),
            session: session.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn player_url(&self, session_id: SessionId) -> String {
        self.url(&format!(
            "/v4/sessions/{}/players/{}",
            self.session, session_id
        ))
    }
}

#[async_trait]
impl NodeClient for RestNodeClient {
    async fn load_tracks(&self, identifier: &str) -> MusicResult<LoadResult> {
        debug!("Loading '{}' from {}", identifier, self.base_url);
        let response = self
            .http
            .get(self.url("/v4/loadtracks"))
            .query(&[("identifier", identifier)])
            .header(AUTHORIZATION, &self.password)
            .send()
            .await?
            .error_for_status()?;

        let raw: RawLoadResult = response.json().await?;
        raw.try_into()
    }

    async fn update_player(&self, session_id: SessionId, update: &PlayerUpdate) -> MusicResult<()> {
        debug!("Updating player {} on {}: {:?}", session_id, self.base_url, update);
        self.http
            .patch(self.player_url(session_id))
            .header(AUTHORIZATION, &self.password)
            .json(update)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn destroy_player(&self, session_id: SessionId) -> MusicResult<()> {
        info!("Destroying player {} on {}", session_id, self.base_url);
        self.http
            .delete(self.player_url(session_id))
            .header(AUTHORIZATION, &self.password)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn fetch_lyrics(&self, track: &Track) -> MusicResult<Option<LyricsDocument>> {
        let response = self
            .http
            .get(self.url("/v4/lyrics"))
            .query(&[("track", track.encoded_id.as_str())])
            .header(AUTHORIZATION, &self.password)
            .send()
            .await?;

        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT
        ) {
            return Ok(None);
        }

        let lyrics: NodeLyrics = response.error_for_status()?.json().await?;
        Ok(Some(lyrics.into()))
    }

    async fn stats(&self) -> MusicResult<NodeStats> {
        let stats = self
            .http
            .get(self.url("/v4/stats"))
            .header(AUTHORIZATION, &self.password)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(stats)
    }
}
