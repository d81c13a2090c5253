//! Timed lyrics: when a track starts in a session with timed lyrics enabled,
//! fetch its lyrics and post them in chunks that follow the playback clock.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::SessionId;
use super::event_handlers::PlayerEvent;
use super::music_manager::{MusicError, MusicManager, SessionTask};
use crate::music::audio_sources::Feature;
use crate::music::audio_sources::track_metadata::Track;
use crate::utils::notifier::Notifier;

/// Number of messages a lyric sheet is split into
pub const CHUNK_COUNT: usize = 5;
/// How far behind the playback position a chunk may start and still be posted
pub const CATCH_UP_WINDOW: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedLine {
    pub text: String,
    pub start_ms: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LyricsDocument {
    /// Whether the lyrics were matched exactly to the track
    pub exact: bool,
    pub provider: String,
    pub full_text: String,
    pub timed_lines: Vec<TimedLine>,
}

/// One message worth of lyrics
#[derive(Debug, Clone, PartialEq)]
pub struct LyricChunk {
    pub lines: Vec<TimedLine>,
    /// Start offset of the chunk's first line in the track
    pub start_ms: u64,
    /// Sum of the lines' durations at normal speed
    pub nominal: Duration,
    /// `nominal` at the playback rate the chunk was planned for
    pub adjusted: Duration,
}

impl LyricChunk {
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Wall-clock time `nominal` of track time takes at `rate`.
pub fn adjust_duration(nominal: Duration, rate: f64) -> Duration {
    if rate == 1.0 || !rate.is_finite() || rate <= 0.0 {
        return nominal;
    }
    let micros = (nominal.as_micros() as f64 / rate).round();
    Duration::from_micros(micros as u64)
}

/// Splits the timed lines into `CHUNK_COUNT` equal chunks, the last one
/// taking the remainder. Sheets shorter than `CHUNK_COUNT` lines get one
/// chunk per line.
pub fn plan_chunks(document: &LyricsDocument, rate: f64) -> Vec<LyricChunk> {
    let lines = &document.timed_lines;
    if lines.is_empty() {
        return Vec::new();
    }

    let count = CHUNK_COUNT.min(lines.len());
    let size = lines.len() / count;

    (0..count)
        .map(|i| {
            let start = i * size;
            let end = if i + 1 == count { lines.len() } else { start + size };
            let chunk_lines = lines[start..end].to_vec();
            let nominal = Duration::from_millis(chunk_lines.iter().map(|l| l.duration_ms).sum());
            LyricChunk {
                start_ms: chunk_lines[0].start_ms,
                adjusted: adjust_duration(nominal, rate),
                nominal,
                lines: chunk_lines,
            }
        })
        .collect()
}

/// Subscribes to player events and runs one lyric schedule per session.
pub struct LyricsScheduler {
    manager: Arc<MusicManager>,
    notifier: Arc<dyn Notifier>,
    // Session -> channel the lyrics go to
    targets: DashMap<SessionId, u64>,
    catch_up_window: Duration,
}

impl LyricsScheduler {
    pub fn new(manager: Arc<MusicManager>, notifier: Arc<dyn Notifier>) -> Arc<Self> {
        Self::with_catch_up_window(manager, notifier, CATCH_UP_WINDOW)
    }

    pub fn with_catch_up_window(
        manager: Arc<MusicManager>,
        notifier: Arc<dyn Notifier>,
        catch_up_window: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            notifier,
            targets: DashMap::new(),
            catch_up_window,
        })
    }

    /// Turn timed lyrics on for a session, posting into `channel_id`.
    pub fn enable(&self, session_id: SessionId, channel_id: u64) {
        info!(
            "Timed lyrics enabled for session {} in channel {}",
            session_id, channel_id
        );
        self.targets.insert(session_id, channel_id);
    }

    /// Turn timed lyrics off and stop any schedule in flight.
    pub async fn disable(&self, session_id: SessionId) {
        self.targets.remove(&session_id);
        self.manager
            .cancel_session_task(session_id, SessionTask::Lyrics)
            .await;
        info!("Timed lyrics disabled for session {}", session_id);
    }

    pub fn is_enabled(&self, session_id: SessionId) -> bool {
        self.targets.contains_key(&session_id)
    }

    /// Listen for player events until the manager goes away.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.manager.subscribe();
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => scheduler.handle_event(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Lyrics scheduler missed {} player events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Lyrics scheduler stopped");
        })
    }

    pub async fn handle_event(self: &Arc<Self>, event: &PlayerEvent) {
        match event {
            PlayerEvent::TrackStarted { session_id, track } => {
                let session_id = *session_id;
                let target = self.targets.get(&session_id).map(|channel| *channel);
                let Some(channel_id) = target else {
                    self.manager
                        .cancel_session_task(session_id, SessionTask::Lyrics)
                        .await;
                    return;
                };

                let scheduler = Arc::clone(self);
                let track = track.clone();
                // Replaces, and so cancels, the previous track's schedule.
                if let Err(e) = self
                    .manager
                    .spawn_session_task(session_id, SessionTask::Lyrics, async move {
                        scheduler.run(session_id, channel_id, track).await;
                    })
                    .await
                {
                    warn!("Could not schedule lyrics for session {}: {}", session_id, e);
                }
            }
            PlayerEvent::Stopped { session_id } | PlayerEvent::QueueEnd { session_id, .. } => {
                self.manager
                    .cancel_session_task(*session_id, SessionTask::Lyrics)
                    .await;
            }
            PlayerEvent::Disconnected { session_id, .. } => {
                self.targets.remove(session_id);
                self.manager
                    .cancel_session_task(*session_id, SessionTask::Lyrics)
                    .await;
            }
            _ => {}
        }
    }

    /// Fetch and post the lyrics of `track`, chunk by chunk.
    pub async fn run(&self, session_id: SessionId, channel_id: u64, track: Track) {
        let pool = self.manager.node_pool();
        let node = pool
            .get_node(session_id)
            .filter(|node| node.is_healthy() && node.supports(Feature::Lyrics))
            .or_else(|| pool.find_best_node(Feature::Lyrics));
        let Some(node) = node else {
            self.notify(channel_id, MusicError::NoAvailableNode.to_string())
                .await;
            return;
        };

        let document = match node.client().fetch_lyrics(&track).await {
            Ok(Some(document)) if !document.timed_lines.is_empty() => document,
            Ok(_) => {
                info!("No timed lyrics for '{}'", track.title);
                let error = MusicError::NoLyricsFound(track.title.clone());
                self.notify(channel_id, error.to_string()).await;
                return;
            }
            Err(e) => {
                warn!("Lyrics fetch for '{}' failed: {}", track.title, e);
                let error = match e {
                    MusicError::ProviderError(_) => e,
                    other => MusicError::ProviderError(other.to_string()),
                };
                self.notify(channel_id, error.to_string()).await;
                return;
            }
        };

        let rate = self.manager.playback_rate(session_id).await;
        let chunks = plan_chunks(&document, rate);
        debug!(
            "Scheduling {} lyric chunks for '{}' in session {}",
            chunks.len(),
            track.title,
            session_id
        );

        let window_ms = u64::try_from(self.catch_up_window.as_millis()).unwrap_or(u64::MAX);
        for (i, chunk) in chunks.iter().enumerate() {
            let still_playing = self
                .manager
                .current(session_id)
                .await
                .is_some_and(|current| current.encoded_id == track.encoded_id);
            if !still_playing {
                debug!("Track changed in session {}, dropping lyrics", session_id);
                return;
            }

            let position = self.manager.position_ms(session_id).await;
            if position > chunk.start_ms.saturating_add(window_ms) {
                debug!(
                    "Skipping lyric chunk {} in session {} ({}ms behind)",
                    i,
                    session_id,
                    position - chunk.start_ms
                );
                continue;
            }

            self.notify(channel_id, chunk.text()).await;

            let rate = self.manager.playback_rate(session_id).await;
            tokio::time::sleep(adjust_duration(chunk.nominal, rate)).await;
        }
        debug!("Finished lyrics for '{}' in session {}", track.title, session_id);
    }

    async fn notify(&self, channel_id: u64, content: String) {
        if let Err(e) = self.notifier.send(channel_id, content).await {
            warn!("Failed to post lyrics to channel {}: {}", channel_id, e);
        }
    }
}
