//! Hand-written fakes for the node and the notification channel.
//! They record every call so tests can assert on what was sent.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use rusty_music::music::utils::lyrics_scheduler::LyricsDocument;
use rusty_music::music::utils::node_client::{LoadResult, NodeClient, NodeStats, PlayerUpdate};
use rusty_music::utils::notifier::Notifier;
use rusty_music::{MusicError, MusicResult, SessionId, Track};

/// In-process node with canned load results and lyrics.
#[derive(Default)]
pub struct FakeNode {
    loads: Mutex<HashMap<String, LoadResult>>,
    lyrics: Mutex<Option<LyricsDocument>>,
    lyrics_error: Mutex<Option<String>>,
    update_delays: Mutex<VecDeque<Duration>>,
    stats: Mutex<NodeStats>,
    updates: Mutex<Vec<(SessionId, PlayerUpdate)>>,
    load_calls: AtomicUsize,
    reject_updates: AtomicBool,
}

impl FakeNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_load(self, identifier: &str, result: LoadResult) -> Self {
        self.loads
            .lock()
            .unwrap()
            .insert(identifier.to_string(), result);
        self
    }

    pub fn with_lyrics(self, lyrics: LyricsDocument) -> Self {
        *self.lyrics.lock().unwrap() = Some(lyrics);
        self
    }

    /// Make every lyrics fetch fail with a provider error.
    pub fn with_lyrics_error(self, message: &str) -> Self {
        *self.lyrics_error.lock().unwrap() = Some(message.to_string());
        self
    }

    pub fn with_stats(self, stats: NodeStats) -> Self {
        *self.stats.lock().unwrap() = stats;
        self
    }

    /// Make every player update fail from now on.
    pub fn reject_updates(&self) {
        self.reject_updates.store(true, Ordering::SeqCst);
    }

    /// Hold the next player update for `delay` before it lands (or fails).
    pub fn delay_next_update(&self, delay: Duration) {
        self.update_delays.lock().unwrap().push_back(delay);
    }

    /// Encoded id of the last track the node was told to play.
    pub fn last_played(&self) -> Option<String> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|(_, update)| update.track.as_ref()?.encoded.clone())
    }

    pub fn updates(&self) -> Vec<(SessionId, PlayerUpdate)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeClient for FakeNode {
    async fn load_tracks(&self, identifier: &str) -> MusicResult<LoadResult> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .loads
            .lock()
            .unwrap()
            .get(identifier)
            .cloned()
            .unwrap_or(LoadResult::Empty))
    }

    async fn update_player(&self, session_id: SessionId, update: &PlayerUpdate) -> MusicResult<()> {
        let delay = self.update_delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.reject_updates.load(Ordering::SeqCst) {
            return Err(MusicError::ProviderError("player update rejected".to_string()));
        }
        self.updates
            .lock()
            .unwrap()
            .push((session_id, update.clone()));
        Ok(())
    }

    async fn destroy_player(&self, _session_id: SessionId) -> MusicResult<()> {
        Ok(())
    }

    async fn fetch_lyrics(&self, _track: &Track) -> MusicResult<Option<LyricsDocument>> {
        if let Some(message) = self.lyrics_error.lock().unwrap().clone() {
            return Err(MusicError::ProviderError(message));
        }
        Ok(self.lyrics.lock().unwrap().clone())
    }

    async fn stats(&self) -> MusicResult<NodeStats> {
        Ok(self.stats.lock().unwrap().clone())
    }
}

/// Notifier that keeps every message it was asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(u64, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(u64, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, channel_id: u64, content: String) -> MusicResult<()> {
        self.sent.lock().unwrap().push((channel_id, content));
        Ok(())
    }
}
