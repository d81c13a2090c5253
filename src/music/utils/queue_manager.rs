use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use super::music_manager::MusicError;
use crate::music::audio_sources::track_metadata::Track;

/// Maximum number of tracks kept in the playback history
pub const MAX_HISTORY: usize = 50;

/// What happens to the current track when it finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepeatMode::Off => write!(f, "off"),
            RepeatMode::Track => write!(f, "track"),
            RepeatMode::Queue => write!(f, "queue"),
        }
    }
}

impl FromStr for RepeatMode {
    type Err = MusicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "disabled" => Ok(RepeatMode::Off),
            "track" | "song" => Ok(RepeatMode::Track),
            "queue" | "all" => Ok(RepeatMode::Queue),
            other => Err(MusicError::ConfigError(format!(
                "Unknown repeat mode '{}'",
                other
            ))),
        }
    }
}

/// The not-yet-played tracks of one session plus its playback history.
///
/// A `TrackQueue` lives inside a session and is only touched while the
/// session lock is held, so every method here is a single atomic mutation.
#[derive(Debug, Clone, Default)]
pub struct TrackQueue {
    tracks: VecDeque<Track>,
    // Most recent first
    history: VecDeque<Track>,
}

impl TrackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a track at the tail, or at `index` clamped to `[0, len]`.
    /// Returns the position the track landed at.
    pub fn add(&mut self, track: Track, index: Option<usize>) -> usize {
        match index {
            Some(index) => {
                let index = index.min(self.tracks.len());
                self.tracks.insert(index, track);
                index
            }
            None => {
                self.tracks.push_back(track);
                self.tracks.len() - 1
            }
        }
    }

    /// Add a batch of tracks contiguously, in order, at the tail or at `index`.
    pub fn bulk_add(&mut self, tracks: Vec<Track>, index: Option<usize>) -> usize {
        let index = index
            .unwrap_or(self.tracks.len())
            .min(self.tracks.len());
        let tail = self.tracks.split_off(index);
        self.tracks.extend(tracks);
        self.tracks.extend(tail);
        index
    }

    /// Pop the head of the queue
    pub fn next(&mut self) -> Option<Track> {
        self.tracks.pop_front()
    }

    /// Put a track back at the head of the queue
    pub fn push_front(&mut self, track: Track) {
        self.tracks.push_front(track);
    }

    /// Remove a track at a specific position in the queue (0-based index)
    pub fn remove(&mut self, index: usize) -> Option<Track> {
        self.tracks.remove(index)
    }

    /// Remove the entry nearest the tail carrying `encoded_id`
    pub fn remove_last_matching(&mut self, encoded_id: &str) -> Option<Track> {
        let index = self
            .tracks
            .iter()
            .rposition(|track| track.encoded_id == encoded_id)?;
        self.tracks.remove(index)
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    /// Randomly permute the remaining tracks
    pub fn shuffle(&mut self) {
        self.tracks.make_contiguous().shuffle(&mut rand::rng());
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.tracks.iter().cloned().collect()
    }

    /// Remember a track that finished or was skipped
    pub fn record_history(&mut self, track: Track) {
        self.history.push_front(track);
        self.history.truncate(MAX_HISTORY);
    }

    /// Take the most recently played track out of the history
    pub fn pop_history(&mut self) -> Option<Track> {
        self.history.pop_front()
    }

    pub fn history(&self) -> Vec<Track> {
        self.history.iter().cloned().collect()
    }

    pub fn has_history(&self) -> bool {
        !self.history.is_empty()
    }
}
