use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::SessionId;
use super::event_handlers::PlayerEvent;
use super::music_manager::{MusicManager, MusicResult};
use crate::music::audio_sources::Provider;
use crate::music::audio_sources::query::Query;
use crate::music::audio_sources::track_metadata::Track;

/// Requester name attached to tracks picked by autoplay
pub const AUTOPLAY_REQUESTER: &str = "Autoplay";

/// Keeps music going when the queue runs out, for sessions that asked for it
pub struct AutoplayManager {
    manager: Arc<MusicManager>,
    provider: Provider,
}

impl AutoplayManager {
    pub fn new(manager: Arc<MusicManager>, provider: Provider) -> Arc<Self> {
        Arc::new(Self { manager, provider })
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.manager.subscribe();
        let autoplay = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => autoplay.handle_event(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Autoplay missed {} player events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn handle_event(&self, event: &PlayerEvent) {
        if let PlayerEvent::QueueEnd {
            session_id,
            last_track: Some(last_track),
        } = event
        {
            if let Err(e) = self.attempt_autoplay(*session_id, last_track).await {
                error!("Autoplay failed for session {}: {}", session_id, e);
            }
        }
    }

    /// Queue and start a track related to `last_track` if autoplay is on.
    pub async fn attempt_autoplay(
        &self,
        session_id: SessionId,
        last_track: &Track,
    ) -> MusicResult<Option<Track>> {
        if !self.manager.is_auto_play_enabled(session_id).await {
            debug!("Autoplay is off for session {}", session_id);
            return Ok(None);
        }

        let query = Query::search(self.provider, &last_track.author)?;
        let candidates = self.manager.resolver().resolve_one(&query).await?;
        let recent = self.manager.history(session_id).await?;
        let already_played = |track: &Track| {
            track.identifier == last_track.identifier
                || recent
                    .iter()
                    .chain([last_track])
                    .any(|played| played.encoded_id == track.encoded_id)
        };
        let Some(next) = candidates.into_iter().find(|track| !already_played(track)) else {
            info!(
                "No related tracks found for '{}' in session {}",
                last_track.title, session_id
            );
            return Ok(None);
        };

        let next = next.with_requester(Some(AUTOPLAY_REQUESTER));
        info!(
            "Autoplay queued '{}' by {} for session {}",
            next.title, next.author, session_id
        );
        self.manager.add(session_id, next, None).await?;
        self.manager
            .next(session_id, Some(AUTOPLAY_REQUESTER))
            .await
    }
}
