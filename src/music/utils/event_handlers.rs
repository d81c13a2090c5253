use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::SessionId;
use super::music_manager::{MusicManager, MusicResult};
use super::queue_manager::RepeatMode;
use crate::music::audio_sources::Feature;
use crate::music::audio_sources::track_metadata::Track;

/// Why a node ended a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Only a natural end moves the queue along; the other reasons come
    /// from an action that already picked what plays next.
    pub fn may_start_next(self) -> bool {
        self == TrackEndReason::Finished
    }
}

/// Events a node reports about a session's player
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    TrackEnd {
        encoded_id: String,
        reason: TrackEndReason,
    },
    TrackStuck {
        encoded_id: String,
        threshold_ms: u64,
    },
    TrackException {
        encoded_id: String,
        message: String,
    },
    PlayerUpdate {
        position_ms: u64,
    },
    WebSocketClosed {
        code: u16,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    SocketClosed,
    AloneTimeout,
}

/// Events the player emits for subscribers (lyrics, autoplay, UI)
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Connected {
        session_id: SessionId,
        channel_id: u64,
    },
    TrackStarted {
        session_id: SessionId,
        track: Track,
    },
    TrackEnded {
        session_id: SessionId,
        track: Track,
        reason: TrackEndReason,
    },
    TrackError {
        session_id: SessionId,
        track: Track,
        message: String,
    },
    QueueEnd {
        session_id: SessionId,
        last_track: Option<Track>,
    },
    Paused {
        session_id: SessionId,
    },
    Resumed {
        session_id: SessionId,
    },
    Stopped {
        session_id: SessionId,
    },
    NodeHealthLost {
        node: String,
    },
    NodeReassigned {
        session_id: SessionId,
        from: String,
        to: String,
    },
    Disconnected {
        session_id: SessionId,
        reason: DisconnectReason,
    },
}

impl PlayerEvent {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            PlayerEvent::Connected { session_id, .. }
            | PlayerEvent::TrackStarted { session_id, .. }
            | PlayerEvent::TrackEnded { session_id, .. }
            | PlayerEvent::TrackError { session_id, .. }
            | PlayerEvent::QueueEnd { session_id, .. }
            | PlayerEvent::Paused { session_id }
            | PlayerEvent::Resumed { session_id }
            | PlayerEvent::Stopped { session_id }
            | PlayerEvent::NodeReassigned { session_id, .. }
            | PlayerEvent::Disconnected { session_id, .. } => Some(*session_id),
            PlayerEvent::NodeHealthLost { .. } => None,
        }
    }
}

impl MusicManager {
    /// Feed an event reported by a session's node into its player.
    ///
    /// Playback errors become `TrackError` events and the queue moves on;
    /// a closed voice socket ends the session.
    pub async fn handle_node_event(&self, session_id: SessionId, event: NodeEvent) -> MusicResult<()> {
        let session = self.session(session_id)?;

        match event {
            NodeEvent::PlayerUpdate { position_ms } => {
                session.lock().await.clock.sync(position_ms);
                Ok(())
            }
            NodeEvent::TrackEnd { encoded_id, reason } => {
                let (track, repeat_mode) = {
                    let guard = session.lock().await;
                    match &guard.current {
                        Some(current) if current.encoded_id == encoded_id => {
                            (current.clone(), guard.repeat_mode)
                        }
                        _ => {
                            info!("Ignoring stale track end in session {}", session_id);
                            return Ok(());
                        }
                    }
                };

                info!(
                    "Track '{}' ended in session {} ({:?})",
                    track.title, session_id, reason
                );
                self.emit(PlayerEvent::TrackEnded {
                    session_id,
                    track,
                    reason,
                });
                if !reason.may_start_next() {
                    return Ok(());
                }

                match repeat_mode {
                    RepeatMode::Track => self.replay(session_id).await.map(|_| ()),
                    RepeatMode::Queue => self.advance(session_id, None, true).await.map(|_| ()),
                    RepeatMode::Off => self.advance(session_id, None, false).await.map(|_| ()),
                }
            }
            NodeEvent::TrackStuck {
                encoded_id,
                threshold_ms,
            } => {
                self.handle_track_error(
                    session_id,
                    &encoded_id,
                    format!("Track got stuck for {}ms", threshold_ms),
                )
                .await
            }
            NodeEvent::TrackException {
                encoded_id,
                message,
            } => {
                self.handle_track_error(session_id, &encoded_id, message)
                    .await
            }
            NodeEvent::WebSocketClosed { code, reason } => {
                warn!(
                    "Voice socket closed for session {} ({}: {})",
                    session_id, code, reason
                );
                self.disconnect_with(session_id, DisconnectReason::SocketClosed)
                    .await
            }
        }
    }

    /// A failing track is reported, then skipped. Under track repeat it goes
    /// to the tail instead of replaying forever.
    async fn handle_track_error(
        &self,
        session_id: SessionId,
        encoded_id: &str,
        message: String,
    ) -> MusicResult<()> {
        let session = self.session(session_id)?;
        let (track, repeat_mode) = {
            let guard = session.lock().await;
            match &guard.current {
                Some(current) if current.encoded_id == encoded_id => {
                    (current.clone(), guard.repeat_mode)
                }
                _ => return Ok(()),
            }
        };

        error!(
            "Playback error for '{}' in session {}: {}",
            track.title, session_id, message
        );
        self.emit(PlayerEvent::TrackError {
            session_id,
            track,
            message,
        });

        let requeue = repeat_mode != RepeatMode::Off;
        self.advance(session_id, None, requeue).await.map(|_| ())
    }

    /// Move every playing session off a node that went unhealthy.
    ///
    /// Sessions for which no other node is available stay connected; their
    /// next playback action fails with `NoAvailableNode`.
    pub async fn handle_node_health_lost(&self, node: &str) {
        warn!("Node {} lost health, re-selecting for its sessions", node);
        self.emit(PlayerEvent::NodeHealthLost {
            node: node.to_string(),
        });

        for session_id in self.node_pool().sessions_on(node) {
            let Ok(session) = self.session(session_id) else {
                continue;
            };
            let playing = {
                let guard = session.lock().await;
                guard.state.is_connected() && guard.current.is_some()
            };
            if !playing {
                continue;
            }
            if let Err(e) = self
                .playback_node(&session, session_id, Feature::Playback)
                .await
            {
                warn!("Session {} could not fail over: {}", session_id, e);
            }
        }
    }

    /// React to node health changes until the pool goes away.
    pub fn spawn_node_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut health = self.node_pool().subscribe_health();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match health.recv().await {
                    Ok(node) => manager.handle_node_health_lost(&node).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Node watcher missed {} health updates", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
