//! Pauses and/or leaves a session once nobody else is listening, after the
//! delays stored in its `alone_pause` / `alone_dc` settings.

use std::sync::Arc;
use tracing::{info, warn};

use super::SessionId;
use super::event_handlers::DisconnectReason;
use super::music_manager::{MusicManager, MusicResult, SessionTask};

pub struct AloneManager {
    manager: Arc<MusicManager>,
}

impl AloneManager {
    pub fn new(manager: Arc<MusicManager>) -> Arc<Self> {
        Arc::new(Self { manager })
    }

    /// Report how many listeners (besides the player) are in the channel.
    ///
    /// With nobody left, pending alone timers are started; when someone
    /// comes back they are cancelled and an alone-pause is undone.
    pub async fn update_listener_count(
        self: &Arc<Self>,
        session_id: SessionId,
        listeners: usize,
    ) -> MusicResult<()> {
        if listeners > 0 {
            return self.listener_returned(session_id).await;
        }

        let settings = self.manager.session_settings(session_id).await?;

        if settings.alone_pause.enabled
            && !self
                .manager
                .has_session_task(session_id, SessionTask::AlonePause)
                .await
        {
            info!(
                "Session {} is alone, pausing in {:?}",
                session_id, settings.alone_pause.time
            );
            let alone = Arc::clone(self);
            let delay = settings.alone_pause.time;
            self.manager
                .spawn_session_task(session_id, SessionTask::AlonePause, async move {
                    tokio::time::sleep(delay).await;
                    alone.pause_for_alone(session_id).await;
                })
                .await?;
        }

        if settings.alone_dc.enabled
            && !self
                .manager
                .has_session_task(session_id, SessionTask::AloneDisconnect)
                .await
        {
            info!(
                "Session {} is alone, disconnecting in {:?}",
                session_id, settings.alone_dc.time
            );
            let manager = Arc::clone(&self.manager);
            let delay = settings.alone_dc.time;
            self.manager
                .spawn_session_task(session_id, SessionTask::AloneDisconnect, async move {
                    tokio::time::sleep(delay).await;
                    // Disconnecting aborts the session's tasks, this one included.
                    manager
                        .detach_session_task(session_id, SessionTask::AloneDisconnect)
                        .await;
                    if let Err(e) = manager
                        .disconnect_with(session_id, DisconnectReason::AloneTimeout)
                        .await
                    {
                        warn!("Alone disconnect of session {} failed: {}", session_id, e);
                    }
                })
                .await?;
        }

        Ok(())
    }

    async fn listener_returned(&self, session_id: SessionId) -> MusicResult<()> {
        self.manager
            .cancel_session_task(session_id, SessionTask::AlonePause)
            .await;
        self.manager
            .cancel_session_task(session_id, SessionTask::AloneDisconnect)
            .await;

        let session = self.manager.session(session_id)?;
        let paused_by_alone = session.lock().await.paused_by_alone;
        if paused_by_alone {
            info!("Listener returned to session {}, resuming", session_id);
            self.manager.resume(session_id).await?;
        }
        Ok(())
    }

    async fn pause_for_alone(&self, session_id: SessionId) {
        let Ok(session) = self.manager.session(session_id) else {
            return;
        };
        if !session.lock().await.state.is_playing() {
            return;
        }
        match self.manager.pause(session_id).await {
            Ok(()) => {
                info!("Paused session {} because it was alone", session_id);
                session.lock().await.paused_by_alone = true;
            }
            Err(e) => warn!("Alone pause of session {} failed: {}", session_id, e),
        }
    }
}
