use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::SessionId;
use super::effects::{Equalizer, EffectsState};
use super::event_handlers::{DisconnectReason, PlayerEvent};
use super::node_client::{PlayerUpdate, TrackUpdate};
use super::node_pool::{Node, NodePool};
use super::queue_manager::{RepeatMode, TrackQueue};
use super::track_cache::TrackCache;
use crate::music::audio_sources::Feature;
use crate::music::audio_sources::query::Query;
use crate::music::audio_sources::resolver::{ProviderResolver, ResolveOutcome};
use crate::music::audio_sources::track_metadata::Track;
use crate::utils::database::{AloneSetting, SessionSettings};

/// Errors that can occur during music operations
#[derive(Error, Debug)]
pub enum MusicError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("No playback node is available right now, try again later")]
    NoAvailableNode,

    #[error("{0}")]
    ResolveFailure(String),

    #[error("The node refused the connection: {0}")]
    ConnectionDenied(String),

    #[error("Failed to apply effects: {0}")]
    EffectApplyError(String),

    #[error("No lyrics were found for {0}")]
    NoLyricsFound(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Lost connection to node {0}")]
    NodeHealthLost(String),

    #[error("Not connected to a voice channel")]
    NotConnected,

    #[error("Nothing is playing")]
    NothingPlaying,

    #[error("Node request failed: {0}")]
    NodeRequest(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid track id: {0}")]
    TrackDecode(String),

    #[error("Node {0} is already registered")]
    DuplicateNode(String),

    #[error("Unknown node {0}")]
    UnknownNode(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

/// Result type for music operations
pub type MusicResult<T> = Result<T, MusicError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Playing,
    Paused,
    Buffering,
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerState {
    #[default]
    Idle,
    Connecting,
    Connected(PlaybackStatus),
    /// Terminal; a new `connect` reclaims the session.
    Disconnected,
}

impl PlayerState {
    pub fn is_connected(self) -> bool {
        matches!(self, PlayerState::Connected(_))
    }

    pub fn is_playing(self) -> bool {
        matches!(
            self,
            PlayerState::Connected(PlaybackStatus::Playing | PlaybackStatus::Buffering)
        )
    }
}

/// Extrapolates the playback position between node position updates.
#[derive(Debug, Clone, Copy)]
pub struct PositionClock {
    anchor_ms: u64,
    anchored_at: Instant,
    running: bool,
}

impl Default for PositionClock {
    fn default() -> Self {
        Self {
            anchor_ms: 0,
            anchored_at: Instant::now(),
            running: false,
        }
    }
}

impl PositionClock {
    /// Current position, advancing `rate` ms of track time per wall ms.
    pub fn position_ms(&self, rate: f64) -> u64 {
        if !self.running {
            return self.anchor_ms;
        }
        let elapsed = self.anchored_at.elapsed().as_millis() as f64 * rate;
        self.anchor_ms.saturating_add(elapsed.max(0.0).round() as u64)
    }

    pub fn start(&mut self, position_ms: u64) {
        self.anchor_ms = position_ms;
        self.anchored_at = Instant::now();
        self.running = true;
    }

    pub fn pause(&mut self, rate: f64) {
        self.anchor_ms = self.position_ms(rate);
        self.running = false;
    }

    pub fn resume(&mut self) {
        self.anchored_at = Instant::now();
        self.running = true;
    }

    /// Re-anchors on a known position without changing the running state.
    pub fn sync(&mut self, position_ms: u64) {
        self.anchor_ms = position_ms;
        self.anchored_at = Instant::now();
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Keys of the background tasks a session owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionTask {
    Lyrics,
    AlonePause,
    AloneDisconnect,
    BulkResolve(u64),
}

/// Where the current track went when `skip` requeued it under queue repeat
enum Requeued {
    /// Appended behind other tracks
    Appended,
    /// The queue was empty, so it came straight back as the next track
    Consumed,
}

/// Per-connection playback context
pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) state: PlayerState,
    pub(crate) queue: TrackQueue,
    pub(crate) current: Option<Track>,
    pub(crate) clock: PositionClock,
    pub(crate) effects: EffectsState,
    pub(crate) volume: u16,
    pub(crate) repeat_mode: RepeatMode,
    pub(crate) auto_play: bool,
    pub(crate) alone_pause: AloneSetting,
    pub(crate) alone_dc: AloneSetting,
    // Set when the alone timer paused playback, so a returning listener resumes it
    pub(crate) paused_by_alone: bool,
    pub(crate) channel_id: Option<u64>,
    pub(crate) connected_node: Option<String>,
    tasks: HashMap<SessionTask, JoinHandle<()>>,
    // Bumped on every change of `current`, to detect stale rollbacks
    generation: u64,
}

impl Session {
    fn new(id: SessionId) -> Self {
        let defaults = SessionSettings::default();
        Self {
            id,
            state: PlayerState::Idle,
            queue: TrackQueue::new(),
            current: None,
            clock: PositionClock::default(),
            effects: EffectsState::default(),
            volume: defaults.volume,
            repeat_mode: defaults.repeat_mode,
            auto_play: defaults.auto_play,
            alone_pause: defaults.alone_pause,
            alone_dc: defaults.alone_dc,
            paused_by_alone: false,
            channel_id: None,
            connected_node: None,
            tasks: HashMap::new(),
            generation: 0,
        }
    }

    pub(crate) fn ensure_connected(&self) -> MusicResult<()> {
        if self.state.is_connected() {
            Ok(())
        } else {
            Err(MusicError::NotConnected)
        }
    }

    pub(crate) fn position_ms(&self) -> u64 {
        self.clock.position_ms(self.effects.playback_rate)
    }

    fn abort_tasks(&mut self) {
        for (key, task) in self.tasks.drain() {
            debug!("Aborting {:?} task for session {}", key, self.id);
            task.abort();
        }
    }
}

/// Owns every session and drives their playback on the node pool
pub struct MusicManager {
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
    // Held across a node-bound command so the node sees commands in commit order
    commands: DashMap<SessionId, Arc<Mutex<()>>>,
    node_pool: Arc<NodePool>,
    resolver: ProviderResolver,
    events: broadcast::Sender<PlayerEvent>,
    bulk_counter: AtomicU64,
}

impl MusicManager {
    pub fn new(node_pool: Arc<NodePool>, cache: Arc<TrackCache>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            sessions: DashMap::new(),
            commands: DashMap::new(),
            resolver: ProviderResolver::new(Arc::clone(&node_pool), cache),
            node_pool,
            events,
            bulk_counter: AtomicU64::new(0),
        })
    }

    pub fn node_pool(&self) -> &Arc<NodePool> {
        &self.node_pool
    }

    pub fn resolver(&self) -> &ProviderResolver {
        &self.resolver
    }

    /// Subscribe to player events (track started, queue end, ...)
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: PlayerEvent) {
        debug!("Player event: {:?}", event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn session(&self, session_id: SessionId) -> MusicResult<Arc<Mutex<Session>>> {
        self.sessions
            .get(&session_id)
            .map(|session| Arc::clone(&session))
            .ok_or(MusicError::NotConnected)
    }

    /// Exclusive right to send state-changing commands for a session.
    pub(crate) async fn command_lock(&self, session_id: SessionId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(&self.commands.entry(session_id).or_default());
        lock.lock_owned().await
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Join a voice channel: Idle -> Connecting -> Connected(Paused)
    pub async fn connect(&self, session_id: SessionId, channel_id: u64) -> MusicResult<()> {
        let session = Arc::clone(
            &self
                .sessions
                .entry(session_id)
                .or_insert_with(|| Arc::new(Mutex::new(Session::new(session_id)))),
        );

        {
            let mut guard = session.lock().await;
            match guard.state {
                PlayerState::Connecting | PlayerState::Connected(_) => {
                    info!("Session {} is already connected", session_id);
                    return Ok(());
                }
                PlayerState::Disconnected => {
                    // Keep the generation moving so in-flight commands of the
                    // old session never match the new one.
                    let generation = guard.generation + 1;
                    *guard = Session::new(session_id);
                    guard.generation = generation;
                }
                PlayerState::Idle => {}
            }
            guard.state = PlayerState::Connecting;
            guard.channel_id = Some(channel_id);
        }

        let result = match self.node_pool.session_node(session_id, Feature::Playback) {
            Ok(node) => node
                .client()
                .update_player(session_id, &PlayerUpdate::connect(channel_id))
                .await
                .map(|_| node)
                .map_err(|e| MusicError::ConnectionDenied(e.to_string())),
            Err(e) => Err(e),
        };

        let mut guard = session.lock().await;
        match result {
            Ok(node) => {
                info!(
                    "Session {} connected to channel {} on node {}",
                    session_id, channel_id, node.identifier
                );
                guard.state = PlayerState::Connected(PlaybackStatus::Paused);
                guard.connected_node = Some(node.identifier);
                drop(guard);
                self.emit(PlayerEvent::Connected {
                    session_id,
                    channel_id,
                });
                Ok(())
            }
            Err(e) => {
                warn!("Failed to connect session {}: {}", session_id, e);
                guard.state = PlayerState::Idle;
                guard.channel_id = None;
                drop(guard);
                self.node_pool.unpin(session_id);
                Err(e)
            }
        }
    }

    /// The node a playback action should go to.
    ///
    /// When the session's node changed since its last action (health loss,
    /// removal), the session is reconnected on the new node and the current
    /// track resumes at its last known position.
    pub(crate) async fn playback_node(
        &self,
        session: &Arc<Mutex<Session>>,
        session_id: SessionId,
        feature: Feature,
    ) -> MusicResult<Node> {
        let node = self.node_pool.session_node(session_id, feature)?;

        let (previous, update) = {
            let mut guard = session.lock().await;
            if guard.connected_node.as_deref() == Some(node.identifier.as_str()) {
                return Ok(node);
            }
            let channel_id = guard.channel_id.ok_or(MusicError::NotConnected)?;
            let previous = guard.connected_node.replace(node.identifier.clone());

            let mut update = PlayerUpdate::connect(channel_id);
            update.volume = Some(guard.volume);
            update.filters = Some(guard.effects.to_filters());
            if let Some(track) = &guard.current {
                update.track = Some(TrackUpdate {
                    encoded: Some(track.encoded_id.clone()),
                });
                update.position = Some(guard.position_ms());
                update.paused = Some(!guard.state.is_playing());
            }
            (previous, update)
        };

        let Some(previous) = previous else {
            return Ok(node);
        };

        info!(
            "Moving session {} from node {} to node {}",
            session_id, previous, node.identifier
        );
        if let Err(e) = node.client().update_player(session_id, &update).await {
            error!(
                "Failed to move session {} to node {}: {}",
                session_id, node.identifier, e
            );
            session.lock().await.connected_node = Some(previous);
            return Err(e);
        }

        self.emit(PlayerEvent::NodeReassigned {
            session_id,
            from: previous,
            to: node.identifier.clone(),
        });
        Ok(node)
    }

    /// Add a track at the tail or at `index`; returns its position
    pub async fn add(
        &self,
        session_id: SessionId,
        track: Track,
        index: Option<usize>,
    ) -> MusicResult<usize> {
        let session = self.session(session_id)?;
        let mut guard = session.lock().await;
        guard.ensure_connected()?;
        let position = guard.queue.add(track, index);
        debug!("Added track at {} in session {}", position, session_id);
        Ok(position)
    }

    /// Add a batch of tracks in one queue mutation
    pub async fn bulk_add(
        &self,
        session_id: SessionId,
        tracks: Vec<Track>,
        index: Option<usize>,
    ) -> MusicResult<usize> {
        let session = self.session(session_id)?;
        let mut guard = session.lock().await;
        guard.ensure_connected()?;
        let count = tracks.len();
        let position = guard.queue.bulk_add(tracks, index);
        debug!(
            "Added {} tracks at {} in session {}",
            count, position, session_id
        );
        Ok(position)
    }

    /// Start the next track from the queue.
    ///
    /// Returns the started track, or `None` when the queue was empty, in
    /// which case the session pauses and a `QueueEnd` event is emitted.
    pub async fn next(
        &self,
        session_id: SessionId,
        requester: Option<&str>,
    ) -> MusicResult<Option<Track>> {
        self.advance(session_id, requester, false).await
    }

    /// Skip the current track; under queue repeat it goes back to the tail
    pub async fn skip(
        &self,
        session_id: SessionId,
        requester: Option<&str>,
    ) -> MusicResult<Option<Track>> {
        let session = self.session(session_id)?;
        let requeue = session.lock().await.repeat_mode == RepeatMode::Queue;
        self.advance(session_id, requester, requeue).await
    }

    pub(crate) async fn advance(
        &self,
        session_id: SessionId,
        requester: Option<&str>,
        requeue_current: bool,
    ) -> MusicResult<Option<Track>> {
        let session = self.session(session_id)?;
        let _commands = self.command_lock(session_id).await;
        let node = self
            .playback_node(&session, session_id, Feature::Playback)
            .await?;

        let (track, previous, previous_state, requeued, generation) = {
            let mut guard = session.lock().await;
            guard.ensure_connected()?;

            let requeued = match guard.current.clone() {
                Some(current) if requeue_current => {
                    let consumed = guard.queue.is_empty();
                    guard.queue.add(current, None);
                    Some(if consumed {
                        Requeued::Consumed
                    } else {
                        Requeued::Appended
                    })
                }
                _ => None,
            };

            let Some(track) = guard.queue.next() else {
                let last_track = guard.current.take();
                if let Some(last) = &last_track {
                    guard.queue.record_history(last.clone());
                }
                guard.state = PlayerState::Connected(PlaybackStatus::Paused);
                guard.clock.reset();
                guard.generation += 1;
                drop(guard);

                info!("Queue ended for session {}", session_id);
                if last_track.is_some() {
                    if let Err(e) = node
                        .client()
                        .update_player(session_id, &PlayerUpdate::stop())
                        .await
                    {
                        warn!("Failed to stop player for session {}: {}", session_id, e);
                    }
                }
                self.emit(PlayerEvent::QueueEnd {
                    session_id,
                    last_track,
                });
                return Ok(None);
            };

            let previous = guard.current.replace(track.clone());
            let previous_state = guard.state;
            guard.state = PlayerState::Connected(PlaybackStatus::Buffering);
            guard.generation += 1;
            (track, previous, previous_state, requeued, guard.generation)
        };

        info!(
            "Starting '{}' in session {} (requested by {})",
            track.title,
            session_id,
            requester.unwrap_or("queue")
        );

        if let Err(e) = node
            .client()
            .update_player(session_id, &PlayerUpdate::play(&track, 0))
            .await
        {
            error!("Failed to start '{}' in session {}: {}", track.title, session_id, e);
            let mut guard = session.lock().await;
            if guard.generation != generation {
                // Stopped or disconnected meanwhile; the queue was cleared.
                return Err(e);
            }
            match (&requeued, &previous) {
                // The requeued current track was popped straight back out.
                (Some(Requeued::Consumed), _) => {}
                (Some(Requeued::Appended), Some(previous)) => {
                    guard.queue.remove_last_matching(&previous.encoded_id);
                    guard.queue.push_front(track);
                }
                _ => guard.queue.push_front(track),
            }
            guard.current = previous;
            guard.state = previous_state;
            return Err(e);
        }

        {
            let mut guard = session.lock().await;
            if guard.generation == generation {
                guard.state = PlayerState::Connected(PlaybackStatus::Playing);
                guard.clock.start(0);
            }
            if let Some(previous) = previous {
                guard.queue.record_history(previous);
            }
        }

        self.emit(PlayerEvent::TrackStarted {
            session_id,
            track: track.clone(),
        });
        Ok(Some(track))
    }

    /// Restart the current track from the beginning
    pub async fn replay(&self, session_id: SessionId) -> MusicResult<Option<Track>> {
        let session = self.session(session_id)?;
        let commands = self.command_lock(session_id).await;
        let Some(track) = session.lock().await.current.clone() else {
            drop(commands);
            return self.next(session_id, None).await;
        };
        let node = self
            .playback_node(&session, session_id, Feature::Playback)
            .await?;

        node.client()
            .update_player(session_id, &PlayerUpdate::play(&track, 0))
            .await?;

        {
            let mut guard = session.lock().await;
            guard.state = PlayerState::Connected(PlaybackStatus::Playing);
            guard.clock.start(0);
        }
        info!("Replaying '{}' in session {}", track.title, session_id);
        self.emit(PlayerEvent::TrackStarted {
            session_id,
            track: track.clone(),
        });
        Ok(Some(track))
    }

    /// Go back to the most recently played track. The current track returns
    /// to the head of the queue.
    pub async fn previous(&self, session_id: SessionId) -> MusicResult<Option<Track>> {
        let session = self.session(session_id)?;
        let _commands = self.command_lock(session_id).await;
        let node = self
            .playback_node(&session, session_id, Feature::Playback)
            .await?;

        let (track, displaced, previous_state) = {
            let mut guard = session.lock().await;
            guard.ensure_connected()?;
            let Some(track) = guard.queue.pop_history() else {
                return Ok(None);
            };
            let displaced = guard.current.replace(track.clone());
            if let Some(displaced) = &displaced {
                guard.queue.push_front(displaced.clone());
            }
            let previous_state = guard.state;
            guard.state = PlayerState::Connected(PlaybackStatus::Buffering);
            guard.generation += 1;
            (track, displaced, previous_state)
        };

        if let Err(e) = node
            .client()
            .update_player(session_id, &PlayerUpdate::play(&track, 0))
            .await
        {
            let mut guard = session.lock().await;
            if displaced.is_some() {
                guard.queue.next();
            }
            guard.current = displaced;
            guard.state = previous_state;
            guard.queue.record_history(track);
            return Err(e);
        }

        {
            let mut guard = session.lock().await;
            guard.state = PlayerState::Connected(PlaybackStatus::Playing);
            guard.clock.start(0);
        }
        self.emit(PlayerEvent::TrackStarted {
            session_id,
            track: track.clone(),
        });
        Ok(Some(track))
    }

    pub async fn pause(&self, session_id: SessionId) -> MusicResult<()> {
        let session = self.session(session_id)?;
        let _commands = self.command_lock(session_id).await;
        if !session.lock().await.state.is_playing() {
            return Ok(());
        }
        let node = self
            .playback_node(&session, session_id, Feature::Playback)
            .await?;
        node.client()
            .update_player(session_id, &PlayerUpdate::paused(true))
            .await?;

        let mut guard = session.lock().await;
        let rate = guard.effects.playback_rate;
        guard.clock.pause(rate);
        guard.state = PlayerState::Connected(PlaybackStatus::Paused);
        drop(guard);

        info!("Paused session {}", session_id);
        self.emit(PlayerEvent::Paused { session_id });
        Ok(())
    }

    /// Resume playback; with nothing current this starts the queue.
    pub async fn resume(&self, session_id: SessionId) -> MusicResult<()> {
        let session = self.session(session_id)?;
        let commands = self.command_lock(session_id).await;
        {
            let guard = session.lock().await;
            guard.ensure_connected()?;
            if guard.current.is_none() {
                drop(guard);
                drop(commands);
                return self.next(session_id, None).await.map(|_| ());
            }
            if guard.state.is_playing() {
                return Ok(());
            }
        }

        let node = self
            .playback_node(&session, session_id, Feature::Playback)
            .await?;
        node.client()
            .update_player(session_id, &PlayerUpdate::paused(false))
            .await?;

        let mut guard = session.lock().await;
        guard.clock.resume();
        guard.state = PlayerState::Connected(PlaybackStatus::Playing);
        guard.paused_by_alone = false;
        drop(guard);

        info!("Resumed session {}", session_id);
        self.emit(PlayerEvent::Resumed { session_id });
        Ok(())
    }

    /// Stop playback and clear the queue; the session stays connected.
    pub async fn stop(&self, session_id: SessionId) -> MusicResult<()> {
        let session = self.session(session_id)?;
        let _commands = self.command_lock(session_id).await;
        session.lock().await.ensure_connected()?;
        let node = self
            .playback_node(&session, session_id, Feature::Playback)
            .await?;
        node.client()
            .update_player(session_id, &PlayerUpdate::stop())
            .await?;

        let mut guard = session.lock().await;
        guard.queue.clear();
        if let Some(track) = guard.current.take() {
            guard.queue.record_history(track);
        }
        guard.clock.reset();
        guard.state = PlayerState::Connected(PlaybackStatus::Paused);
        guard.generation += 1;
        if let Some(task) = guard.tasks.remove(&SessionTask::Lyrics) {
            task.abort();
        }
        drop(guard);

        info!("Stopped session {}", session_id);
        self.emit(PlayerEvent::Stopped { session_id });
        Ok(())
    }

    /// Leave the voice channel, tearing down everything the session owns.
    pub async fn disconnect(&self, session_id: SessionId) -> MusicResult<()> {
        self.disconnect_with(session_id, DisconnectReason::Requested)
            .await
    }

    pub(crate) async fn disconnect_with(
        &self,
        session_id: SessionId,
        reason: DisconnectReason,
    ) -> MusicResult<()> {
        let session = self.session(session_id)?;
        let node = {
            let mut guard = session.lock().await;
            if guard.state == PlayerState::Disconnected {
                return Ok(());
            }
            guard.abort_tasks();
            guard.state = PlayerState::Disconnected;
            guard.queue.clear();
            guard.current = None;
            guard.clock.reset();
            guard.connected_node = None;
            guard.paused_by_alone = false;
            guard.generation += 1;
            self.node_pool.get_node(session_id)
        };
        self.node_pool.unpin(session_id);

        if let Some(node) = node {
            if let Err(e) = node.client().destroy_player(session_id).await {
                warn!(
                    "Failed to destroy player for session {} on node {}: {}",
                    session_id, node.identifier, e
                );
            }
        }

        info!("Disconnected session {} ({:?})", session_id, reason);
        self.emit(PlayerEvent::Disconnected { session_id, reason });
        Ok(())
    }

    /// Shuffle the not-yet-played tracks
    pub async fn shuffle(&self, session_id: SessionId) -> MusicResult<()> {
        let session = self.session(session_id)?;
        let mut guard = session.lock().await;
        guard.ensure_connected()?;
        guard.queue.shuffle();
        Ok(())
    }

    pub async fn remove(&self, session_id: SessionId, index: usize) -> MusicResult<Option<Track>> {
        let session = self.session(session_id)?;
        let mut guard = session.lock().await;
        guard.ensure_connected()?;
        Ok(guard.queue.remove(index))
    }

    pub async fn clear(&self, session_id: SessionId) -> MusicResult<()> {
        let session = self.session(session_id)?;
        let mut guard = session.lock().await;
        guard.ensure_connected()?;
        guard.queue.clear();
        Ok(())
    }

    pub async fn queue(&self, session_id: SessionId) -> MusicResult<Vec<Track>> {
        let session = self.session(session_id)?;
        let tracks = session.lock().await.queue.tracks();
        Ok(tracks)
    }

    pub async fn history(&self, session_id: SessionId) -> MusicResult<Vec<Track>> {
        let session = self.session(session_id)?;
        let tracks = session.lock().await.queue.history();
        Ok(tracks)
    }

    pub async fn current(&self, session_id: SessionId) -> Option<Track> {
        let session = self.session(session_id).ok()?;
        let current = session.lock().await.current.clone();
        current
    }

    /// State of a session; unknown sessions are idle.
    pub async fn state(&self, session_id: SessionId) -> PlayerState {
        match self.session(session_id) {
            Ok(session) => session.lock().await.state,
            Err(_) => PlayerState::Idle,
        }
    }

    pub async fn position_ms(&self, session_id: SessionId) -> u64 {
        match self.session(session_id) {
            Ok(session) => session.lock().await.position_ms(),
            Err(_) => 0,
        }
    }

    pub async fn playback_rate(&self, session_id: SessionId) -> f64 {
        match self.session(session_id) {
            Ok(session) => session.lock().await.effects.playback_rate,
            Err(_) => 1.0,
        }
    }

    pub async fn effects(&self, session_id: SessionId) -> MusicResult<EffectsState> {
        let session = self.session(session_id)?;
        let effects = session.lock().await.effects.clone();
        Ok(effects)
    }

    /// Seek within the current track; the position is clamped to its length.
    pub async fn seek(&self, session_id: SessionId, position_ms: u64) -> MusicResult<u64> {
        let session = self.session(session_id)?;
        let _commands = self.command_lock(session_id).await;
        let position_ms = {
            let guard = session.lock().await;
            let track = guard.current.as_ref().ok_or(MusicError::NothingPlaying)?;
            if track.is_stream {
                return Err(MusicError::InvalidQuery(
                    "Streams cannot be seeked".to_string(),
                ));
            }
            position_ms.min(track.duration_ms())
        };

        let node = self
            .playback_node(&session, session_id, Feature::Playback)
            .await?;
        node.client()
            .update_player(session_id, &PlayerUpdate::seek(position_ms))
            .await?;

        session.lock().await.clock.sync(position_ms);
        debug!("Seeked session {} to {}ms", session_id, position_ms);
        Ok(position_ms)
    }

    /// Set the volume (0 to 1000, clamped)
    pub async fn set_volume(&self, session_id: SessionId, volume: u16) -> MusicResult<u16> {
        let volume = volume.min(1000);
        let session = self.session(session_id)?;
        let _commands = self.command_lock(session_id).await;
        session.lock().await.ensure_connected()?;
        let node = self
            .playback_node(&session, session_id, Feature::Playback)
            .await?;
        node.client()
            .update_player(session_id, &PlayerUpdate::volume(volume))
            .await?;
        session.lock().await.volume = volume;
        Ok(volume)
    }

    pub async fn set_repeat_mode(&self, session_id: SessionId, mode: RepeatMode) -> MusicResult<()> {
        let session = self.session(session_id)?;
        session.lock().await.repeat_mode = mode;
        info!("Repeat mode for session {} set to {}", session_id, mode);
        Ok(())
    }

    pub async fn repeat_mode(&self, session_id: SessionId) -> RepeatMode {
        match self.session(session_id) {
            Ok(session) => session.lock().await.repeat_mode,
            Err(_) => RepeatMode::Off,
        }
    }

    pub async fn set_auto_play(&self, session_id: SessionId, enabled: bool) -> MusicResult<()> {
        let session = self.session(session_id)?;
        session.lock().await.auto_play = enabled;
        info!(
            "Autoplay {} for session {}",
            if enabled { "enabled" } else { "disabled" },
            session_id
        );
        Ok(())
    }

    pub async fn is_auto_play_enabled(&self, session_id: SessionId) -> bool {
        match self.session(session_id) {
            Ok(session) => session.lock().await.auto_play,
            Err(_) => false,
        }
    }

    /// Seed a freshly connected session from its persisted settings.
    ///
    /// Volume and equalizer are pushed to the node together; nothing is
    /// committed unless the node accepts them.
    pub async fn apply_settings(
        &self,
        session_id: SessionId,
        settings: &SessionSettings,
    ) -> MusicResult<()> {
        let session = self.session(session_id)?;
        let equalizer = match &settings.equalizer_preset {
            Some(preset) => Equalizer::from_preset(preset)?,
            None => Equalizer::default(),
        };
        let volume = settings.volume.min(1000);
        let _commands = self.command_lock(session_id).await;

        let effects = {
            let guard = session.lock().await;
            guard.ensure_connected()?;
            EffectsState {
                equalizer,
                playback_rate: guard.effects.playback_rate,
            }
        };

        let node = self
            .playback_node(&session, session_id, Feature::Playback)
            .await?;
        let mut update = PlayerUpdate::filters(&effects);
        update.volume = Some(volume);
        node.client().update_player(session_id, &update).await?;

        let mut guard = session.lock().await;
        guard.effects = effects;
        guard.volume = volume;
        guard.repeat_mode = settings.repeat_mode;
        guard.auto_play = settings.auto_play;
        guard.alone_pause = settings.alone_pause;
        guard.alone_dc = settings.alone_dc;
        info!("Applied stored settings to session {}", session_id);
        Ok(())
    }

    /// Snapshot of a session's persistable settings
    pub async fn session_settings(&self, session_id: SessionId) -> MusicResult<SessionSettings> {
        let session = self.session(session_id)?;
        let guard = session.lock().await;
        Ok(SessionSettings {
            equalizer_preset: guard.effects.equalizer.to_preset(),
            repeat_mode: guard.repeat_mode,
            auto_play: guard.auto_play,
            volume: guard.volume,
            alone_pause: guard.alone_pause,
            alone_dc: guard.alone_dc,
        })
    }

    /// Run a background task owned by the session. A task already running
    /// under the same key is aborted and replaced.
    pub async fn spawn_session_task<F>(
        &self,
        session_id: SessionId,
        key: SessionTask,
        task: F,
    ) -> MusicResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let session = self.session(session_id)?;
        let mut guard = session.lock().await;
        if guard.state == PlayerState::Disconnected {
            return Err(MusicError::NotConnected);
        }
        guard.tasks.retain(|_, handle| !handle.is_finished());
        let handle = tokio::spawn(task);
        if let Some(old) = guard.tasks.insert(key, handle) {
            debug!("Replacing {:?} task for session {}", key, session_id);
            old.abort();
        }
        Ok(())
    }

    /// Abort a session task; returns whether one was running.
    pub async fn cancel_session_task(&self, session_id: SessionId, key: SessionTask) -> bool {
        let Ok(session) = self.session(session_id) else {
            return false;
        };
        let task = session.lock().await.tasks.remove(&key);
        match task {
            Some(task) => {
                debug!("Cancelling {:?} task for session {}", key, session_id);
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Forget a task's handle without aborting it. A task calls this on
    /// itself before doing anything that would abort the session's tasks.
    pub(crate) async fn detach_session_task(&self, session_id: SessionId, key: SessionTask) {
        if let Ok(session) = self.session(session_id) {
            session.lock().await.tasks.remove(&key);
        }
    }

    pub async fn has_session_task(&self, session_id: SessionId, key: SessionTask) -> bool {
        match self.session(session_id) {
            Ok(session) => session
                .lock()
                .await
                .tasks
                .get(&key)
                .is_some_and(|task| !task.is_finished()),
            Err(_) => false,
        }
    }

    /// Resolve queries and add every resolved track to the queue in one
    /// mutation. Per-query failures come back in the outcome.
    pub async fn enqueue_queries(
        &self,
        session_id: SessionId,
        queries: &[Query],
        requester: Option<&str>,
        index: Option<usize>,
    ) -> MusicResult<ResolveOutcome> {
        self.session(session_id)?.lock().await.ensure_connected()?;
        let outcome = self.resolver.resolve(queries, requester).await;
        if !outcome.successful.is_empty() {
            self.bulk_add(session_id, outcome.successful.clone(), index)
                .await?;
        }
        info!(
            "Enqueued {} of {} tracks for session {} ({} failed queries)",
            outcome.successful.len(),
            outcome.total_count,
            session_id,
            outcome.failed.len()
        );
        Ok(outcome)
    }

    /// `enqueue_queries` as a session task; playback starts if nothing is
    /// current once the tracks are in.
    pub async fn spawn_enqueue_queries(
        self: &Arc<Self>,
        session_id: SessionId,
        queries: Vec<Query>,
        requester: Option<String>,
        index: Option<usize>,
    ) -> MusicResult<SessionTask> {
        let key = SessionTask::BulkResolve(self.bulk_counter.fetch_add(1, Ordering::Relaxed));
        let manager = Arc::clone(self);

        self.spawn_session_task(session_id, key, async move {
            match manager
                .enqueue_queries(session_id, &queries, requester.as_deref(), index)
                .await
            {
                Ok(outcome) => {
                    for failed in &outcome.failed {
                        warn!(
                            "Session {}: {}",
                            session_id,
                            failed.not_found_message()
                        );
                    }
                    if !outcome.successful.is_empty() && manager.current(session_id).await.is_none()
                    {
                        if let Err(e) = manager.next(session_id, requester.as_deref()).await {
                            warn!("Failed to start playback for session {}: {}", session_id, e);
                        }
                    }
                }
                Err(e) => warn!("Bulk enqueue for session {} failed: {}", session_id, e),
            }
            manager.detach_session_task(session_id, key).await;
        })
        .await?;

        Ok(key)
    }
}
