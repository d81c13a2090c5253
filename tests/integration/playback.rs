use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rusty_music::music::utils::alone_manager::AloneManager;
use rusty_music::music::utils::effects::{EffectsEngine, EqualizerPreset};
use rusty_music::music::utils::event_handlers::{DisconnectReason, NodeEvent, PlayerEvent, TrackEndReason};
use rusty_music::music::utils::music_manager::{PlaybackStatus, PlayerState};
use rusty_music::music::utils::node_client::NodeStats;
use rusty_music::music::utils::queue_manager::RepeatMode;
use rusty_music::music::utils::track_cache::TrackCache;
use rusty_music::utils::database::{AloneSetting, MemorySettingsStore, SessionSettings};
use rusty_music::{Feature, MusicError, MusicManager, NodePool, Provider, Track};

use crate::common::fixtures::{sample_track, sample_tracks};
use crate::common::mocks::FakeNode;
use crate::common::{SESSION, VOICE_CHANNEL, manager_with, register};
use crate::test_utils;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bulk_add_and_next_never_duplicate_or_lose_tracks() {
    test_utils::init();
    let manager = manager_with(Arc::new(FakeNode::new()), Vec::new());
    manager.connect(SESSION, VOICE_CHANNEL).await.unwrap();

    let callers: Vec<_> = [0..10, 10..20]
        .into_iter()
        .map(|range| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager.bulk_add(SESSION, sample_tracks(range), None).await?;
                manager.next(SESSION, Some("caller")).await
            })
        })
        .collect();
    for caller in callers {
        let started = caller.await.unwrap().unwrap();
        assert!(started.is_some());
    }

    let current = manager.current(SESSION).await.unwrap();
    let history = manager.history(SESSION).await.unwrap();
    let queue = manager.queue(SESSION).await.unwrap();

    assert_eq!(history.len(), 1);
    assert_eq!(queue.len(), 18);

    let mut seen = HashSet::new();
    for track in history.iter().chain(queue.iter()).chain([&current]) {
        assert!(seen.insert(track.encoded_id.clone()), "{} appears twice", track.title);
    }
    let expected: HashSet<String> = sample_tracks(0..20)
        .into_iter()
        .map(|track| track.identifier)
        .collect();
    let actual: HashSet<String> = history
        .iter()
        .chain(queue.iter())
        .chain([&current])
        .map(|track| track.identifier.clone())
        .collect();
    assert_eq!(actual, expected);
}

fn identifiers(tracks: &[Track]) -> Vec<String> {
    tracks.iter().map(|track| track.identifier.clone()).collect()
}

#[tokio::test(start_paused = true)]
async fn concurrent_next_leaves_the_node_on_the_current_track() {
    let node = Arc::new(FakeNode::new());
    let manager = manager_with(node.clone(), Vec::new());
    manager.connect(SESSION, VOICE_CHANNEL).await.unwrap();
    manager
        .bulk_add(SESSION, sample_tracks(0..3), None)
        .await
        .unwrap();

    node.delay_next_update(Duration::from_millis(50));
    let slow = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.next(SESSION, None).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let started = manager.next(SESSION, None).await.unwrap().unwrap();
    slow.await.unwrap().unwrap();

    let current = manager.current(SESSION).await.unwrap();
    assert_eq!(current, started);
    assert_eq!(node.last_played(), Some(current.encoded_id));
    assert_eq!(
        manager.state(SESSION).await,
        PlayerState::Connected(PlaybackStatus::Playing)
    );
}

#[tokio::test]
async fn failed_skip_under_queue_repeat_restores_the_session() {
    let node = Arc::new(FakeNode::new());
    let manager = manager_with(node.clone(), Vec::new());
    manager.connect(SESSION, VOICE_CHANNEL).await.unwrap();
    manager.add(SESSION, sample_track(0), None).await.unwrap();
    let playing = manager.next(SESSION, None).await.unwrap().unwrap();
    manager.set_repeat_mode(SESSION, RepeatMode::Queue).await.unwrap();

    node.reject_updates();
    assert!(manager.skip(SESSION, None).await.is_err());

    assert_eq!(manager.current(SESSION).await, Some(playing));
    assert!(manager.queue(SESSION).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_skip_keeps_tracks_added_while_the_node_was_busy() {
    let node = Arc::new(FakeNode::new());
    let manager = manager_with(node.clone(), Vec::new());
    manager.connect(SESSION, VOICE_CHANNEL).await.unwrap();
    manager
        .bulk_add(SESSION, sample_tracks(0..2), None)
        .await
        .unwrap();
    let playing = manager.next(SESSION, None).await.unwrap().unwrap();
    manager.set_repeat_mode(SESSION, RepeatMode::Queue).await.unwrap();

    node.delay_next_update(Duration::from_millis(50));
    node.reject_updates();
    let skip = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.skip(SESSION, None).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    manager.add(SESSION, sample_track(2), None).await.unwrap();

    assert!(skip.await.unwrap().is_err());
    assert_eq!(manager.current(SESSION).await, Some(playing));
    assert_eq!(
        identifiers(&manager.queue(SESSION).await.unwrap()),
        vec!["fixture-1", "fixture-2"]
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_band_adjustments_both_land() {
    let node = Arc::new(FakeNode::new());
    let manager = manager_with(node.clone(), vec![Feature::Filters]);
    manager.connect(SESSION, VOICE_CHANNEL).await.unwrap();
    let effects = EffectsEngine::new(Arc::clone(&manager));

    node.delay_next_update(Duration::from_millis(50));
    let (first, second) = tokio::join!(
        effects.adjust_band(SESSION, 2, 0.1),
        effects.adjust_band(SESSION, 2, 0.1)
    );
    first.unwrap();
    second.unwrap();

    let gain = manager.effects(SESSION).await.unwrap().equalizer.gain(2).unwrap();
    assert!((gain - 0.2).abs() < 1e-6, "gain was {}", gain);
    let last_sent = node
        .updates()
        .iter()
        .rev()
        .find_map(|(_, update)| update.filters.clone())
        .unwrap();
    assert!((last_sent.equalizer[2].gain - 0.2).abs() < 1e-6);
}

#[tokio::test]
async fn least_loaded_healthy_node_is_chosen() {
    let pool = NodePool::new();
    let features = vec![Feature::Provider(Provider::Deezer)];
    register(&pool, "A", Arc::new(FakeNode::new()), features.clone(), 2);
    register(&pool, "B", Arc::new(FakeNode::new()), features, 1);

    let best = pool.find_best_node(Feature::Provider(Provider::Deezer)).unwrap();
    assert_eq!(best.identifier, "B");
    assert!(pool.find_best_node(Feature::Lyrics).is_none());
}

#[tokio::test]
async fn heartbeat_reorders_nodes_by_reported_load() {
    let busy = NodeStats {
        players: 10,
        playing_players: 8,
        ..Default::default()
    };
    let pool = NodePool::new();
    register(&pool, "A", Arc::new(FakeNode::new().with_stats(busy)), Vec::new(), 0);
    register(&pool, "B", Arc::new(FakeNode::new()), Vec::new(), 5);

    assert_eq!(pool.find_best_node(Feature::Playback).unwrap().identifier, "A");
    let lost = pool.refresh_health().await;

    assert!(lost.is_empty());
    assert_eq!(pool.find_best_node(Feature::Playback).unwrap().identifier, "B");
}

#[tokio::test]
async fn equalizer_survives_persist_clear_restore() {
    let node = Arc::new(FakeNode::new());
    let manager = manager_with(node.clone(), vec![Feature::Filters]);
    manager.connect(SESSION, VOICE_CHANNEL).await.unwrap();
    let effects = EffectsEngine::new(Arc::clone(&manager));

    let preset = EqualizerPreset {
        name: "bass boost".to_string(),
        bands: BTreeMap::from([(0, 0.6), (1, 0.67), (2, 0.67), (3, 0.4)]),
    };
    effects.set_equalizer(SESSION, &preset).await.unwrap();

    let persisted = effects.persist(SESSION).await.unwrap();
    effects.clear_equalizer(SESSION).await.unwrap();
    assert_eq!(effects.persist(SESSION).await.unwrap(), None);

    effects.restore(SESSION, persisted.as_ref()).await.unwrap();
    assert_eq!(effects.persist(SESSION).await.unwrap(), Some(preset));

    let filters_sent = node
        .updates()
        .iter()
        .filter(|(_, update)| update.filters.is_some())
        .count();
    assert_eq!(filters_sent, 3);
}

#[tokio::test]
async fn equalizer_round_trips_through_the_settings_store() {
    let manager = manager_with(Arc::new(FakeNode::new()), vec![Feature::Filters]);
    manager.connect(SESSION, VOICE_CHANNEL).await.unwrap();
    let effects = EffectsEngine::new(Arc::clone(&manager));
    let store = MemorySettingsStore::new();

    effects.adjust_band(SESSION, 4, 0.3).await.unwrap();
    effects.save(SESSION, &store).await.unwrap();
    effects.clear_equalizer(SESSION).await.unwrap();
    let restored = effects.load(SESSION, &store).await.unwrap();

    assert_eq!(restored.equalizer.gain(4), Some(0.3));
}

#[tokio::test]
async fn rejected_effects_leave_the_session_untouched() {
    let node = Arc::new(FakeNode::new());
    let manager = manager_with(node.clone(), vec![Feature::Filters]);
    manager.connect(SESSION, VOICE_CHANNEL).await.unwrap();
    let effects = EffectsEngine::new(Arc::clone(&manager));

    node.reject_updates();
    let result = effects.set_playback_rate(SESSION, 1.5).await;

    assert_matches!(result, Err(MusicError::EffectApplyError(_)));
    assert_eq!(manager.playback_rate(SESSION).await, 1.0);
}

#[tokio::test]
async fn natural_track_end_follows_the_repeat_mode() {
    let manager = manager_with(Arc::new(FakeNode::new()), Vec::new());
    manager.connect(SESSION, VOICE_CHANNEL).await.unwrap();
    manager
        .bulk_add(SESSION, sample_tracks(0..2), None)
        .await
        .unwrap();
    let first = manager.next(SESSION, None).await.unwrap().unwrap();

    manager.set_repeat_mode(SESSION, RepeatMode::Track).await.unwrap();
    manager
        .handle_node_event(
            SESSION,
            NodeEvent::TrackEnd {
                encoded_id: first.encoded_id.clone(),
                reason: TrackEndReason::Finished,
            },
        )
        .await
        .unwrap();
    assert_eq!(manager.current(SESSION).await, Some(first.clone()));

    manager.set_repeat_mode(SESSION, RepeatMode::Queue).await.unwrap();
    manager
        .handle_node_event(
            SESSION,
            NodeEvent::TrackEnd {
                encoded_id: first.encoded_id.clone(),
                reason: TrackEndReason::Finished,
            },
        )
        .await
        .unwrap();
    let queue = manager.queue(SESSION).await.unwrap();
    assert_eq!(queue.last(), Some(&first));
    assert_ne!(manager.current(SESSION).await, Some(first));
}

#[tokio::test]
async fn closed_socket_disconnects_with_one_terminal_event() {
    let manager = manager_with(Arc::new(FakeNode::new()), Vec::new());
    manager.connect(SESSION, VOICE_CHANNEL).await.unwrap();
    let mut events = manager.subscribe();

    manager
        .handle_node_event(
            SESSION,
            NodeEvent::WebSocketClosed {
                code: 4006,
                reason: "Session is no longer valid".to_string(),
            },
        )
        .await
        .unwrap();

    assert_eq!(manager.state(SESSION).await, PlayerState::Disconnected);
    assert_matches!(
        events.recv().await.unwrap(),
        PlayerEvent::Disconnected {
            reason: DisconnectReason::SocketClosed,
            ..
        }
    );
    assert_matches!(manager.add(SESSION, sample_track(1), None).await, Err(MusicError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn alone_session_pauses_then_leaves() {
    let manager = manager_with(Arc::new(FakeNode::new()), Vec::new());
    manager.connect(SESSION, VOICE_CHANNEL).await.unwrap();
    manager
        .apply_settings(
            SESSION,
            &SessionSettings {
                alone_pause: AloneSetting {
                    enabled: true,
                    time: Duration::from_secs(30),
                },
                alone_dc: AloneSetting {
                    enabled: true,
                    time: Duration::from_secs(120),
                },
                ..Default::default()
            },
        )
        .await
        .unwrap();
    manager.add(SESSION, sample_track(0), None).await.unwrap();
    manager.next(SESSION, None).await.unwrap();
    let alone = AloneManager::new(Arc::clone(&manager));

    alone.update_listener_count(SESSION, 0).await.unwrap();
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(
        manager.state(SESSION).await,
        PlayerState::Connected(PlaybackStatus::Paused)
    );

    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(manager.state(SESSION).await, PlayerState::Disconnected);
}

#[tokio::test]
async fn sessions_without_a_node_cannot_connect() {
    let manager = MusicManager::new(Arc::new(NodePool::new()), Arc::new(TrackCache::default()));

    let result = manager.connect(SESSION, VOICE_CHANNEL).await;

    assert_matches!(result, Err(MusicError::NoAvailableNode));
    assert_eq!(manager.state(SESSION).await, PlayerState::Idle);
}
