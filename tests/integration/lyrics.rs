use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

use rusty_music::music::utils::effects::EffectsEngine;
use rusty_music::music::utils::lyrics_scheduler::LyricsScheduler;
use rusty_music::{Feature, MusicError, MusicManager};

use crate::common::fixtures::{lyric_sheet, sample_track};
use crate::common::mocks::{FakeNode, RecordingNotifier};
use crate::common::{SESSION, TEXT_CHANNEL, VOICE_CHANNEL, manager_with};

async fn playing_with_lyrics(
    node: FakeNode,
    capabilities: Vec<Feature>,
) -> (Arc<MusicManager>, Arc<LyricsScheduler>, Arc<RecordingNotifier>) {
    let manager = manager_with(Arc::new(node), capabilities);
    let notifier = Arc::new(RecordingNotifier::new());
    let scheduler = LyricsScheduler::new(Arc::clone(&manager), notifier.clone());
    scheduler.spawn();
    scheduler.enable(SESSION, TEXT_CHANNEL);
    manager.connect(SESSION, VOICE_CHANNEL).await.unwrap();
    manager.add(SESSION, sample_track(0), None).await.unwrap();
    (manager, scheduler, notifier)
}

#[tokio::test(start_paused = true)]
async fn fifty_lines_arrive_as_five_chunks_of_ten() {
    let node = FakeNode::new().with_lyrics(lyric_sheet(50, 1_000));
    let (manager, _scheduler, notifier) =
        playing_with_lyrics(node, vec![Feature::Lyrics]).await;

    manager.next(SESSION, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(notifier.sent().len(), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    let sent = notifier.sent();
    assert_eq!(sent.len(), 5);
    assert!(sent.iter().all(|(channel, _)| *channel == TEXT_CHANNEL));
    assert!(sent.iter().all(|(_, text)| text.lines().count() == 10));
    assert!(sent[1].1.starts_with("line 10"));
}

#[tokio::test(start_paused = true)]
async fn faster_playback_posts_chunks_sooner() {
    let node = FakeNode::new().with_lyrics(lyric_sheet(50, 1_000));
    let (manager, _scheduler, notifier) =
        playing_with_lyrics(node, vec![Feature::Lyrics, Feature::Filters]).await;
    EffectsEngine::new(Arc::clone(&manager))
        .set_playback_rate(SESSION, 2.0)
        .await
        .unwrap();

    manager.next(SESSION, None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(21)).await;

    assert_eq!(notifier.sent().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn disconnect_mid_sleep_stops_further_chunks() {
    let node = FakeNode::new().with_lyrics(lyric_sheet(50, 1_000));
    let (manager, scheduler, notifier) =
        playing_with_lyrics(node, vec![Feature::Lyrics]).await;

    manager.next(SESSION, None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(notifier.sent().len(), 1);

    manager.disconnect(SESSION).await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(notifier.sent().len(), 1);
    assert!(!scheduler.is_enabled(SESSION));
}

#[tokio::test(start_paused = true)]
async fn missing_lyrics_are_reported_once() {
    let (manager, _scheduler, notifier) =
        playing_with_lyrics(FakeNode::new(), vec![Feature::Lyrics]).await;

    manager.next(SESSION, None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    let title = manager.current(SESSION).await.unwrap().title;
    assert_eq!(sent[0].1, MusicError::NoLyricsFound(title).to_string());
}

#[tokio::test(start_paused = true)]
async fn chunks_left_behind_by_a_seek_are_skipped() {
    let node = FakeNode::new().with_lyrics(lyric_sheet(50, 1_000));
    let (manager, _scheduler, notifier) =
        playing_with_lyrics(node, vec![Feature::Lyrics]).await;

    manager.next(SESSION, None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    // Chunks start at 0s, 10s, 20s, 30s and 40s; at the next wake-up the
    // position is 31s, more than 5s past the chunks at 10s and 20s.
    manager.seek(SESSION, 22_000).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    let firsts: Vec<String> = notifier
        .sent()
        .into_iter()
        .filter_map(|(_, text)| text.lines().next().map(str::to_string))
        .collect();
    assert_eq!(firsts, vec!["line 0", "line 30", "line 40"]);
}

#[tokio::test(start_paused = true)]
async fn schedule_goes_quiet_when_the_track_changes() {
    let node = FakeNode::new().with_lyrics(lyric_sheet(50, 1_000));
    let manager = manager_with(Arc::new(node), vec![Feature::Lyrics]);
    let notifier = Arc::new(RecordingNotifier::new());
    // Not subscribed to player events, so only the running schedule itself
    // can notice the change.
    let scheduler = LyricsScheduler::new(Arc::clone(&manager), notifier.clone());
    manager.connect(SESSION, VOICE_CHANNEL).await.unwrap();
    manager
        .bulk_add(SESSION, vec![sample_track(0), sample_track(1)], None)
        .await
        .unwrap();
    let first = manager.next(SESSION, None).await.unwrap().unwrap();

    let schedule = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.run(SESSION, TEXT_CHANNEL, first).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(notifier.sent().len(), 1);

    manager.next(SESSION, None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(schedule.is_finished());
    assert_eq!(notifier.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn provider_failures_are_reported_once() {
    let node = FakeNode::new().with_lyrics_error("lyrics backend timed out");
    let (manager, _scheduler, notifier) =
        playing_with_lyrics(node, vec![Feature::Lyrics]).await;

    manager.next(SESSION, None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(
        notifier.sent(),
        vec![(
            TEXT_CHANNEL,
            MusicError::ProviderError("lyrics backend timed out".to_string()).to_string()
        )]
    );
}

#[tokio::test(start_paused = true)]
async fn nodes_without_lyrics_support_yield_no_available_node() {
    let node = FakeNode::new().with_lyrics(lyric_sheet(10, 1_000));
    let (manager, _scheduler, notifier) = playing_with_lyrics(node, Vec::new()).await;

    manager.next(SESSION, None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(
        notifier.sent(),
        vec![(TEXT_CHANNEL, MusicError::NoAvailableNode.to_string())]
    );
}
