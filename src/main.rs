use dotenv::dotenv;
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rusty_music::music::utils::autoplay_manager::AutoplayManager;
use rusty_music::music::utils::format_duration;
use rusty_music::music::utils::lyrics_scheduler::LyricsScheduler;
use rusty_music::music::utils::track_cache::TrackCache;
use rusty_music::utils::database::{SqliteSettingsStore, load_global_settings};
use rusty_music::utils::notifier::LogNotifier;
use rusty_music::{MusicConfig, MusicManager, NodePool, QueryParser};

type Error = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Initialize logging with debug level for our crate
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rusty_music=debug,warn")),
        )
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_target(true)
        .with_ansi(true)
        .pretty()
        .init();

    dotenv().ok();

    let config = MusicConfig::load()?;
    let store = SqliteSettingsStore::open(&config.settings_db_path).await?;
    let global = load_global_settings(&store).await?;

    let pool = Arc::new(NodePool::new());
    for node in &config.nodes {
        if node.managed && !global.managed_node_enabled {
            info!("Skipping managed node {} (managed nodes are disabled)", node.identifier);
            continue;
        }
        if let Err(e) = pool.add_node(node.clone()) {
            error!("Failed to register node {}: {}", node.identifier, e);
        }
    }
    if pool.nodes().is_empty() {
        warn!("No nodes configured, nothing can be resolved");
    }

    let lost = pool.refresh_health().await;
    for node in lost {
        warn!("Node {} is unreachable", node);
    }
    let heartbeat = pool.spawn_heartbeat(config.heartbeat_interval);

    let cache = Arc::new(TrackCache::new(
        config.track_cache.ttl,
        config.track_cache.capacity,
    ));
    let manager = MusicManager::new(Arc::clone(&pool), cache);

    // Background handlers, as a long-running host would run them
    let background = vec![
        heartbeat,
        manager.spawn_node_watcher(),
        LyricsScheduler::with_catch_up_window(
            Arc::clone(&manager),
            Arc::new(LogNotifier),
            config.lyrics.catch_up_window,
        )
        .spawn(),
        AutoplayManager::new(Arc::clone(&manager), config.default_search_provider).spawn(),
    ];

    let parser = QueryParser::new(config.default_search_provider)?;
    let mut queries = Vec::new();
    for raw in env::args().skip(1) {
        match parser.parse(&raw) {
            Ok(query) => queries.push(query),
            Err(e) => println!("{}", e),
        }
    }

    let outcome = manager.resolver().resolve(&queries, None).await;
    for track in &outcome.successful {
        println!(
            "{} — {} [{}]",
            track.title,
            track.author,
            format_duration(track.duration)
        );
    }
    for query in &outcome.failed {
        println!("{}", query.not_found_message());
    }
    info!(
        "Resolved {} tracks from {} queries ({} reported by nodes)",
        outcome.successful.len(),
        queries.len(),
        outcome.total_count
    );

    for task in background {
        task.abort();
    }
    Ok(())
}
