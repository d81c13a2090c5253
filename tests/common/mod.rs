//! Common test utilities, fixtures, and mocks
//! This module contains shared functionality used across the integration tests

pub mod mocks;

use std::sync::Arc;

use rusty_music::music::utils::node_client::NodeClient;
use rusty_music::music::utils::node_pool::NodeHealth;
use rusty_music::music::utils::track_cache::TrackCache;
use rusty_music::{Feature, MusicManager, NodeConfig, NodePool, SessionId};

pub const SESSION: SessionId = SessionId(42);
pub const VOICE_CHANNEL: u64 = 987654321;
pub const TEXT_CHANNEL: u64 = 123456789;

pub fn node_config(identifier: &str, capabilities: Vec<Feature>) -> NodeConfig {
    NodeConfig {
        identifier: identifier.to_string(),
        base_url: format!("http://{}.test", identifier),
        password: "youshallnotpass".to_string(),
        capabilities,
        managed: false,
    }
}

/// Registers `client` and marks it healthy with the given load.
pub fn register(
    pool: &NodePool,
    identifier: &str,
    client: Arc<dyn NodeClient>,
    capabilities: Vec<Feature>,
    load_score: u32,
) {
    pool.add_node_with_client(node_config(identifier, capabilities), client)
        .expect("node registers");
    pool.set_health(
        identifier,
        NodeHealth {
            connected: true,
            load_score,
        },
    )
    .expect("node exists");
}

/// A manager over a single healthy node.
pub fn manager_with(client: Arc<dyn NodeClient>, capabilities: Vec<Feature>) -> Arc<MusicManager> {
    let pool = Arc::new(NodePool::new());
    register(&pool, "main", client, capabilities, 0);
    MusicManager::new(pool, Arc::new(TrackCache::default()))
}
