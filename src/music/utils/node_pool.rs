//! Manages the set of playback nodes: registration, health, best-node
//! selection and the pinning of sessions to nodes.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::SessionId;
use super::music_manager::{MusicError, MusicResult};
use super::node_client::{NodeClient, RestNodeClient};
use crate::music::audio_sources::Feature;

/// Static description of a node, usually read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub identifier: String,
    pub base_url: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub capabilities: Vec<Feature>,
    /// Whether the node process is managed by this application.
    #[serde(default)]
    pub managed: bool,
}

/// Latest health snapshot, updated by the heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub connected: bool,
    pub load_score: u32,
}

/// A registered node. Cloning yields a snapshot sharing the same client.
#[derive(Clone)]
pub struct Node {
    pub identifier: String,
    pub capabilities: HashSet<Feature>,
    pub health: NodeHealth,
    pub managed: bool,
    registered: u64,
    client: Arc<dyn NodeClient>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("identifier", &self.identifier)
            .field("capabilities", &self.capabilities)
            .field("health", &self.health)
            .field("managed", &self.managed)
            .finish()
    }
}

impl Node {
    pub fn client(&self) -> &Arc<dyn NodeClient> {
        &self.client
    }

    pub fn is_healthy(&self) -> bool {
        self.health.connected
    }

    /// Playback is implied for every node.
    pub fn supports(&self, feature: Feature) -> bool {
        feature == Feature::Playback || self.capabilities.contains(&feature)
    }
}

/// Process-wide registry of nodes.
pub struct NodePool {
    http: reqwest::Client,
    nodes: DashMap<String, Node>,
    /// Session -> identifier of the node it is pinned to.
    sessions: DashMap<SessionId, String>,
    registrations: AtomicU64,
    health_tx: broadcast::Sender<String>,
}

impl Default for NodePool {
    fn default() -> Self {
        Self::new()
    }
}

impl NodePool {
    pub fn new() -> Self {
        let (health_tx, _) = broadcast::channel(32);
        Self {
            http: reqwest::Client::new(),
            nodes: DashMap::new(),
            sessions: DashMap::new(),
            registrations: AtomicU64::new(0),
            health_tx,
        }
    }

    /// Registers a node reachable over REST.
    pub fn add_node(&self, config: NodeConfig) -> MusicResult<()> {
        let client = RestNodeClient::new(
            self.http.clone(),
            config.base_url.clone(),
            config.password.clone(),
            config.identifier.clone(),
        );
        self.add_node_with_client(config, Arc::new(client))
    }

    /// Registers a node backed by the given client.
    ///
    /// New nodes start disconnected until a health update marks them up.
    pub fn add_node_with_client(
        &self,
        config: NodeConfig,
        client: Arc<dyn NodeClient>,
    ) -> MusicResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.nodes.entry(config.identifier.clone()) {
            Entry::Occupied(_) => Err(MusicError::DuplicateNode(config.identifier)),
            Entry::Vacant(slot) => {
                info!(
                    "Registering node {} ({}) with capabilities {:?}",
                    config.identifier, config.base_url, config.capabilities
                );
                slot.insert(Node {
                    identifier: config.identifier,
                    capabilities: config.capabilities.into_iter().collect(),
                    health: NodeHealth::default(),
                    managed: config.managed,
                    registered: self.registrations.fetch_add(1, Ordering::Relaxed),
                    client,
                });
                Ok(())
            }
        }
    }

    /// Unregisters a node; sessions pinned to it are re-selected on their next action.
    pub fn remove_node(&self, identifier: &str) -> Option<Node> {
        let removed = self.nodes.remove(identifier).map(|(_, node)| node)?;
        self.sessions.retain(|_, pinned| pinned != identifier);
        info!("Removed node {}", identifier);
        let _ = self.health_tx.send(identifier.to_string());
        Some(removed)
    }

    pub fn node(&self, identifier: &str) -> Option<Node> {
        self.nodes.get(identifier).map(|node| node.clone())
    }

    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|node| node.clone()).collect();
        nodes.sort_by_key(|node| node.registered);
        nodes
    }

    /// The healthy node advertising `feature` with the lowest load,
    /// ties going to the earliest registered. `None` when nothing qualifies.
    pub fn find_best_node(&self, feature: Feature) -> Option<Node> {
        let best = self
            .nodes
            .iter()
            .filter(|node| node.is_healthy() && node.supports(feature))
            .min_by_key(|node| (node.health.load_score, node.registered))
            .map(|node| node.clone());

        match &best {
            Some(node) => debug!(
                "Selected node {} (load {}) for {}",
                node.identifier, node.health.load_score, feature
            ),
            None => warn!("No healthy node available for {}", feature),
        }
        best
    }

    /// The node a session is pinned to, whatever its health.
    pub fn get_node(&self, session_id: SessionId) -> Option<Node> {
        let identifier = self.sessions.get(&session_id)?.clone();
        self.node(&identifier)
    }

    /// The node a session should use for its next action.
    ///
    /// Keeps the pinned node while it is healthy and capable; otherwise the
    /// session is handed to `find_best_node` again and re-pinned.
    pub fn session_node(&self, session_id: SessionId, feature: Feature) -> MusicResult<Node> {
        if let Some(node) = self.get_node(session_id) {
            if node.is_healthy() && node.supports(feature) {
                return Ok(node);
            }
            warn!(
                "Node {} is no longer usable for session {}, selecting another",
                node.identifier, session_id
            );
        }

        let node = self
            .find_best_node(feature)
            .ok_or(MusicError::NoAvailableNode)?;
        self.sessions.insert(session_id, node.identifier.clone());
        info!("Pinned session {} to node {}", session_id, node.identifier);
        Ok(node)
    }

    pub fn unpin(&self, session_id: SessionId) {
        self.sessions.remove(&session_id);
    }

    /// Sessions currently pinned to a node.
    pub fn sessions_on(&self, identifier: &str) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.value() == identifier)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Heartbeat entry point. Returns `true` when the node just went unhealthy.
    pub fn set_health(&self, identifier: &str, health: NodeHealth) -> MusicResult<bool> {
        let lost = {
            let mut node = self
                .nodes
                .get_mut(identifier)
                .ok_or_else(|| MusicError::UnknownNode(identifier.to_string()))?;
            let lost = node.health.connected && !health.connected;
            node.health = health;
            lost
        };

        if lost {
            warn!("Node {} lost health", identifier);
            let _ = self.health_tx.send(identifier.to_string());
        }
        Ok(lost)
    }

    /// Receives the identifiers of nodes that went unhealthy or were removed.
    pub fn subscribe_health(&self) -> broadcast::Receiver<String> {
        self.health_tx.subscribe()
    }

    /// Polls every node's stats once, updating health and load.
    /// Returns the nodes that went unhealthy.
    pub async fn refresh_health(&self) -> Vec<String> {
        let mut lost = Vec::new();
        for node in self.nodes() {
            let health = match node.client.stats().await {
                Ok(stats) => NodeHealth {
                    connected: true,
                    load_score: stats.load_score(),
                },
                Err(e) => {
                    warn!("Heartbeat to node {} failed: {}", node.identifier, e);
                    NodeHealth {
                        connected: false,
                        load_score: node.health.load_score,
                    }
                }
            };
            // The node may have been removed while we were waiting.
            if let Ok(true) = self.set_health(&node.identifier, health) {
                lost.push(node.identifier.clone());
            }
        }
        lost
    }

    /// Runs `refresh_health` on an interval until the handle is aborted.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        info!("Starting node heartbeat every {:?}", interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let lost = pool.refresh_health().await;
                if !lost.is_empty() {
                    warn!("Heartbeat marked nodes unhealthy: {:?}", lost);
                }
            }
        })
    }
}
