//! Turns parsed queries into tracks by asking a capable node, one node call
//! per query, with results written through to the track cache.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::query::Query;
use super::track_metadata::Track;
use super::Feature;
use crate::music::utils::music_manager::{MusicError, MusicResult};
use crate::music::utils::node_client::LoadResult;
use crate::music::utils::node_pool::NodePool;
use crate::music::utils::track_cache::TrackCache;

/// Result of resolving a batch of queries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveOutcome {
    /// Resolved tracks, in input query order
    pub successful: Vec<Track>,
    /// How many tracks the nodes reported across all queries
    pub total_count: usize,
    /// Queries that produced nothing or failed
    pub failed: Vec<Query>,
}

pub struct ProviderResolver {
    node_pool: Arc<NodePool>,
    cache: Arc<TrackCache>,
}

impl ProviderResolver {
    pub fn new(node_pool: Arc<NodePool>, cache: Arc<TrackCache>) -> Self {
        Self { node_pool, cache }
    }

    pub fn cache(&self) -> &Arc<TrackCache> {
        &self.cache
    }

    /// Resolve a batch of queries concurrently.
    ///
    /// A search contributes its best-ranked result; a URL or local path
    /// contributes everything it points to (playlists, albums). A failing
    /// query lands in `failed` and never aborts the batch.
    pub async fn resolve(&self, queries: &[Query], requester: Option<&str>) -> ResolveOutcome {
        let results = join_all(queries.iter().map(|query| self.resolve_one(query))).await;

        let mut outcome = ResolveOutcome::default();
        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(tracks) => {
                    outcome.total_count += tracks.len();
                    let take = if query.is_search() { 1 } else { tracks.len() };
                    outcome.successful.extend(
                        tracks
                            .into_iter()
                            .take(take)
                            .map(|track| track.with_requester(requester)),
                    );
                }
                Err(e) => {
                    warn!("Failed to resolve '{}': {}", query.raw_text, e);
                    outcome.failed.push(query.clone());
                }
            }
        }

        info!(
            "Resolved {} of {} queries ({} tracks reported)",
            queries.len() - outcome.failed.len(),
            queries.len(),
            outcome.total_count
        );
        outcome
    }

    /// Every track a single query resolves to, best rank first.
    pub async fn resolve_one(&self, query: &Query) -> MusicResult<Vec<Track>> {
        let identifier = query.identifier();
        if let Some(tracks) = self.cache.get_query(&identifier) {
            return Ok(tracks);
        }

        let node = self
            .node_pool
            .find_best_node(Feature::Provider(query.provider))
            .ok_or(MusicError::NoAvailableNode)?;
        debug!("Resolving '{}' on node {}", identifier, node.identifier);

        let tracks: Vec<Track> = match node.client().load_tracks(&identifier).await? {
            LoadResult::Empty => Vec::new(),
            LoadResult::Error(error) => {
                warn!(
                    "Node {} failed to load '{}': {:?}",
                    node.identifier, identifier, error
                );
                return Err(MusicError::ResolveFailure(
                    error.message.unwrap_or_else(|| query.not_found_message()),
                ));
            }
            result => result
                .into_ranked_tracks()
                .into_iter()
                .map(|track| track.into_track(&node.identifier))
                .collect(),
        };

        if tracks.is_empty() {
            return Err(MusicError::ResolveFailure(query.not_found_message()));
        }

        for track in &tracks {
            self.cache.insert(track.clone());
        }
        self.cache.insert_query(&identifier, tracks.clone());
        Ok(tracks)
    }

    /// Search and remember the results as the requester's choices.
    pub async fn search(&self, query: &Query, requester: &str) -> MusicResult<Vec<Track>> {
        let tracks = self.resolve_one(query).await?;
        let tracks: Vec<Track> = tracks
            .into_iter()
            .map(|track| track.with_requester(Some(requester)))
            .collect();
        self.cache.offer_choices(requester, tracks.clone());
        Ok(tracks)
    }

    /// One of the choices last offered to the requester (0-based).
    pub fn choose(&self, requester: &str, index: usize) -> Option<Track> {
        self.cache.take_choice(requester, index)
    }
}
