//! Short-lived memoization of resolved tracks, resolved queries, and the
//! search choices most recently offered to each requester.
//!
//! Reads go through `DashMap` shard read-locks; writes are last-write-wins
//! per key. Entries expire after the TTL regardless of use, and once a map
//! grows past capacity the least-recently-used entry is evicted.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::music::audio_sources::track_metadata::Track;

pub const DEFAULT_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_CAPACITY: usize = 1000;

struct CacheEntry<T> {
    value: T,
    inserted_at: Instant,
    last_used: AtomicU64,
}

impl<T> CacheEntry<T> {
    fn new(value: T, tick: u64) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
            last_used: AtomicU64::new(tick),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() >= ttl
    }
}

/// Process-wide cache shared by the resolver and command layers.
pub struct TrackCache {
    ttl: Duration,
    capacity: usize,
    tracks: DashMap<String, CacheEntry<Track>>,
    queries: DashMap<String, CacheEntry<Vec<Track>>>,
    choices: DashMap<String, CacheEntry<Vec<Track>>>,
    clock: AtomicU64,
}

impl Default for TrackCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}

impl TrackCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        info!(
            "Creating track cache (ttl: {:?}, capacity: {})",
            ttl, capacity
        );
        Self {
            ttl,
            capacity: capacity.max(1),
            tracks: DashMap::new(),
            queries: DashMap::new(),
            choices: DashMap::new(),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Looks up a resolved track by its encoded id.
    pub fn get(&self, encoded_id: &str) -> Option<Track> {
        let hit = lookup(&self.tracks, encoded_id, self.ttl, self.tick());
        debug!(
            "Track cache {} for {}",
            if hit.is_some() { "hit" } else { "miss" },
            encoded_id
        );
        hit
    }

    /// Caches a resolved track under its encoded id.
    pub fn insert(&self, track: Track) {
        let key = track.encoded_id.clone();
        store(&self.tracks, key, track, self.ttl, self.capacity, self.tick());
    }

    /// Looks up the tracks a query identifier resolved to.
    pub fn get_query(&self, identifier: &str) -> Option<Vec<Track>> {
        let hit = lookup(&self.queries, identifier, self.ttl, self.tick());
        debug!(
            "Query cache {} for '{}'",
            if hit.is_some() { "hit" } else { "miss" },
            identifier
        );
        hit
    }

    pub fn insert_query(&self, identifier: &str, tracks: Vec<Track>) {
        store(
            &self.queries,
            identifier.to_string(),
            tracks,
            self.ttl,
            self.capacity,
            self.tick(),
        );
    }

    /// Remembers the list of search choices last offered to a requester.
    pub fn offer_choices(&self, requester: &str, tracks: Vec<Track>) {
        store(
            &self.choices,
            requester.to_string(),
            tracks,
            self.ttl,
            self.capacity,
            self.tick(),
        );
    }

    /// Picks one of the choices last offered to a requester (0-based).
    pub fn take_choice(&self, requester: &str, index: usize) -> Option<Track> {
        lookup(&self.choices, requester, self.ttl, self.tick())
            .and_then(|choices| choices.into_iter().nth(index))
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn clear(&self) {
        self.tracks.clear();
        self.queries.clear();
        self.choices.clear();
    }
}

fn lookup<T: Clone>(
    map: &DashMap<String, CacheEntry<T>>,
    key: &str,
    ttl: Duration,
    tick: u64,
) -> Option<T> {
    // The shard guard must be released before removing an expired entry.
    let expired = match map.get(key) {
        Some(entry) if !entry.is_expired(ttl) => {
            entry.last_used.store(tick, Ordering::Relaxed);
            return Some(entry.value.clone());
        }
        Some(_) => true,
        None => false,
    };

    if expired {
        map.remove_if(key, |_, entry| entry.is_expired(ttl));
    }
    None
}

fn store<T>(
    map: &DashMap<String, CacheEntry<T>>,
    key: String,
    value: T,
    ttl: Duration,
    capacity: usize,
    tick: u64,
) {
    map.insert(key, CacheEntry::new(value, tick));

    if map.len() <= capacity {
        return;
    }

    map.retain(|_, entry| !entry.is_expired(ttl));
    while map.len() > capacity {
        let oldest = map
            .iter()
            .min_by_key(|entry| entry.value().last_used.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone());
        match oldest {
            Some(key) => {
                debug!("Evicting least recently used cache entry {}", key);
                map.remove(&key);
            }
            None => break,
        }
    }
}
