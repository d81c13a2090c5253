//! Track resolution and queued playback across a pool of nodes.

/// Providers, query parsing, the track model and resolution.
pub mod audio_sources;
/// Session management, node pool, effects, lyrics and the background handlers.
pub mod utils;
