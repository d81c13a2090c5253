//! Multi-node track resolution and queued-playback engine.

pub mod config;
pub mod music;
pub mod utils;

pub use config::MusicConfig;
pub use music::audio_sources::query::{Query, QueryKind, QueryParser};
pub use music::audio_sources::track_metadata::Track;
pub use music::audio_sources::{Feature, Provider};
pub use music::utils::SessionId;
pub use music::utils::music_manager::{MusicError, MusicManager, MusicResult};
pub use music::utils::node_pool::{NodeConfig, NodePool};
