//! Outbound messages to users (lyrics, failure notices).

use async_trait::async_trait;
use tracing::info;

use crate::music::utils::music_manager::MusicResult;

/// Delivers a message to a channel. Callers log failures and carry on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel_id: u64, content: String) -> MusicResult<()>;
}

/// Writes messages to the log instead of a chat channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, channel_id: u64, content: String) -> MusicResult<()> {
        info!("[channel {}] {}", channel_id, content);
        Ok(())
    }
}
