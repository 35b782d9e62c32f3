//! Channel between the delegate and the watcher process that supervises it.

mod file;
pub use file::FileChannel;

use async_trait::async_trait;
use dlg_model::{EpochMillis, LocalCommand, LocalStatus, WatcherStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid channel payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait LocalChannel: Send + Sync {
    /// Tell the watcher a new delegate process is up.
    async fn announce_started(&self) -> Result<(), ChannelError>;

    async fn publish(&self, status: &LocalStatus) -> Result<(), ChannelError>;

    async fn watcher(&self) -> Result<WatcherStatus, ChannelError>;

    /// Overwrite the watcher's last heartbeat, used right after relaunching it.
    async fn touch_watcher(&self, heartbeat: EpochMillis) -> Result<(), ChannelError>;

    /// Drain pending commands from the watcher.
    async fn take_commands(&self) -> Result<Vec<LocalCommand>, ChannelError>;

    /// Remove everything this process published.
    async fn close(&self) -> Result<(), ChannelError>;
}

/// Process control over the watcher.
#[async_trait]
pub trait WatcherControl: Send + Sync {
    async fn kill(&self, process: &str) -> std::io::Result<()>;

    async fn relaunch(&self) -> std::io::Result<()>;
}
