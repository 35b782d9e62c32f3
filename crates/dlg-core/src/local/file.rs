use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use dlg_model::{EpochMillis, LocalCommand, LocalStatus, WatcherStatus};
use tokio::fs;
use tracing::{debug, warn};

use super::{ChannelError, LocalChannel};
use crate::system::process_id;

const WATCHER: &str = "watcher";

/// [`LocalChannel`] over plain files under a message directory:
///
/// - `data/delegate-<pid>`: JSON status of this process
/// - `data/watcher`: JSON status of the watcher
/// - `io/delegate-<pid>`: commands for this process, one per line
/// - `io/watcher`: notices for the watcher, one per line
///
/// Every JSON file is replaced through a rename, so readers never see a partial write.
#[derive(Debug, Clone)]
pub struct FileChannel {
    root: PathBuf,
    me: String,
}

impl FileChannel {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::for_process(root, process_id())
    }

    pub fn for_process(root: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            root: root.into(),
            me: format!("delegate-{pid}"),
        }
    }

    fn data(&self, name: &str) -> PathBuf {
        self.root.join("data").join(name)
    }

    fn io(&self, name: &str) -> PathBuf {
        self.root.join("io").join(name)
    }

    pub fn status_path(&self) -> PathBuf {
        self.data(&self.me)
    }

    pub fn inbox_path(&self) -> PathBuf {
        self.io(&self.me)
    }

    async fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ChannelError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(value)?).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn append_line(path: &Path, line: &str) -> Result<(), ChannelError> {
        use tokio::io::AsyncWriteExt;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        f.write_all(format!("{line}\n").as_bytes()).await?;
        f.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl LocalChannel for FileChannel {
    async fn announce_started(&self) -> Result<(), ChannelError> {
        Self::append_line(&self.io(WATCHER), &format!("{} started", self.me)).await
    }

    async fn publish(&self, status: &LocalStatus) -> Result<(), ChannelError> {
        Self::write_json(&self.status_path(), status).await
    }

    async fn watcher(&self) -> Result<WatcherStatus, ChannelError> {
        match fs::read(self.data(WATCHER)).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(WatcherStatus::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn touch_watcher(&self, heartbeat: EpochMillis) -> Result<(), ChannelError> {
        let mut status = self.watcher().await?;
        status.heartbeat = Some(heartbeat);
        Self::write_json(&self.data(WATCHER), &status).await
    }

    async fn take_commands(&self) -> Result<Vec<LocalCommand>, ChannelError> {
        // Writers open the inbox by path, so renaming it away claims
        // exactly the lines written so far.
        let inbox = self.inbox_path();
        let taken = inbox.with_extension("taken");
        match fs::rename(&inbox, &taken).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }
        let raw = fs::read_to_string(&taken).await?;
        fs::remove_file(&taken).await?;

        let mut commands = Vec::new();
        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match line.parse::<LocalCommand>() {
                Ok(cmd) => commands.push(cmd),
                Err(e) => warn!(line, error = %e, "ignoring unknown watcher command"),
            }
        }
        if !commands.is_empty() {
            debug!(?commands, "received watcher commands");
        }
        Ok(commands)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        for path in [self.status_path(), self.inbox_path()] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let ch = FileChannel::for_process(dir.path(), 42);

        let status = LocalStatus {
            heartbeat: Some(10),
            version: Some("1.0.0".into()),
            upgrade_pending: true,
            ..LocalStatus::default()
        };
        ch.publish(&status).await.unwrap();

        let raw = std::fs::read(dir.path().join("data/delegate-42")).unwrap();
        let back: LocalStatus = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back, status);

        ch.close().await.unwrap();
        assert!(!dir.path().join("data/delegate-42").exists());
    }

    #[tokio::test]
    async fn commands_are_taken_once() {
        let dir = tempfile::tempdir().unwrap();
        let ch = FileChannel::for_process(dir.path(), 7);
        std::fs::create_dir_all(dir.path().join("io")).unwrap();
        std::fs::write(
            dir.path().join("io/delegate-7"),
            "go-ahead\nbogus\nstop-acquiring\n",
        )
        .unwrap();

        assert_eq!(
            ch.take_commands().await.unwrap(),
            vec![LocalCommand::GoAhead, LocalCommand::StopAcquiring]
        );
        assert!(ch.take_commands().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn touching_watcher_keeps_other_fields() {
        let dir = tempfile::tempdir().unwrap();
        let ch = FileChannel::for_process(dir.path(), 7);
        assert_eq!(ch.watcher().await.unwrap(), WatcherStatus::default());

        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(
            dir.path().join("data/watcher"),
            r#"{"heartbeat":1,"version":"2.0","process":"123"}"#,
        )
        .unwrap();

        ch.touch_watcher(99).await.unwrap();
        let w = ch.watcher().await.unwrap();
        assert_eq!(w.heartbeat, Some(99));
        assert_eq!(w.process.as_deref(), Some("123"));
    }

    #[tokio::test]
    async fn announce_appends_to_watcher_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let ch = FileChannel::for_process(dir.path(), 3);
        ch.announce_started().await.unwrap();
        let raw = std::fs::read_to_string(dir.path().join("io/watcher")).unwrap();
        assert_eq!(raw, "delegate-3 started\n");
    }
}
