//! Process control over the watcher that supervises this delegate.

use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use dlg_core::local::WatcherControl;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};
use tracing::{info, warn};

/// Launch script the watcher is started from.
const START_SCRIPT: &str = "start.sh";

/// Kills the watcher by pid and starts it again from `start.sh` in the work dir.
#[derive(Debug, Clone)]
pub struct ScriptWatcher {
    work_dir: PathBuf,
}

impl ScriptWatcher {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self { work_dir: work_dir.into() }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

fn parse_pid(process: &str) -> io::Result<i32> {
    process
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("not a pid: {process:?}")))
}

#[async_trait]
impl WatcherControl for ScriptWatcher {
    async fn kill(&self, process: &str) -> io::Result<()> {
        let pid = parse_pid(process)?;
        cfg_if::cfg_if! {
            if #[cfg(target_family = "unix")] {
                // SAFETY: plain syscall, the pid was validated above.
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
                if rc != 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::ESRCH) {
                        warn!(pid, "watcher already gone");
                        return Ok(());
                    }
                    return Err(err);
                }
            } else {
                let status = Command::new("taskkill")
                    .args(["/F", "/PID", &pid.to_string()])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await?;
                if !status.success() {
                    return Err(io::Error::other(format!("taskkill exited with {status}")));
                }
            }
        }
        info!(pid, "watcher killed");
        Ok(())
    }

    async fn relaunch(&self) -> io::Result<()> {
        let script = self.work_dir.join(START_SCRIPT);
        if !script.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} missing", script.display()),
            ));
        }
        let mut child = Command::new("nohup")
            .arg(format!("./{START_SCRIPT}"))
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = child.id();
        info!(pid, dir = %self.work_dir.display(), "watcher relaunched");

        if let Some(out) = child.stdout.take() {
            tokio::spawn(forward(out, "stdout"));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(forward(err, "stderr"));
        }
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(pid, %status, "start script exited"),
                Err(e) => warn!(pid, error = %e, "lost track of start script"),
            }
        });
        Ok(())
    }
}

async fn forward<R: AsyncRead + Unpin>(pipe: R, stream: &'static str) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(stream, "watcher: {line}");
    }
}
