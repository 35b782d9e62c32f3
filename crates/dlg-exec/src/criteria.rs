//! Capability checks shell tasks declare in their parameters.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use dlg_core::{Criterion, RunnerError};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Passes when `program` resolves to an executable file on `PATH`.
#[derive(Debug, Clone)]
pub struct CommandAvailable {
    program: String,
}

impl CommandAvailable {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    /// First executable match for the program, absolute paths included.
    pub fn resolve(&self) -> Option<PathBuf> {
        let program = Path::new(&self.program);
        if program.components().count() > 1 {
            return is_executable(program).then(|| program.to_path_buf());
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[async_trait]
impl Criterion for CommandAvailable {
    fn describe(&self) -> String {
        format!("command:{}", self.program)
    }

    async fn check(&self, _cancel: &CancellationToken) -> Result<bool, RunnerError> {
        let found = self.resolve();
        trace!(program = %self.program, ?found, "command lookup");
        Ok(found.is_some())
    }
}

/// Passes when a TCP connection to `target` (`host:port`) opens in time.
#[derive(Debug, Clone)]
pub struct TcpReachable {
    target: String,
    timeout: Duration,
}

impl TcpReachable {
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Criterion for TcpReachable {
    fn describe(&self) -> String {
        self.target.clone()
    }

    async fn check(&self, cancel: &CancellationToken) -> Result<bool, RunnerError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(RunnerError::Cancelled),
            res = tokio::time::timeout(self.timeout, TcpStream::connect(self.target.as_str())) => {
                let reachable = matches!(res, Ok(Ok(_)));
                trace!(target = %self.target, reachable, "connectivity check");
                Ok(reachable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn finds_sh_on_path() {
        let c = CommandAvailable::new("sh");
        assert_eq!(c.check(&CancellationToken::new()).await, Ok(true));
        assert_eq!(c.describe(), "command:sh");
    }

    #[tokio::test]
    async fn unknown_command_fails() {
        let c = CommandAvailable::new("definitely-not-a-real-binary-4711");
        assert_eq!(c.check(&CancellationToken::new()).await, Ok(false));
    }

    #[tokio::test]
    async fn open_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let c = TcpReachable::new(addr, Duration::from_secs(1));
        assert_eq!(c.check(&CancellationToken::new()).await, Ok(true));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let c = TcpReachable::new(addr, Duration::from_millis(500));
        assert_eq!(c.check(&CancellationToken::new()).await, Ok(false));
    }
}
