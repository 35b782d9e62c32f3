use std::time::Duration;

use tokio::process::{Child, Command};

/// How long a child gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Command running `script` through the platform shell.
pub fn shell_command(script: &str) -> Command {
    cfg_if::cfg_if! {
        if #[cfg(target_family = "windows")] {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(script);
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(script);
        }
    }
    cmd
}

#[cfg(target_family = "unix")]
pub async fn kill_graceful(child: &mut Child) -> std::io::Result<()> {
    if let Some(id) = child.id() {
        // SAFETY: plain syscall on a pid we spawned and have not reaped yet.
        unsafe {
            libc::kill(id as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return Ok(());
        }
    }
    child.kill().await
}

#[cfg(target_family = "windows")]
pub async fn kill_graceful(child: &mut Child) -> std::io::Result<()> {
    child.kill().await
}
