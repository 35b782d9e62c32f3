//! POSIX `rlimit` caps for shell tasks.
//!
//! Limits are installed in a `pre_exec` hook, i.e. in the forked child right
//! before `execve`, so the task never runs unrestricted. Elsewhere they are
//! logged and ignored.
use serde::{Deserialize, Serialize};
use tokio::process::Command;
#[cfg(not(unix))]
use tracing::warn;

/// Per-task process limits, as carried in task parameters under `limits`.
///
/// `None` keeps the limit inherited from the delegate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessLimits {
    /// `RLIMIT_NOFILE`.
    pub max_open_files: Option<u64>,
    /// `RLIMIT_FSIZE`; growing a file past it raises `SIGXFSZ`.
    pub max_file_size_bytes: Option<u64>,
    /// `RLIMIT_CPU`, in seconds of CPU time.
    pub max_cpu_seconds: Option<u64>,
    /// `RLIMIT_CORE = 0`.
    pub disable_core_dumps: bool,
}

impl ProcessLimits {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.max_open_files.is_none()
            && self.max_file_size_bytes.is_none()
            && self.max_cpu_seconds.is_none()
            && !self.disable_core_dumps
    }
}

pub fn attach_limits(cmd: &mut Command, limits: &ProcessLimits) {
    if limits.is_empty() {
        return;
    }

    #[cfg(unix)]
    unix_impl::attach(cmd, limits.clone());

    #[cfg(not(unix))]
    {
        let _ = cmd;
        warn!(?limits, "process limits are not supported on this platform; ignored");
    }
}

#[cfg(unix)]
mod unix_impl {
    use std::io;

    use tokio::process::Command;

    use super::ProcessLimits;

    cfg_if::cfg_if! {
        if #[cfg(all(target_os = "linux", target_env = "gnu"))] {
            type Resource = libc::__rlimit_resource_t;
        } else {
            type Resource = libc::c_int;
        }
    }

    pub fn attach(cmd: &mut Command, limits: ProcessLimits) {
        // SAFETY: the hook only calls async-signal-safe `setrlimit`.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(n) = limits.max_open_files {
                    set(libc::RLIMIT_NOFILE, n)?;
                }
                if let Some(bytes) = limits.max_file_size_bytes {
                    set(libc::RLIMIT_FSIZE, bytes)?;
                }
                if let Some(secs) = limits.max_cpu_seconds {
                    set(libc::RLIMIT_CPU, secs)?;
                }
                if limits.disable_core_dumps {
                    set(libc::RLIMIT_CORE, 0)?;
                }
                Ok(())
            });
        }
    }

    fn set(resource: Resource, value: u64) -> io::Result<()> {
        let rlim = libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };
        // SAFETY: `rlim` is a valid, initialized struct for the call.
        if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_from_task_parameters() {
        let limits: ProcessLimits =
            serde_json::from_value(serde_json::json!({"maxOpenFiles": 256, "disableCoreDumps": true}))
                .unwrap();
        assert_eq!(limits.max_open_files, Some(256));
        assert!(limits.disable_core_dumps);
        assert!(!limits.is_empty());
        assert!(ProcessLimits::default().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn limited_child_sees_its_cap() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("ulimit -n");
        attach_limits(
            &mut cmd,
            &ProcessLimits {
                max_open_files: Some(64),
                ..ProcessLimits::default()
            },
        );
        let out = cmd.output().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "64");
    }
}
