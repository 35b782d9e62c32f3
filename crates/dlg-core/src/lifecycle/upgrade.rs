use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use dlg_model::{DelegateId, UpgradeInfo};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::LifecycleState;
use crate::{manager::ManagerClient, system::now_millis};

/// Run scripts refreshed on every upgrade.
pub const RUN_SCRIPTS: [&str; 4] = ["start.sh", "stop.sh", "delegate.sh", "setup-proxy.sh"];

/// Entry prefixes of per-version artifacts in the work directory.
pub const VERSIONED_PREFIXES: [&str; 2] = ["backup.", "delegate-"];

/// Periodic check for a newer delegate version.
///
/// A positive answer stages the new run scripts and raises `upgrade_needed`;
/// the watcher performs the actual swap.
pub struct UpgradeCheck {
    delegate_id: DelegateId,
    version: String,
    manager: Arc<dyn ManagerClient>,
    flags: Arc<LifecycleState>,
    work_dir: PathBuf,
    timeout: Duration,
}

impl UpgradeCheck {
    pub fn new(
        delegate_id: impl Into<DelegateId>,
        version: impl Into<String>,
        manager: Arc<dyn ManagerClient>,
        flags: Arc<LifecycleState>,
        work_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            delegate_id: delegate_id.into(),
            version: version.into(),
            manager,
            flags,
            work_dir: work_dir.into(),
            timeout,
        }
    }

    pub async fn run(self, every: Duration, stop: CancellationToken) {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tick.tick() => {
                    self.check().await;
                }
            }
        }
        debug!("upgrade check stopped");
    }

    /// Returns the staged version when an upgrade was started.
    #[instrument(level = "debug", name = "upgrade_check", skip(self), fields(version = %self.version))]
    pub async fn check(&self) -> Option<String> {
        if self.flags.is_upgrade_pending() {
            debug!("upgrade already pending");
            return None;
        }

        let call = self.manager.upgrade_info(&self.delegate_id, &self.version);
        let info = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                warn!(error = %e, "unable to check for upgrade");
                return None;
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "timed out checking for upgrade");
                return None;
            }
        };

        if !info.do_upgrade {
            debug!("delegate is up to date");
            return None;
        }

        info!(next = %info.version, "upgrading delegate");
        self.flags.mark_upgrade_pending(now_millis(), &info.version);
        match stage_scripts(&self.work_dir, &info).await {
            Ok(()) => {
                self.flags.set_upgrade_needed(true);
                Some(info.version)
            }
            Err(e) => {
                error!(error = %e, "failed to stage upgrade scripts; upgrade abandoned");
                self.flags.abandon_upgrade();
                None
            }
        }
    }
}

/// Replace the run scripts in `work_dir` with the ones shipped in `info`.
pub async fn stage_scripts(work_dir: &Path, info: &UpgradeInfo) -> io::Result<()> {
    for name in RUN_SCRIPTS {
        let path = work_dir.join(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let Some(script) = info.script(name) else {
            warn!(script = name, "upgrade carries no content for script; not replaced");
            continue;
        };
        tokio::fs::write(&path, script).await?;
        make_executable(&path).await?;
        info!(script = name, "script staged");
    }
    Ok(())
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o744)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Delete per-version artifacts that belong to neither `current` nor `next`.
pub fn cleanup_versions(work_dir: &Path, current: &str, next: Option<&str>) -> io::Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(work_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        if !VERSIONED_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        if name.contains(current) || next.is_some_and(|n| name.contains(n)) {
            continue;
        }

        let path = entry.path();
        let res = if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match res {
            Ok(()) => {
                info!(path = %path.display(), "removed old version artifact");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove old version artifact"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[tokio::test]
    async fn staging_replaces_scripts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("start.sh"), "old").unwrap();
        std::fs::write(dir.path().join("stop.sh"), "old").unwrap();

        let info = UpgradeInfo {
            do_upgrade: true,
            version: "1.0.2".into(),
            scripts: HashMap::from([
                ("start.sh".to_string(), "#!/bin/sh\necho start\n".to_string()),
                ("stop.sh".to_string(), String::new()),
            ]),
        };
        stage_scripts(dir.path(), &info).await.unwrap();

        let start = std::fs::read_to_string(dir.path().join("start.sh")).unwrap();
        assert!(start.contains("echo start"));
        assert!(!dir.path().join("stop.sh").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("start.sh")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o744);
        }
    }

    #[test]
    fn cleanup_keeps_current_and_next() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["backup.1.0.0", "backup.1.0.1", "delegate-1.0.2", "config.yml"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("delegate-0.9.jar"), "x").unwrap();

        let removed = cleanup_versions(dir.path(), "1.0.1", Some("1.0.2")).unwrap();
        assert_eq!(removed, 2);

        assert!(!dir.path().join("backup.1.0.0").exists());
        assert!(!dir.path().join("delegate-0.9.jar").exists());
        assert!(dir.path().join("backup.1.0.1").exists());
        assert!(dir.path().join("delegate-1.0.2").exists());
        assert!(dir.path().join("config.yml").exists());
    }
}
