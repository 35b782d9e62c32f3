use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dlg_model::{EpochMillis, LocalStatus, WatcherStatus};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::Liveness;
use crate::{
    config::HeartbeatConfig,
    lifecycle::LifecycleState,
    local::{LocalChannel, WatcherControl},
    state::InFlight,
    system::now_millis,
};

/// Publishes status to the watcher and restarts the watcher when it goes quiet
/// or keeps running the wrong version.
pub struct LocalHeartbeat {
    channel: Arc<dyn LocalChannel>,
    watcher: Arc<dyn WatcherControl>,
    flags: Arc<LifecycleState>,
    liveness: Arc<Liveness>,
    flights: InFlight,
    version: String,
    expected_watcher: Option<String>,
    cfg: HeartbeatConfig,
    started_at: EpochMillis,
    version_matched_at: AtomicU64,
    first_beat: AtomicBool,
    restarting: AtomicBool,
}

impl LocalHeartbeat {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: Arc<dyn LocalChannel>,
        watcher: Arc<dyn WatcherControl>,
        flags: Arc<LifecycleState>,
        liveness: Arc<Liveness>,
        flights: InFlight,
        version: impl Into<String>,
        expected_watcher: Option<String>,
        cfg: HeartbeatConfig,
    ) -> Self {
        let now = now_millis();
        Self {
            channel,
            watcher,
            flags,
            liveness,
            flights,
            version: version.into(),
            expected_watcher,
            cfg,
            started_at: now,
            version_matched_at: AtomicU64::new(now),
            first_beat: AtomicBool::new(true),
            restarting: AtomicBool::new(false),
        }
    }

    /// Status snapshot at `now`.
    pub fn status(&self, now: EpochMillis) -> LocalStatus {
        if self.flags.is_self_destructing() {
            return LocalStatus::self_destructing();
        }
        let stopped_at = self.flags.stopped_acquiring_at();
        let upgrade_at = self.flags.upgrade_started_at();
        let restart_needed =
            self.flags.is_restart_needed() || self.liveness.is_stale(now, self.cfg.stale_after);

        LocalStatus {
            heartbeat: Some(now),
            version: Some(self.version.clone()),
            is_new: self.first_beat.load(Ordering::SeqCst),
            restart_needed,
            upgrade_needed: self.flags.is_upgrade_needed(),
            upgrade_pending: self.flags.is_upgrade_pending(),
            shutdown_pending: !self.flags.is_acquiring(),
            upgrade_started: (upgrade_at > 0).then_some(upgrade_at),
            shutdown_started: (stopped_at > 0).then_some(stopped_at),
            self_destruct: false,
        }
    }

    /// Publish the current status right away.
    pub async fn publish(&self) {
        let status = self.status(now_millis());
        match self.channel.publish(&status).await {
            Ok(()) => {
                self.first_beat.store(false, Ordering::SeqCst);
            }
            Err(e) => warn!(error = %e, "failed to publish local status"),
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.cfg.local_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => Arc::clone(&self).beat().await,
            }
        }
        debug!("local heartbeat stopped");
    }

    #[instrument(level = "debug", name = "local_heartbeat", skip(self))]
    pub async fn beat(self: Arc<Self>) {
        self.publish().await;
        if self.flags.is_self_destructing() {
            return;
        }

        let now = now_millis();
        match self.channel.watcher().await {
            Ok(w) => {
                if let Some(reason) = self.watcher_problem(&w, now) {
                    Arc::clone(&self).spawn_restart(reason, w.process);
                }
            }
            Err(e) => warn!(error = %e, "unable to read watcher status"),
        }

        let counts = self.flights.counts();
        if counts.validating + counts.executing > 0 {
            info!(
                validating = counts.validating,
                executing = counts.executing,
                tasks = ?self.flights.executing_ids(),
                "tasks in flight"
            );
        }
    }

    /// Why the watcher needs a restart, if it does.
    pub fn watcher_problem(&self, w: &WatcherStatus, now: EpochMillis) -> Option<&'static str> {
        let beat = w.heartbeat.unwrap_or(self.started_at);
        if elapsed(now, beat) > self.cfg.watcher_heartbeat_timeout {
            return Some("watcher heartbeat timed out");
        }

        let expected = self.expected_watcher.as_deref()?;
        if w.version.as_deref() == Some(expected) {
            self.version_matched_at.store(now, Ordering::SeqCst);
            return None;
        }
        let matched_at = self.version_matched_at.load(Ordering::SeqCst);
        (elapsed(now, matched_at) > self.cfg.watcher_version_timeout).then_some("watcher version mismatch")
    }

    fn spawn_restart(self: Arc<Self>, reason: &'static str, process: Option<String>) {
        if self.restarting.swap(true, Ordering::SeqCst) {
            debug!("watcher restart already in progress");
            return;
        }
        warn!(reason, process = ?process, "restarting watcher");
        tokio::spawn(async move {
            self.restart_watcher(process).await;
            self.restarting.store(false, Ordering::SeqCst);
        });
    }

    async fn restart_watcher(&self, process: Option<String>) {
        if let Some(pid) = process.as_deref().filter(|p| !p.is_empty())
            && let Err(e) = self.watcher.kill(pid).await
        {
            warn!(pid, error = %e, "failed to kill watcher");
        }
        tokio::time::sleep(self.cfg.watcher_restart_settle).await;

        let now = now_millis();
        if let Err(e) = self.channel.touch_watcher(now).await {
            warn!(error = %e, "failed to reset watcher heartbeat");
        }
        self.version_matched_at.store(now, Ordering::SeqCst);

        match self.watcher.relaunch().await {
            Ok(()) => info!("watcher relaunched"),
            Err(e) => error!(error = %e, "failed to relaunch watcher"),
        }
    }
}

fn elapsed(now: EpochMillis, since: EpochMillis) -> Duration {
    Duration::from_millis(now.saturating_sub(since))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use dlg_model::LocalCommand;

    use super::*;
    use crate::local::ChannelError;

    #[derive(Default)]
    struct Memory {
        published: Mutex<Vec<LocalStatus>>,
        watcher: Mutex<WatcherStatus>,
    }

    #[async_trait]
    impl LocalChannel for Memory {
        async fn announce_started(&self) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn publish(&self, status: &LocalStatus) -> Result<(), ChannelError> {
            self.published.lock().unwrap().push(status.clone());
            Ok(())
        }
        async fn watcher(&self) -> Result<WatcherStatus, ChannelError> {
            Ok(self.watcher.lock().unwrap().clone())
        }
        async fn touch_watcher(&self, heartbeat: EpochMillis) -> Result<(), ChannelError> {
            self.watcher.lock().unwrap().heartbeat = Some(heartbeat);
            Ok(())
        }
        async fn take_commands(&self) -> Result<Vec<LocalCommand>, ChannelError> {
            Ok(Vec::new())
        }
        async fn close(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Control {
        killed: Mutex<Vec<String>>,
        relaunched: AtomicU64,
    }

    #[async_trait]
    impl WatcherControl for Control {
        async fn kill(&self, process: &str) -> std::io::Result<()> {
            self.killed.lock().unwrap().push(process.to_string());
            Ok(())
        }
        async fn relaunch(&self) -> std::io::Result<()> {
            self.relaunched.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn heartbeat(
        channel: Arc<Memory>,
        control: Arc<Control>,
        flags: Arc<LifecycleState>,
        expected: Option<&str>,
    ) -> Arc<LocalHeartbeat> {
        let cfg = HeartbeatConfig {
            watcher_heartbeat_timeout: Duration::from_millis(1_000),
            watcher_version_timeout: Duration::from_millis(500),
            watcher_restart_settle: Duration::from_millis(1),
            ..HeartbeatConfig::default()
        };
        Arc::new(LocalHeartbeat::new(
            channel,
            control,
            flags,
            Arc::new(Liveness::new(now_millis())),
            InFlight::new(),
            "1.0.0",
            expected.map(str::to_string),
            cfg,
        ))
    }

    #[test]
    fn status_mirrors_flags() {
        let flags = Arc::new(LifecycleState::new());
        let hb = heartbeat(Default::default(), Default::default(), flags.clone(), None);

        flags.stop_acquiring(1234);
        let s = hb.status(now_millis());
        assert!(s.shutdown_pending);
        assert_eq!(s.shutdown_started, Some(1234));
        assert!(s.is_new);
        assert!(!s.restart_needed);

        flags.initiate_self_destruct();
        assert_eq!(hb.status(now_millis()), LocalStatus::self_destructing());
    }

    #[test]
    fn watcher_problems() {
        let hb = heartbeat(Default::default(), Default::default(), Arc::new(LifecycleState::new()), Some("2.0"));
        let now = now_millis();

        let quiet = WatcherStatus {
            heartbeat: Some(now - 5_000),
            version: Some("2.0".into()),
            process: None,
        };
        assert_eq!(hb.watcher_problem(&quiet, now), Some("watcher heartbeat timed out"));

        let healthy = WatcherStatus {
            heartbeat: Some(now),
            ..quiet.clone()
        };
        assert_eq!(hb.watcher_problem(&healthy, now), None);

        let old = WatcherStatus {
            version: Some("1.9".into()),
            ..healthy
        };
        assert_eq!(hb.watcher_problem(&old, now + 100), None);
        assert_eq!(hb.watcher_problem(&old, now + 600), Some("watcher version mismatch"));
    }

    #[tokio::test]
    async fn stale_watcher_is_killed_and_relaunched() {
        let channel = Arc::new(Memory::default());
        *channel.watcher.lock().unwrap() = WatcherStatus {
            heartbeat: Some(1),
            version: None,
            process: Some("4242".into()),
        };
        let control = Arc::new(Control::default());
        let hb = heartbeat(channel.clone(), control.clone(), Arc::new(LifecycleState::new()), None);

        Arc::clone(&hb).beat().await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while control.relaunched.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(*control.killed.lock().unwrap(), vec!["4242".to_string()]);
        assert!(channel.watcher.lock().unwrap().heartbeat.unwrap() > 1);
        assert_eq!(channel.published.lock().unwrap().len(), 1);
        assert!(!hb.status(now_millis()).is_new);
    }
}
