//! Engine tuning knobs.
//!
//! Defaults follow the timings the manager side expects from a delegate:
//! a 3s poll cadence, 10s local heartbeat, 30s timeout grace and a 2h drain.

use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub dispatch: DispatchConfig,
    pub pools: PoolConfig,
    pub timeouts: TimeoutConfig,
    pub source: SourceConfig,
    pub heartbeat: HeartbeatConfig,
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Acquire throttle per in-flight task.
    pub acquire_step: Duration,
    /// Load beyond this does not grow the throttle.
    pub acquire_load_cap: usize,
    /// Wait before asking the manager to fail a task nobody validated.
    pub fail_check_delay: Duration,
    /// Upper bound for a single capability criterion.
    pub probe_timeout: Duration,
    pub report_retries: u32,
    pub report_retry_delay: Duration,
    /// Upper bound for all report attempts together.
    pub report_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            acquire_step: Duration::from_millis(100),
            acquire_load_cap: 10,
            fail_check_delay: Duration::from_secs(6),
            probe_timeout: Duration::from_secs(30),
            report_retries: 3,
            report_retry_delay: Duration::from_millis(200),
            report_timeout: Duration::from_secs(30),
        }
    }
}

/// Concurrency limit of every execution pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub validation: usize,
    pub sync: usize,
    pub asynchronous: usize,
    pub artifact: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            validation: 32,
            sync: 64,
            asynchronous: 32,
            artifact: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Added to the task budget before cancellation.
    pub grace: Duration,
    /// Cadence of the "still running" progress log.
    pub poll: Duration,
    /// How long a cancelled task may take to wind down.
    pub final_join: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
            poll: Duration::from_secs(5),
            final_join: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Pull cadence while no push channel is open.
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    /// First reconnect pause; doubles per failure up to `reconnect_max_pause`.
    pub reconnect_pause: Duration,
    pub reconnect_max_pause: Duration,
    /// Consecutive failed connects before a restart is requested.
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            poll_timeout: Duration::from_secs(15),
            reconnect_pause: Duration::from_secs(10),
            reconnect_max_pause: Duration::from_secs(300),
            max_reconnect_attempts: Some(50),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub remote_interval: Duration,
    pub send_timeout: Duration,
    pub local_interval: Duration,
    /// Restart is requested when the manager has been silent this long.
    pub stale_after: Duration,
    pub watcher_heartbeat_timeout: Duration,
    pub watcher_version_timeout: Duration,
    /// Pause between killing the watcher and relaunching it.
    pub watcher_restart_settle: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            remote_interval: Duration::from_secs(60),
            send_timeout: Duration::from_secs(15),
            local_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(15 * 60),
            watcher_heartbeat_timeout: Duration::from_secs(10 * 60),
            watcher_version_timeout: Duration::from_secs(2 * 60),
            watcher_restart_settle: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub work_dir: PathBuf,
    pub registration_retry: Duration,
    /// `None` disables the periodic upgrade check.
    pub upgrade_interval: Option<Duration>,
    pub upgrade_timeout: Duration,
    pub drain_timeout: Duration,
    pub drain_poll: Duration,
    pub command_poll: Duration,
    /// Whether a watcher process supervises this delegate.
    pub watched: bool,
    pub watcher_version: Option<String>,
    pub go_ahead_timeout: Duration,
    /// Terminate once a drain finishes instead of idling paused.
    pub exit_when_drained: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            registration_retry: Duration::from_secs(60),
            upgrade_interval: None,
            upgrade_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(2 * 60 * 60),
            drain_poll: Duration::from_secs(1),
            command_poll: Duration::from_secs(1),
            watched: false,
            watcher_version: None,
            go_ahead_timeout: Duration::from_secs(5 * 60),
            exit_when_drained: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_check_waits_longer_than_one_poll() {
        let cfg = EngineConfig::default();
        assert!(cfg.dispatch.fail_check_delay > cfg.source.poll_interval);
    }

    #[test]
    fn upgrade_check_is_opt_in() {
        assert!(LifecycleConfig::default().upgrade_interval.is_none());
    }
}
