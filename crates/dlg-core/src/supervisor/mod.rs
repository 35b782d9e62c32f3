use std::time::Duration;

use dlg_model::Task;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::{config::TimeoutConfig, pool::TaskHandle};

/// How a supervised task ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Verdict<T> {
    Finished(T),
    Panicked(String),
    /// Cancelled by someone else before it produced output.
    Cancelled,
    /// Exceeded its budget plus grace and was cancelled.
    TimedOut { budget: Duration },
}

/// Enforces per-task wall-clock budgets.
#[derive(Debug, Clone)]
pub struct TimeoutSupervisor {
    grace: Duration,
    poll: Duration,
    final_join: Duration,
}

impl TimeoutSupervisor {
    pub fn new(cfg: &TimeoutConfig) -> Self {
        Self {
            grace: cfg.grace,
            poll: cfg.poll.max(Duration::from_millis(1)),
            final_join: cfg.final_join,
        }
    }

    /// The declared budget of a task.
    #[inline]
    pub fn budget_of(task: &Task) -> Duration {
        Duration::from_millis(task.timeout_ms)
    }

    /// Wait for `handle`, cancelling it once `budget` plus grace has elapsed.
    ///
    /// The task is never cancelled before `budget` expires.
    #[instrument(level = "debug", skip(self, handle), fields(task = %handle.task_id()))]
    pub async fn watch<T>(&self, budget: Duration, mut handle: TaskHandle<T>) -> Verdict<T> {
        let started = Instant::now();
        let deadline = started + budget + self.grace;

        let mut tick = tokio::time::interval_at(started + self.poll, self.poll);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                joined = handle.join_mut() => return Self::verdict(joined),
                _ = tokio::time::sleep_until(deadline) => break,
                _ = tick.tick() => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    debug!(remaining_ms = left.as_millis() as u64, "task still running");
                }
            }
        }

        warn!(?budget, grace = ?self.grace, "task exceeded its time budget; cancelling");
        handle.cancel_token().cancel();

        match tokio::time::timeout(self.final_join, handle.join_mut()).await {
            Ok(_) => info!("timed out task wound down"),
            Err(_) => {
                handle.join_mut().abort();
                error!(final_join = ?self.final_join, "task did not stop after cancellation; aborted");
            }
        }
        Verdict::TimedOut { budget }
    }

    fn verdict<T>(joined: Result<Option<T>, tokio::task::JoinError>) -> Verdict<T> {
        match joined {
            Ok(Some(out)) => Verdict::Finished(out),
            Ok(None) => Verdict::Cancelled,
            Err(e) if e.is_panic() => Verdict::Panicked(panic_message(e.into_panic())),
            Err(_) => Verdict::Cancelled,
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
