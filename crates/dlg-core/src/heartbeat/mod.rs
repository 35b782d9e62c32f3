//! Liveness signals: remote heartbeats to the manager, local ones to the watcher.

mod local;
mod remote;

pub use local::LocalHeartbeat;
pub use remote::RemoteHeartbeat;

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use dlg_model::EpochMillis;

/// When heartbeats were last sent to and heard back from the manager.
#[derive(Debug)]
pub struct Liveness {
    last_sent: AtomicU64,
    last_received: AtomicU64,
}

impl Liveness {
    /// Both clocks start at `now` so a fresh delegate is not considered stale.
    pub fn new(now: EpochMillis) -> Self {
        Self {
            last_sent: AtomicU64::new(now),
            last_received: AtomicU64::new(now),
        }
    }

    pub fn sent(&self, at: EpochMillis) {
        self.last_sent.store(at, Ordering::SeqCst);
    }

    pub fn received(&self, at: EpochMillis) {
        self.last_received.store(at, Ordering::SeqCst);
    }

    pub fn last_sent(&self) -> EpochMillis {
        self.last_sent.load(Ordering::SeqCst)
    }

    pub fn last_received(&self) -> EpochMillis {
        self.last_received.load(Ordering::SeqCst)
    }

    /// Stale once either direction has been quiet for longer than `after`.
    pub fn is_stale(&self, now: EpochMillis, after: Duration) -> bool {
        let after = after.as_millis() as u64;
        let oldest = self.last_sent().min(self.last_received());
        now.saturating_sub(oldest) > after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_when_either_side_is_quiet() {
        let l = Liveness::new(1_000);
        let window = Duration::from_millis(500);
        assert!(!l.is_stale(1_400, window));

        l.sent(1_400);
        assert!(l.is_stale(1_600, window));

        l.received(1_500);
        assert!(!l.is_stale(1_600, window));
    }
}
