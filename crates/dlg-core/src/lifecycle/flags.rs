use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use dlg_model::EpochMillis;

/// Process-wide lifecycle flags, shared by every loop of the engine.
///
/// Transitions are single atomic operations; `acquire_tasks` only comes back
/// through [`LifecycleState::resume`].
#[derive(Debug)]
pub struct LifecycleState {
    acquire_tasks: AtomicBool,
    upgrade_pending: AtomicBool,
    upgrade_needed: AtomicBool,
    restart_needed: AtomicBool,
    self_destruct: AtomicBool,
    upgrade_started_at: AtomicU64,
    stopped_acquiring_at: AtomicU64,
    upgrade_version: Mutex<Option<String>>,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleState {
    pub fn new() -> Self {
        Self {
            acquire_tasks: AtomicBool::new(true),
            upgrade_pending: AtomicBool::new(false),
            upgrade_needed: AtomicBool::new(false),
            restart_needed: AtomicBool::new(false),
            self_destruct: AtomicBool::new(false),
            upgrade_started_at: AtomicU64::new(0),
            stopped_acquiring_at: AtomicU64::new(0),
            upgrade_version: Mutex::new(None),
        }
    }

    #[inline]
    pub fn is_acquiring(&self) -> bool {
        self.acquire_tasks.load(Ordering::SeqCst)
    }

    /// Whether a new event of the given kind may be taken on.
    ///
    /// Async work is refused while an upgrade is pending since it would outlive
    /// the current binary.
    pub fn may_acquire(&self, sync: bool) -> bool {
        self.is_acquiring() && (sync || !self.is_upgrade_pending())
    }

    /// Stop taking new tasks. Returns `true` only for the call that flipped the flag.
    pub fn stop_acquiring(&self, now: EpochMillis) -> bool {
        let was = self.acquire_tasks.swap(false, Ordering::SeqCst);
        if was {
            self.stopped_acquiring_at.store(now, Ordering::SeqCst);
        }
        was
    }

    pub fn resume(&self) {
        self.upgrade_pending.store(false, Ordering::SeqCst);
        self.upgrade_needed.store(false, Ordering::SeqCst);
        self.restart_needed.store(false, Ordering::SeqCst);
        self.stopped_acquiring_at.store(0, Ordering::SeqCst);
        self.acquire_tasks.store(true, Ordering::SeqCst);
    }

    /// Returns `true` only for the first call.
    pub fn initiate_self_destruct(&self) -> bool {
        self.acquire_tasks.store(false, Ordering::SeqCst);
        !self.self_destruct.swap(true, Ordering::SeqCst)
    }

    #[inline]
    pub fn is_self_destructing(&self) -> bool {
        self.self_destruct.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_upgrade_pending(&self) -> bool {
        self.upgrade_pending.load(Ordering::SeqCst)
    }

    pub fn mark_upgrade_pending(&self, now: EpochMillis, version: &str) {
        self.upgrade_started_at.store(now, Ordering::SeqCst);
        *self
            .upgrade_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(version.to_string());
        self.upgrade_pending.store(true, Ordering::SeqCst);
    }

    /// Forget a staged upgrade that could not be completed.
    pub fn abandon_upgrade(&self) {
        self.upgrade_pending.store(false, Ordering::SeqCst);
        self.upgrade_needed.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_upgrade_needed(&self) -> bool {
        self.upgrade_needed.load(Ordering::SeqCst)
    }

    pub fn set_upgrade_needed(&self, needed: bool) {
        self.upgrade_needed.store(needed, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_restart_needed(&self) -> bool {
        self.restart_needed.load(Ordering::SeqCst)
    }

    pub fn set_restart_needed(&self, needed: bool) {
        self.restart_needed.store(needed, Ordering::SeqCst);
    }

    pub fn upgrade_version(&self) -> Option<String> {
        self.upgrade_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Epoch millis of the last upgrade start, 0 if none.
    pub fn upgrade_started_at(&self) -> EpochMillis {
        self.upgrade_started_at.load(Ordering::SeqCst)
    }

    /// Epoch millis at which acquisition stopped, 0 while acquiring.
    pub fn stopped_acquiring_at(&self) -> EpochMillis {
        self.stopped_acquiring_at.load(Ordering::SeqCst)
    }
}
