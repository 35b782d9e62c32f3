use std::{future::Future, sync::Arc};

use dlg_model::{PoolKind, TaskId};
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PoolConfig;

/// Running unit of work submitted to a [`WorkerPool`].
///
/// The join output is `None` when the work was cancelled before it got a permit.
#[derive(Debug)]
pub struct TaskHandle<T> {
    task_id: TaskId,
    cancel: CancellationToken,
    join: JoinHandle<Option<T>>,
}

impl<T> TaskHandle<T> {
    #[inline]
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    #[inline]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub(crate) fn join_mut(&mut self) -> &mut JoinHandle<Option<T>> {
        &mut self.join
    }

    /// Wait for the work and flatten cancellation and panics into `None`.
    pub async fn join(self) -> Option<T> {
        match self.join.await {
            Ok(out) => out,
            Err(e) => {
                warn!(task = %self.task_id, error = %e, "pooled work did not complete");
                None
            }
        }
    }
}

/// Bounded executor: at most `size` submissions run at once, the rest queue
/// on the semaphore in submission order.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Submit work that is handed its own cancellation token.
    pub fn submit<F, Fut>(&self, task_id: &TaskId, cancel: CancellationToken, work: F) -> TaskHandle<Fut::Output>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let token = cancel.clone();
        let pool = self.name;
        let id = task_id.clone();

        let join = tokio::spawn(async move {
            let _permit = tokio::select! {
                _ = token.cancelled() => {
                    debug!(pool, task = %id, "cancelled while queued");
                    return None;
                }
                permit = permits.acquire_owned() => permit.ok()?,
            };
            Some(work(token).await)
        });

        TaskHandle {
            task_id: task_id.clone(),
            cancel,
            join,
        }
    }

    /// Submit only if `claim` accepts the fresh cancellation token.
    ///
    /// `claim` runs synchronously before anything is spawned, which makes it
    /// the place to record the task as in flight.
    pub fn submit_claimed<C, F, Fut>(&self, task_id: &TaskId, claim: C, work: F) -> Option<TaskHandle<Fut::Output>>
    where
        C: FnOnce(&CancellationToken) -> bool,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let cancel = CancellationToken::new();
        if !claim(&cancel) {
            return None;
        }
        Some(self.submit(task_id, cancel, work))
    }
}

/// The four pools a delegate runs work on.
#[derive(Debug, Clone)]
pub struct ExecutionPools {
    validation: WorkerPool,
    sync: WorkerPool,
    asynchronous: WorkerPool,
    artifact: WorkerPool,
}

impl ExecutionPools {
    pub fn new(cfg: &PoolConfig) -> Self {
        Self {
            validation: WorkerPool::new("validation", cfg.validation),
            sync: WorkerPool::new("sync", cfg.sync),
            asynchronous: WorkerPool::new("async", cfg.asynchronous),
            artifact: WorkerPool::new("artifact", cfg.artifact),
        }
    }

    #[inline]
    pub fn validation(&self) -> &WorkerPool {
        &self.validation
    }

    pub fn for_kind(&self, kind: PoolKind) -> &WorkerPool {
        match kind {
            PoolKind::Sync => &self.sync,
            PoolKind::Async => &self.asynchronous,
            PoolKind::Artifact => &self.artifact,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn refused_claim_spawns_nothing() {
        let pool = WorkerPool::new("sync", 2);
        let handle = pool.submit_claimed(&TaskId::from("t1"), |_| false, |_| async { 1 });
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let pool = WorkerPool::new("artifact", 1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..3 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(pool.submit(&TaskId::new(format!("t{i}")), CancellationToken::new(), move |_| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            assert!(h.join().await.is_some());
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_while_queued_yields_none() {
        let pool = WorkerPool::new("sync", 1);
        let blocker = pool.submit(&TaskId::from("a"), CancellationToken::new(), |_| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let cancel = CancellationToken::new();
        let queued = pool.submit(&TaskId::from("b"), cancel.clone(), |_| async { 7 });
        cancel.cancel();

        assert_eq!(queued.join().await, None);
        assert!(blocker.join().await.is_some());
    }

    #[test]
    fn pools_follow_task_kind() {
        let pools = ExecutionPools::new(&PoolConfig::default());
        assert_eq!(pools.for_kind(PoolKind::Async).name(), "async");
        assert_eq!(pools.for_kind(PoolKind::Artifact).name(), "artifact");
        assert_eq!(pools.validation().name(), "validation");
    }
}
