//! Task state machine: event -> acquire -> validate -> execute -> report.

use std::{cmp, sync::Arc, time::Duration};

use dlg_model::{
    DelegateId, Task, TaskEvent, TaskId, TaskResponse, ValidationResult,
};
use serde_json::Value;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::{
    config::{DispatchConfig, EngineConfig},
    lifecycle::LifecycleState,
    manager::ManagerClient,
    pool::ExecutionPools,
    prober::CapabilityProber,
    router::RunnerRouter,
    runner::{RunContext, RunnerError},
    state::{Admission, InFlight, Stage},
    supervisor::{TimeoutSupervisor, Verdict},
};

/// Turns task events into executed and reported tasks.
///
/// Cheap to clone; every clone drives the same in-flight table.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    delegate_id: DelegateId,
    manager: Arc<dyn ManagerClient>,
    router: Arc<RunnerRouter>,
    prober: CapabilityProber,
    pools: ExecutionPools,
    timeouts: TimeoutSupervisor,
    flights: InFlight,
    flags: Arc<LifecycleState>,
    cfg: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        delegate_id: impl Into<DelegateId>,
        manager: Arc<dyn ManagerClient>,
        router: Arc<RunnerRouter>,
        flags: Arc<LifecycleState>,
        cfg: &EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                delegate_id: delegate_id.into(),
                prober: CapabilityProber::new(Arc::clone(&router), cfg.dispatch.probe_timeout),
                manager,
                router,
                pools: ExecutionPools::new(&cfg.pools),
                timeouts: TimeoutSupervisor::new(&cfg.timeouts),
                flights: InFlight::new(),
                flags,
                cfg: cfg.dispatch.clone(),
            }),
        }
    }

    #[inline]
    pub fn delegate_id(&self) -> &str {
        &self.inner.delegate_id
    }

    #[inline]
    pub fn in_flight(&self) -> &InFlight {
        &self.inner.flights
    }

    /// Entry point for every inbound task event.
    #[instrument(level = "info", name = "task_event", skip_all, fields(task = %event.task_id, sync = event.sync))]
    pub async fn handle(&self, event: TaskEvent) {
        if event.abort {
            self.abort(&event.task_id);
        } else {
            self.dispatch(event).await;
        }
    }

    /// Cancel and forget a task wherever it is. Idempotent.
    pub fn abort(&self, id: &TaskId) -> bool {
        let removed = self.inner.flights.abort(id);
        if removed.is_empty() {
            debug!(task = %id, "abort for a task that is not in flight");
            false
        } else {
            info!(task = %id, stages = ?removed, "task aborted");
            true
        }
    }

    async fn dispatch(&self, event: TaskEvent) {
        let inner = &self.inner;
        let id = &event.task_id;

        if id.is_empty() {
            warn!("task event without an id; ignoring");
            return;
        }
        if !inner.flags.may_acquire(event.sync) {
            if inner.flags.is_acquiring() {
                info!("upgrade pending; not taking async tasks");
            } else {
                info!("not accepting tasks");
            }
            return;
        }
        if let Some(stage) = inner.flights.stage_of(id) {
            info!(%stage, "task already in flight; ignoring duplicate event");
            return;
        }

        let delay = self.acquire_delay();
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "throttling acquisition");
            tokio::time::sleep(delay).await;
        }

        let task = match inner.manager.acquire_task(&inner.delegate_id, id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                info!("task no longer available");
                return;
            }
            Err(e) => {
                error!(error = %e, "unable to acquire task");
                return;
            }
        };

        if task.is_whitelisted_for(&inner.delegate_id) {
            info!("task assigned to this delegate; executing");
            self.execute(Arc::new(task));
        } else if task.is_unassigned() {
            self.validate(Arc::new(task));
        } else {
            info!(assignee = ?task.assigned_delegate_id, "task assigned elsewhere; ignoring");
        }
    }

    /// Throttle that grows with the number of tasks in flight.
    fn acquire_delay(&self) -> Duration {
        let load = cmp::min(self.inner.flights.load(), self.inner.cfg.acquire_load_cap);
        self.inner.cfg.acquire_step * load as u32
    }

    fn validate(&self, task: Arc<Task>) {
        let inner = &self.inner;
        let mut ticket = 0;
        let prober = inner.prober.clone();
        let probed = Arc::clone(&task);

        let handle = inner.pools.validation().submit_claimed(
            &task.id,
            |cancel| {
                let gate = || inner.flags.may_acquire(!task.is_async);
                match inner.flights.admit(Stage::Validating, Arc::clone(&task), cancel.clone(), gate) {
                    Admission::Admitted(t) => {
                        ticket = t;
                        true
                    }
                    Admission::Duplicate(stage) => {
                        info!(%stage, "task already in flight; not validating");
                        false
                    }
                    Admission::Closed => {
                        info!("not accepting tasks; validation skipped");
                        false
                    }
                }
            },
            move |cancel| async move { prober.probe(&probed, cancel).await },
        );
        let Some(handle) = handle else { return };
        info!("task submitted for validation");

        let this = self.clone();
        let span = info_span!("validation", task = %task.id);
        tokio::spawn(
            async move {
                let results = handle.join().await.unwrap_or_default();
                this.after_validation(task, ticket, results).await;
            }
            .instrument(span),
        );
    }

    async fn after_validation(&self, task: Arc<Task>, ticket: u64, results: Vec<ValidationResult>) {
        let inner = &self.inner;
        if inner.flights.finish_validation(&task.id, ticket).is_none() {
            debug!("validation result discarded; task was aborted");
            return;
        }

        let validated = ValidationResult::any_validated(&results);
        info!(validated, criteria = results.len(), "task validation finished");

        match inner
            .manager
            .report_validation(&inner.delegate_id, &task.id, &results)
            .await
        {
            Ok(Some(assigned)) if assigned.is_whitelisted_for(&inner.delegate_id) => {
                info!("got the go-ahead for the task");
                self.execute(Arc::new(assigned));
            }
            Ok(Some(assigned)) => {
                info!(assignee = ?assigned.assigned_delegate_id, "task went to another delegate");
            }
            Ok(None) if validated => info!("task validated but not assigned"),
            Ok(None) => {
                info!(delay = ?inner.cfg.fail_check_delay, "task rejected; checking whether anyone can run it");
                tokio::time::sleep(inner.cfg.fail_check_delay).await;
                match inner
                    .manager
                    .fail_if_all_rejected(&inner.delegate_id, &task.id)
                    .await
                {
                    Ok(true) => info!("task failed since all delegates rejected it"),
                    Ok(false) => debug!("task still has candidates"),
                    Err(e) => error!(error = %e, "unable to check task rejections"),
                }
            }
            Err(e) => error!(error = %e, "unable to report validation results"),
        }
    }

    /// Run a task assigned to this delegate. Returns `false` when it was not admitted.
    fn execute(&self, task: Arc<Task>) -> bool {
        let inner = &self.inner;
        let pool = inner.pools.for_kind(task.pool_kind());
        let mut ticket = 0;
        let router = Arc::clone(&inner.router);
        let delegate_id = inner.delegate_id.clone();
        let running = Arc::clone(&task);

        let handle = pool.submit_claimed(
            &task.id,
            |cancel| {
                let gate = || inner.flags.may_acquire(!task.is_async);
                match inner.flights.admit(Stage::Executing, Arc::clone(&task), cancel.clone(), gate) {
                    Admission::Admitted(t) => {
                        ticket = t;
                        true
                    }
                    Admission::Duplicate(stage) => {
                        info!(%stage, "task already executing");
                        false
                    }
                    Admission::Closed => {
                        info!("not accepting tasks; execution skipped");
                        false
                    }
                }
            },
            move |cancel| async move {
                router
                    .run(&running, RunContext { delegate_id, cancel })
                    .await
            },
        );
        let Some(handle) = handle else {
            return false;
        };
        info!(pool = pool.name(), "task submitted for execution");

        let this = self.clone();
        let budget = TimeoutSupervisor::budget_of(&task);
        let span = info_span!("execution", task = %task.id, kind = %task.task_type);
        tokio::spawn(
            async move {
                let verdict = this.inner.timeouts.watch(budget, handle).await;
                this.finish(&task, ticket, verdict).await;
            }
            .instrument(span),
        );
        true
    }

    async fn finish(&self, task: &Task, ticket: u64, verdict: Verdict<Result<Value, RunnerError>>) {
        let inner = &self.inner;
        let id = &task.id;

        if !inner.flights.begin_report(id, ticket) {
            info!("task was aborted; outcome not reported");
            return;
        }

        let response = match verdict {
            Verdict::Finished(Ok(data)) => TaskResponse::success(id.clone(), data),
            Verdict::Finished(Err(e)) => TaskResponse::failure(id.clone(), e.to_string()),
            Verdict::Panicked(msg) => TaskResponse::failure(id.clone(), format!("task panicked: {msg}")),
            Verdict::Cancelled => TaskResponse::failure(id.clone(), RunnerError::Cancelled.to_string()),
            Verdict::TimedOut { budget } => TaskResponse::timeout(id.clone(), budget.as_millis() as u64),
        };
        info!(status = ?response.status, "task completed");

        self.report(&response).await;
        inner.flights.release(id, ticket);
    }

    /// Send a task response with bounded retries.
    async fn report(&self, response: &TaskResponse) {
        let inner = &self.inner;
        let retries = inner.cfg.report_retries.max(1);

        let attempts = async {
            for attempt in 1..=retries {
                match inner.manager.send_response(&inner.delegate_id, response).await {
                    Ok(()) => {
                        debug!(attempt, "task response sent");
                        return true;
                    }
                    Err(e) if attempt < retries => {
                        warn!(attempt, error = %e, "failed to send task response; retrying");
                        tokio::time::sleep(inner.cfg.report_retry_delay).await;
                    }
                    Err(e) => error!(attempt, error = %e, "failed to send task response; giving up"),
                }
            }
            false
        };

        if tokio::time::timeout(inner.cfg.report_timeout, attempts).await.is_err() {
            error!(timeout = ?inner.cfg.report_timeout, "timed out sending task response");
        }
    }
}
