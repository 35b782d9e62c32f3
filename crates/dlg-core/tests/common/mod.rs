#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dlg_core::{
    Criterion, ManagerClient, ManagerError, RunContext, Runner, RunnerError, RunnerRouter,
    config::EngineConfig,
};
use dlg_model::{
    DelegateStatus, Heartbeat, HeartbeatReply, Registration, RegistrationReply, Task, TaskEvent,
    TaskId, TaskResponse, UpgradeInfo, ValidationResult,
};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub const ME: &str = "delegate-1";

/// In-memory manager that records every call.
#[derive(Default)]
pub struct FakeManager {
    pub tasks: Mutex<HashMap<TaskId, Task>>,
    /// Served ahead of `tasks`, one per acquire call.
    pub acquire_script: Mutex<VecDeque<Task>>,
    pub acquire_delay: Mutex<Duration>,
    pub assign_on_report: Mutex<HashMap<TaskId, Task>>,
    pub events: Mutex<VecDeque<TaskEvent>>,
    pub responses: Mutex<Vec<TaskResponse>>,
    pub reports: Mutex<Vec<(TaskId, Vec<ValidationResult>)>>,
    pub fail_checks: Mutex<Vec<TaskId>>,
    pub heartbeats: Mutex<Vec<Heartbeat>>,
    pub registrations: Mutex<Vec<Registration>>,
    pub heartbeat_status: Mutex<DelegateStatus>,
    pub registration_reply: Mutex<Option<RegistrationReply>>,
    pub register_failures: AtomicUsize,
    pub send_failures: AtomicUsize,
    pub send_attempts: AtomicUsize,
    pub acquires: AtomicUsize,
    responded: Notify,
}

impl FakeManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn offer(&self, task: Task) {
        self.tasks.lock().unwrap().insert(task.id.clone(), task);
    }

    pub fn assign_after_validation(&self, task: Task) {
        self.assign_on_report.lock().unwrap().insert(task.id.clone(), task);
    }

    pub fn push_event(&self, event: TaskEvent) {
        self.events.lock().unwrap().push_back(event);
    }

    pub fn responses(&self) -> Vec<TaskResponse> {
        self.responses.lock().unwrap().clone()
    }

    /// Wait until at least `n` responses were sent.
    pub async fn wait_responses(&self, n: usize, limit: Duration) -> Vec<TaskResponse> {
        let waited = tokio::time::timeout(limit, async {
            loop {
                let notified = self.responded.notified();
                if self.responses.lock().unwrap().len() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await;
        assert!(waited.is_ok(), "expected {n} responses, got {:?}", self.responses());
        self.responses()
    }
}

#[async_trait]
impl ManagerClient for FakeManager {
    async fn register(&self, registration: &Registration) -> Result<RegistrationReply, ManagerError> {
        self.registrations.lock().unwrap().push(registration.clone());
        if self
            .register_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ManagerError::Transport("connection refused".into()));
        }
        Ok(self
            .registration_reply
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(RegistrationReply {
                delegate_id: ME.into(),
                status: DelegateStatus::Enabled,
                delegate_random_token: None,
                sequence_num: None,
            }))
    }

    async fn poll_events(&self, _delegate_id: &str) -> Result<Vec<TaskEvent>, ManagerError> {
        Ok(self.events.lock().unwrap().drain(..).collect())
    }

    async fn acquire_task(&self, _delegate_id: &str, task_id: &TaskId) -> Result<Option<Task>, ManagerError> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        let scripted = self.acquire_script.lock().unwrap().pop_front();
        let delay = *self.acquire_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(scripted.or_else(|| self.tasks.lock().unwrap().get(task_id).cloned()))
    }

    async fn report_validation(
        &self,
        _delegate_id: &str,
        task_id: &TaskId,
        results: &[ValidationResult],
    ) -> Result<Option<Task>, ManagerError> {
        self.reports
            .lock()
            .unwrap()
            .push((task_id.clone(), results.to_vec()));
        Ok(self.assign_on_report.lock().unwrap().remove(task_id))
    }

    async fn fail_if_all_rejected(&self, _delegate_id: &str, task_id: &TaskId) -> Result<bool, ManagerError> {
        self.fail_checks.lock().unwrap().push(task_id.clone());
        Ok(true)
    }

    async fn send_response(&self, _delegate_id: &str, response: &TaskResponse) -> Result<(), ManagerError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .send_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ManagerError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.responses.lock().unwrap().push(response.clone());
        self.responded.notify_waiters();
        Ok(())
    }

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<HeartbeatReply, ManagerError> {
        self.heartbeats.lock().unwrap().push(heartbeat.clone());
        Ok(HeartbeatReply {
            delegate_id: heartbeat.delegate_id.clone(),
            status: *self.heartbeat_status.lock().unwrap(),
        })
    }

    async fn upgrade_info(&self, _delegate_id: &str, _version: &str) -> Result<UpgradeInfo, ManagerError> {
        Ok(UpgradeInfo::default())
    }
}

struct Capable {
    outcome: bool,
    delay: Duration,
}

#[async_trait]
impl Criterion for Capable {
    fn describe(&self) -> String {
        "capable".into()
    }
    async fn check(&self, cancel: &CancellationToken) -> Result<bool, RunnerError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(RunnerError::Cancelled),
            _ = tokio::time::sleep(self.delay) => Ok(self.outcome),
        }
    }
}

/// Handles `ECHO`, `SLEEP` and `FAIL` tasks.
///
/// `SLEEP` waits `parameters.ms` milliseconds unless cancelled; a boolean
/// `parameters.capable` adds a capability criterion with that outcome, which
/// takes `parameters.probe_ms` milliseconds to decide.
pub struct TestRunner;

#[async_trait]
impl Runner for TestRunner {
    fn name(&self) -> &'static str {
        "test"
    }

    fn supports(&self, task: &Task) -> bool {
        matches!(task.task_type.as_str(), "ECHO" | "SLEEP" | "FAIL")
    }

    fn criteria(&self, task: &Task) -> Result<Vec<Arc<dyn Criterion>>, RunnerError> {
        let criteria: Vec<Arc<dyn Criterion>> =
            match task.parameters.get("capable").and_then(Value::as_bool) {
                Some(outcome) => vec![Arc::new(Capable {
                    outcome,
                    delay: Duration::from_millis(
                        task.parameters.get("probe_ms").and_then(Value::as_u64).unwrap_or(0),
                    ),
                })],
                None => Vec::new(),
            };
        Ok(criteria)
    }

    async fn run(&self, task: &Task, ctx: RunContext) -> Result<Value, RunnerError> {
        match task.task_type.as_str() {
            "ECHO" => Ok(task.parameters.clone()),
            "SLEEP" => {
                let ms = task.parameters.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(RunnerError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({"slept": ms})),
                }
            }
            _ => Err(RunnerError::Failed("boom".into())),
        }
    }
}

pub fn router() -> Arc<RunnerRouter> {
    Arc::new(RunnerRouter::new().with(Arc::new(TestRunner)))
}

/// Engine config with every wait shrunk to test scale.
pub fn fast_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.dispatch.acquire_step = Duration::from_millis(1);
    cfg.dispatch.fail_check_delay = Duration::from_millis(20);
    cfg.dispatch.report_retry_delay = Duration::from_millis(5);
    cfg.dispatch.report_timeout = Duration::from_secs(2);
    cfg.timeouts.grace = Duration::from_millis(20);
    cfg.timeouts.poll = Duration::from_millis(10);
    cfg.timeouts.final_join = Duration::from_millis(50);
    cfg.source.poll_interval = Duration::from_millis(10);
    cfg.heartbeat.remote_interval = Duration::from_millis(20);
    cfg.lifecycle.registration_retry = Duration::from_millis(10);
    cfg.lifecycle.drain_poll = Duration::from_millis(5);
    cfg.lifecycle.command_poll = Duration::from_millis(5);
    cfg
}

pub fn sleep_task(id: &str, ms: u64, timeout_ms: u64) -> Task {
    Task::new(id, "SLEEP", timeout_ms).with_parameters(json!({ "ms": ms }))
}
