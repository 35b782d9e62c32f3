use std::time::Duration;

use async_trait::async_trait;
use dlg_model::{
    Heartbeat, HeartbeatReply, Registration, RegistrationReply, Task, TaskEvent, TaskId,
    TaskResponse, UpgradeInfo, ValidationResult,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("manager unreachable: {0}")]
    Transport(String),

    #[error("manager returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid manager response: {0}")]
    Decode(String),

    #[error("manager call timed out after {0:?}")]
    Timeout(Duration),
}

/// Calls the delegate makes to the central manager.
#[async_trait]
pub trait ManagerClient: Send + Sync {
    async fn register(&self, registration: &Registration) -> Result<RegistrationReply, ManagerError>;

    /// Pending task events for this delegate (pull mode).
    async fn poll_events(&self, delegate_id: &str) -> Result<Vec<TaskEvent>, ManagerError>;

    /// Fetch a task by id. `None` if it is gone or already taken.
    async fn acquire_task(&self, delegate_id: &str, task_id: &TaskId) -> Result<Option<Task>, ManagerError>;

    /// Report capability results. `Some` carries the task once the manager assigned it.
    async fn report_validation(
        &self,
        delegate_id: &str,
        task_id: &TaskId,
        results: &[ValidationResult],
    ) -> Result<Option<Task>, ManagerError>;

    /// Ask the manager to fail the task if every candidate delegate rejected it.
    async fn fail_if_all_rejected(&self, delegate_id: &str, task_id: &TaskId) -> Result<bool, ManagerError>;

    async fn send_response(&self, delegate_id: &str, response: &TaskResponse) -> Result<(), ManagerError>;

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<HeartbeatReply, ManagerError>;

    async fn upgrade_info(&self, delegate_id: &str, version: &str) -> Result<UpgradeInfo, ManagerError>;
}
