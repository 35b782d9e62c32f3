use std::sync::Arc;

use async_trait::async_trait;
use dlg_model::{DelegateId, Task};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("no runner for task type: {0}")]
    NoRunner(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task failed: {0}")]
    Failed(String),

    #[error("task cancelled")]
    Cancelled,
}

/// Everything a runner gets besides the task itself.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub delegate_id: DelegateId,
    /// Cancelled on abort or timeout.
    pub cancel: CancellationToken,
}

/// A single capability check the delegate runs before claiming a task.
#[async_trait]
pub trait Criterion: Send + Sync {
    /// Reported to the manager as the criteria name.
    fn describe(&self) -> String;

    async fn check(&self, cancel: &CancellationToken) -> Result<bool, RunnerError>;
}

/// Executes one family of task types.
#[async_trait]
pub trait Runner: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, task: &Task) -> bool;

    /// Capability checks for this task. No criteria means the task is always runnable.
    fn criteria(&self, _task: &Task) -> Result<Vec<Arc<dyn Criterion>>, RunnerError> {
        Ok(Vec::new())
    }

    async fn run(&self, task: &Task, ctx: RunContext) -> Result<Value, RunnerError>;
}
