use serde::{Deserialize, Serialize};

use crate::TaskId;

/// Notification that a task id needs attention.
///
/// Wire shape: `{ "delegateTaskId": "...", "accountId": "...", "sync": true }`.
/// The abort variant carries the same id plus `"abort": true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    #[serde(rename = "delegateTaskId")]
    pub task_id: TaskId,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub sync: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub abort: bool,
}

impl TaskEvent {
    pub fn dispatch(task_id: impl Into<TaskId>, sync: bool) -> Self {
        Self {
            task_id: task_id.into(),
            account_id: String::new(),
            sync,
            abort: false,
        }
    }

    pub fn abort(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            account_id: String::new(),
            sync: false,
            abort: true,
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }
}
