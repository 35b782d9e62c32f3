use serde::{Deserialize, Serialize};

use crate::TaskId;

/// Final state of an executed task as reported to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    /// The callout completed and returned a payload.
    Success,
    /// The callout returned an error or panicked.
    Failure,
    /// The callout overran its budget and was cancelled.
    Timeout,
}

impl ResponseStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ResponseStatus::Success)
    }
}

/// Result of a task execution, delivered through the reporting path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub task_id: TaskId,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResponse {
    pub fn success(task_id: TaskId, data: serde_json::Value) -> Self {
        Self {
            task_id,
            status: ResponseStatus::Success,
            data,
            error: None,
        }
    }

    pub fn failure(task_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            task_id,
            status: ResponseStatus::Failure,
            data: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }

    pub fn timeout(task_id: TaskId, budget_ms: u64) -> Self {
        Self {
            task_id,
            status: ResponseStatus::Timeout,
            data: serde_json::Value::Null,
            error: Some(format!("task timed out after {budget_ms} ms")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_names() {
        let json = serde_json::to_string(&ResponseStatus::Timeout).unwrap();
        assert_eq!(json, r#""TIMEOUT""#);
    }

    #[test]
    fn failure_omits_null_payload() {
        let r = TaskResponse::failure(TaskId::from("t"), "boom");
        let json = serde_json::to_string(&r).unwrap();
        assert!(!json.contains("data"));
        assert!(json.contains(r#""error":"boom""#));
        assert!(!r.status.is_success());
    }
}
