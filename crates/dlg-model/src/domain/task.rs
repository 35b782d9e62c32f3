use serde::{Deserialize, Serialize};

use crate::{DelegateId, TaskId, TimeoutMs};

/// Execution pool a task is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Short synchronous tasks.
    Sync,
    /// Long-running asynchronous tasks.
    Async,
    /// Large-artifact (build) tasks, kept apart so they cannot starve the others.
    Artifact,
}

impl PoolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::Sync => "sync",
            PoolKind::Async => "async",
            PoolKind::Artifact => "artifact",
        }
    }
}

/// A unit of work acquired from the manager.
///
/// Immutable once acquired. `assigned_delegate_id` is the manager's authority
/// for "may this delegate execute it".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(rename = "uuid")]
    pub id: TaskId,
    pub task_type: String,
    #[serde(rename = "timeout")]
    pub timeout_ms: TimeoutMs,
    #[serde(rename = "delegateId", default, skip_serializing_if = "Option::is_none")]
    pub assigned_delegate_id: Option<DelegateId>,
    #[serde(default)]
    pub is_async: bool,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, task_type: impl Into<String>, timeout_ms: TimeoutMs) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            timeout_ms,
            assigned_delegate_id: None,
            is_async: false,
            parameters: serde_json::Value::Null,
        }
    }

    pub fn with_assignee(mut self, delegate_id: impl Into<DelegateId>) -> Self {
        self.assigned_delegate_id = Some(delegate_id.into());
        self
    }

    pub fn with_async(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Whether the manager already assigned this task to `delegate_id`.
    pub fn is_whitelisted_for(&self, delegate_id: &str) -> bool {
        self.assigned_delegate_id.as_deref() == Some(delegate_id)
    }

    /// Whether the manager has not picked any delegate yet.
    pub fn is_unassigned(&self) -> bool {
        self.assigned_delegate_id
            .as_deref()
            .is_none_or(|d| d.trim().is_empty())
    }

    /// Pool selection: async first, then build-flagged types, then sync.
    pub fn pool_kind(&self) -> PoolKind {
        if self.is_async {
            PoolKind::Async
        } else if self.task_type.contains("BUILD") {
            PoolKind::Artifact
        } else {
            PoolKind::Sync
        }
    }
}
