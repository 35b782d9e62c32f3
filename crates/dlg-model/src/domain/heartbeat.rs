use serde::{Deserialize, Serialize};

use crate::{DelegateId, EpochMillis, TaskId};

/// Liveness payload sent to the manager on every remote heartbeat tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub delegate_id: DelegateId,
    pub last_heartbeat: EpochMillis,
    pub version: String,
    pub currently_executing_task_ids: Vec<TaskId>,
    pub connected: bool,
}

/// Manager-side status of this delegate record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelegateStatus {
    #[default]
    Enabled,
    WaitingForApproval,
    Disabled,
    /// The record was removed; the delegate must self-destruct.
    Deleted,
}

/// Manager reply to a direct (poll-mode) heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReply {
    #[serde(rename = "uuid")]
    pub delegate_id: DelegateId,
    #[serde(default)]
    pub status: DelegateStatus,
}

impl HeartbeatReply {
    /// Whether this reply orders `delegate_id` to self-destruct.
    pub fn is_deleted_for(&self, delegate_id: &str) -> bool {
        self.delegate_id == delegate_id && self.status == DelegateStatus::Deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_wire_shape() {
        let hb = Heartbeat {
            delegate_id: "d1".into(),
            last_heartbeat: 42,
            version: "1.0.0".into(),
            currently_executing_task_ids: vec![TaskId::from("t1")],
            connected: true,
        };
        let v = serde_json::to_value(&hb).unwrap();
        assert_eq!(v["delegateId"], "d1");
        assert_eq!(v["lastHeartbeat"], 42);
        assert_eq!(v["currentlyExecutingTaskIds"][0], "t1");
    }

    #[test]
    fn deleted_reply_only_counts_for_own_id() {
        let reply: HeartbeatReply =
            serde_json::from_str(r#"{"uuid":"d1","status":"DELETED"}"#).unwrap();
        assert!(reply.is_deleted_for("d1"));
        assert!(!reply.is_deleted_for("d2"));
    }
}
