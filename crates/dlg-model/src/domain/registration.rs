use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{DelegateId, DelegateStatus, EpochMillis};

/// Id the manager returns in place of a real one to order self-destruct.
pub const SELF_DESTRUCT: &str = "SELF_DESTRUCT";

/// Registration handshake payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    #[serde(rename = "uuid", skip_serializing_if = "Option::is_none")]
    pub delegate_id: Option<DelegateId>,
    pub account_id: String,
    pub host_name: String,
    pub ip: String,
    pub delegate_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegate_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegate_group_name: Option<String>,
    pub description: String,
    pub version: String,
    pub last_heartbeat: EpochMillis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegate_random_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_num: Option<String>,
}

/// Manager reply to a registration attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationReply {
    #[serde(rename = "uuid")]
    pub delegate_id: DelegateId,
    #[serde(default)]
    pub status: DelegateStatus,
    #[serde(default)]
    pub delegate_random_token: Option<String>,
    #[serde(default)]
    pub sequence_num: Option<String>,
}

impl RegistrationReply {
    pub fn is_self_destruct(&self) -> bool {
        self.delegate_id == SELF_DESTRUCT
    }
}

/// Current distribution metadata returned by the upgrade check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeInfo {
    #[serde(default)]
    pub do_upgrade: bool,
    #[serde(default)]
    pub version: String,
    /// Run scripts keyed by file name (`start.sh`, `stop.sh`, ...).
    #[serde(default)]
    pub scripts: HashMap<String, String>,
}

impl UpgradeInfo {
    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts
            .get(name)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_reply_detects_self_destruct() {
        let reply: RegistrationReply =
            serde_json::from_str(r#"{"uuid":"SELF_DESTRUCT"}"#).unwrap();
        assert!(reply.is_self_destruct());
        assert_eq!(reply.status, DelegateStatus::Enabled);
    }

    #[test]
    fn empty_script_counts_as_missing() {
        let mut info = UpgradeInfo::default();
        info.scripts.insert("start.sh".into(), String::new());
        info.scripts.insert("stop.sh".into(), "#!/bin/sh".into());
        assert!(info.script("start.sh").is_none());
        assert_eq!(info.script("stop.sh"), Some("#!/bin/sh"));
    }
}
