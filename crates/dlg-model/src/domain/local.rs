use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{EpochMillis, ModelError};

/// Status the delegate publishes to its local supervising process (the watcher).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<EpochMillis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub restart_needed: bool,
    #[serde(default)]
    pub upgrade_needed: bool,
    #[serde(default)]
    pub upgrade_pending: bool,
    #[serde(default)]
    pub shutdown_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_started: Option<EpochMillis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_started: Option<EpochMillis>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub self_destruct: bool,
}

impl LocalStatus {
    /// The only status a self-destructing delegate still publishes.
    pub fn self_destructing() -> Self {
        Self {
            self_destruct: true,
            ..Self::default()
        }
    }
}

/// What the delegate reads back about the watcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherStatus {
    #[serde(default)]
    pub heartbeat: Option<EpochMillis>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub process: Option<String>,
}

/// Inbound commands from the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalCommand {
    GoAhead,
    Resume,
    StopAcquiring,
    SelfDestruct,
    /// The watcher has taken over an upgrade; clear `upgradeNeeded`.
    Upgrading,
}

impl LocalCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalCommand::GoAhead => "go-ahead",
            LocalCommand::Resume => "resume",
            LocalCommand::StopAcquiring => "stop-acquiring",
            LocalCommand::SelfDestruct => "self-destruct",
            LocalCommand::Upgrading => "upgrading",
        }
    }
}

impl FromStr for LocalCommand {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "go-ahead" => Ok(LocalCommand::GoAhead),
            "resume" => Ok(LocalCommand::Resume),
            "stop-acquiring" => Ok(LocalCommand::StopAcquiring),
            "self-destruct" => Ok(LocalCommand::SelfDestruct),
            "upgrading" => Ok(LocalCommand::Upgrading),
            other => Err(ModelError::UnknownCommand(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_case_insensitively() {
        assert_eq!("Go-Ahead".parse::<LocalCommand>(), Ok(LocalCommand::GoAhead));
        assert_eq!(
            " stop-acquiring\n".parse::<LocalCommand>(),
            Ok(LocalCommand::StopAcquiring)
        );
        assert!("reboot".parse::<LocalCommand>().is_err());
    }

    #[test]
    fn command_names_parse_back() {
        for cmd in [
            LocalCommand::GoAhead,
            LocalCommand::Resume,
            LocalCommand::StopAcquiring,
            LocalCommand::SelfDestruct,
            LocalCommand::Upgrading,
        ] {
            assert_eq!(cmd.as_str().parse::<LocalCommand>(), Ok(cmd));
        }
    }

    #[test]
    fn self_destruct_status_only_carries_the_flag() {
        let v = serde_json::to_value(LocalStatus::self_destructing()).unwrap();
        assert_eq!(v["selfDestruct"], true);
        assert!(v.get("heartbeat").is_none());
    }
}
