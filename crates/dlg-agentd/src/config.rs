use std::{path::PathBuf, time::Duration};

use dlg_core::{
    AgentIdentity, EngineConfig,
    config::{HeartbeatConfig, LifecycleConfig, SourceConfig},
};
use dlg_manager::{ManagerConfig, ProxyConfig};
use dlg_observe::{LoggerConfig, LoggerError, LoggerFormat, LoggerLevel};
use thiserror::Error;

const DEFAULT_HEARTBEAT_MS: u64 = 60_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Logger(#[from] LoggerError),
}

/// Daemon settings read from the environment.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub manager_url: String,
    pub account_id: String,
    pub account_secret: Option<String>,
    pub delegate_name: Option<String>,
    pub delegate_type: Option<String>,
    pub group_name: Option<String>,
    pub description: Option<String>,
    pub deploy_mode: Option<String>,
    pub multi_version: bool,
    pub poll_for_tasks: bool,
    pub do_upgrade: bool,
    pub heartbeat_interval: Duration,
    pub watched: bool,
    pub watcher_version: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub work_dir: PathBuf,
    pub logger: LoggerConfig,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let opt = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &'static str| opt(key).ok_or(ConfigError::Missing(key));
        let flag = |key: &'static str, default: bool| match opt(key) {
            None => Ok(default),
            Some(v) => parse_bool(key, &v),
        };

        let heartbeat_ms = match opt("HEARTBEAT_INTERVAL_MS") {
            None => DEFAULT_HEARTBEAT_MS,
            Some(v) => v.parse::<u64>().ok().filter(|ms| *ms > 0).ok_or_else(|| ConfigError::Invalid {
                key: "HEARTBEAT_INTERVAL_MS",
                value: v.clone(),
                reason: "expected a positive number of milliseconds".into(),
            })?,
        };

        let proxy = match opt("PROXY_HOST") {
            None => None,
            Some(host) => {
                let raw = required("PROXY_PORT")?;
                let port = raw.parse::<u16>().map_err(|e| ConfigError::Invalid {
                    key: "PROXY_PORT",
                    value: raw.clone(),
                    reason: e.to_string(),
                })?;
                let scheme = opt("PROXY_SCHEME").unwrap_or_else(|| "http".into()).to_ascii_lowercase();
                Some(ProxyConfig { scheme, host, port })
            }
        };

        let mut logger = LoggerConfig::default();
        if let Some(format) = opt("LOG_FORMAT") {
            logger.format = format.parse::<LoggerFormat>()?;
        }
        if let Some(level) = opt("LOG_LEVEL") {
            logger.level = level.parse::<LoggerLevel>()?;
        }

        Ok(Self {
            manager_url: required("MANAGER_URL")?,
            account_id: required("ACCOUNT_ID")?,
            account_secret: opt("ACCOUNT_SECRET"),
            delegate_name: opt("DELEGATE_NAME"),
            delegate_type: opt("DELEGATE_TYPE"),
            group_name: opt("DELEGATE_GROUP_NAME"),
            description: opt("DELEGATE_DESCRIPTION"),
            deploy_mode: opt("DEPLOY_MODE"),
            multi_version: flag("MULTI_VERSION", false)?,
            poll_for_tasks: flag("POLL_FOR_TASKS", false)?,
            do_upgrade: flag("DO_UPGRADE", true)?,
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            watched: flag("WATCHED", false)?,
            watcher_version: opt("WATCHER_VERSION"),
            proxy,
            work_dir: opt("WORK_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
            logger,
        })
    }

    /// ECS delegates re-register with a persisted token and sequence number.
    pub fn requires_sequence(&self) -> bool {
        self.delegate_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("ECS"))
    }

    /// Upgrades are handled outside the process on Kubernetes and in multi-version mode.
    pub fn self_managed_upgrade(&self) -> bool {
        let kubernetes = self
            .deploy_mode
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("KUBERNETES"));
        self.do_upgrade && !self.multi_version && !kubernetes
    }

    pub fn manager(&self, version: &str) -> ManagerConfig {
        let mut cfg = ManagerConfig::new(&self.manager_url, &self.account_id, version);
        cfg.account_secret = self.account_secret.clone();
        cfg.proxy = self.proxy.clone();
        cfg
    }

    pub fn identity(&self, version: &str) -> AgentIdentity {
        let mut identity = AgentIdentity::detect(&self.account_id, version);
        if let Some(name) = &self.delegate_name {
            identity.name = name.clone();
        }
        identity.delegate_type = self.delegate_type.clone();
        identity.group_name = self.group_name.clone();
        identity.description = self.description.clone().unwrap_or_default();
        identity
    }

    pub fn engine(&self) -> EngineConfig {
        let source = SourceConfig::default();
        // only a supervised delegate gives up and asks for a restart
        let max_reconnect_attempts = if self.watched { source.max_reconnect_attempts } else { None };
        EngineConfig {
            source: SourceConfig {
                max_reconnect_attempts,
                ..source
            },
            heartbeat: HeartbeatConfig {
                remote_interval: self.heartbeat_interval,
                ..HeartbeatConfig::default()
            },
            lifecycle: LifecycleConfig {
                work_dir: self.work_dir.clone(),
                upgrade_interval: self.self_managed_upgrade().then_some(self.heartbeat_interval),
                watched: self.watched,
                watcher_version: self.watcher_version.clone(),
                ..LifecycleConfig::default()
            },
            ..EngineConfig::default()
        }
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected true or false".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<AgentConfig, ConfigError> {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AgentConfig::from_lookup(|k| env.get(k).cloned())
    }

    const BASE: [(&str, &str); 2] = [("MANAGER_URL", "https://m/api/"), ("ACCOUNT_ID", "acc")];

    #[test]
    fn requires_manager_and_account() {
        assert!(matches!(load(&[]), Err(ConfigError::Missing("MANAGER_URL"))));
        assert!(matches!(
            load(&[("MANAGER_URL", "https://m/api/")]),
            Err(ConfigError::Missing("ACCOUNT_ID"))
        ));
    }

    #[test]
    fn defaults() {
        let cfg = load(&BASE).unwrap();
        assert!(!cfg.poll_for_tasks);
        assert!(!cfg.watched);
        assert!(cfg.self_managed_upgrade());
        assert!(!cfg.requires_sequence());
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(60));

        let engine = cfg.engine();
        assert_eq!(engine.source.max_reconnect_attempts, None);
        assert_eq!(engine.lifecycle.upgrade_interval, Some(Duration::from_secs(60)));
    }

    #[test]
    fn watched_delegate_caps_reconnects() {
        let mut env = BASE.to_vec();
        env.push(("WATCHED", "true"));
        let engine = load(&env).unwrap().engine();
        assert_eq!(engine.source.max_reconnect_attempts, Some(50));
        assert!(engine.lifecycle.watched);
    }

    #[test]
    fn kubernetes_and_multi_version_skip_upgrade_check() {
        let mut env = BASE.to_vec();
        env.push(("DEPLOY_MODE", "KUBERNETES"));
        assert_eq!(load(&env).unwrap().engine().lifecycle.upgrade_interval, None);

        let mut env = BASE.to_vec();
        env.push(("MULTI_VERSION", "1"));
        assert!(!load(&env).unwrap().self_managed_upgrade());
    }

    #[test]
    fn ecs_requires_sequence() {
        let mut env = BASE.to_vec();
        env.push(("DELEGATE_TYPE", "ecs"));
        assert!(load(&env).unwrap().requires_sequence());
    }

    #[test]
    fn proxy_needs_a_port() {
        let mut env = BASE.to_vec();
        env.push(("PROXY_HOST", "proxy.local"));
        assert!(matches!(load(&env), Err(ConfigError::Missing("PROXY_PORT"))));

        env.push(("PROXY_PORT", "3128"));
        env.push(("PROXY_SCHEME", "HTTPS"));
        let proxy = load(&env).unwrap().proxy.unwrap();
        assert_eq!(proxy.url(), "https://proxy.local:3128");
    }

    #[test]
    fn rejects_bad_values() {
        let mut env = BASE.to_vec();
        env.push(("WATCHED", "maybe"));
        assert!(matches!(load(&env), Err(ConfigError::Invalid { key: "WATCHED", .. })));

        let mut env = BASE.to_vec();
        env.push(("HEARTBEAT_INTERVAL_MS", "0"));
        assert!(matches!(
            load(&env),
            Err(ConfigError::Invalid { key: "HEARTBEAT_INTERVAL_MS", .. })
        ));

        let mut env = BASE.to_vec();
        env.push(("LOG_FORMAT", "xml"));
        assert!(matches!(load(&env), Err(ConfigError::Logger(_))));
    }

    #[test]
    fn identity_uses_overrides() {
        let mut env = BASE.to_vec();
        env.push(("DELEGATE_NAME", "builder"));
        env.push(("DELEGATE_GROUP_NAME", "ci"));
        let identity = load(&env).unwrap().identity("1.0.0");
        assert_eq!(identity.name, "builder");
        assert_eq!(identity.group_name.as_deref(), Some("ci"));
        assert_eq!(identity.version, "1.0.0");
    }
}
