use std::time::Duration;

/// Outbound proxy for both REST calls and the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl ProxyConfig {
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Base of the manager API, e.g. `https://manager.example.com/api/`.
    pub url: String,
    pub account_id: String,
    /// Sent as `Authorization: Delegate <secret>` when present.
    pub account_secret: Option<String>,
    /// Delegate version, sent in the `Version` header.
    pub version: String,
    pub proxy: Option<ProxyConfig>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl ManagerConfig {
    pub fn new(url: impl Into<String>, account_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            account_id: account_id.into(),
            account_secret: None,
            version: version.into(),
            proxy: None,
            timeout: Duration::from_secs(30),
        }
    }
}
