use std::time::Duration;

use async_trait::async_trait;
use dlg_core::{ManagerClient, ManagerError};
use dlg_model::{
    Heartbeat, HeartbeatReply, Registration, RegistrationReply, Task, TaskEvent, TaskId,
    TaskResponse, UpgradeInfo, ValidationResult,
};
use reqwest::{
    Client, Proxy, RequestBuilder, Url,
    header::{AUTHORIZATION, HeaderMap, HeaderValue},
};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::{debug, trace};

use crate::{config::ManagerConfig, error::ClientBuildError};

/// Every manager reply wraps its payload in `{"resource": ...}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    resource: Option<T>,
}

/// [`ManagerClient`] over the manager's REST API.
#[derive(Debug, Clone)]
pub struct HttpManagerClient {
    http: Client,
    base: Url,
    account_id: String,
    timeout: Duration,
}

impl HttpManagerClient {
    pub fn new(cfg: &ManagerConfig) -> Result<Self, ClientBuildError> {
        let base = parse_base(&cfg.url)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            "Version",
            HeaderValue::from_str(&cfg.version).map_err(|e| ClientBuildError::Client(e.to_string()))?,
        );
        if let Some(secret) = &cfg.account_secret {
            let mut value = HeaderValue::from_str(&format!("Delegate {secret}"))
                .map_err(|e| ClientBuildError::Client(e.to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = Client::builder().default_headers(headers).timeout(cfg.timeout);
        if let Some(proxy) = &cfg.proxy {
            builder = builder.proxy(Proxy::all(proxy.url()).map_err(|e| ClientBuildError::Proxy(e.to_string()))?);
        }
        let http = builder.build().map_err(|e| ClientBuildError::Client(e.to_string()))?;

        Ok(Self {
            http,
            base,
            account_id: cfg.account_id.clone(),
            timeout: cfg.timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `<base>/<segments...>?accountId=<id>&<query...>`, each segment percent-encoded.
    fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, ManagerError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ManagerError::Transport(format!("{} cannot be a base url", self.base)))?
            .pop_if_empty()
            .extend(segments);
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("accountId", &self.account_id);
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn transport(&self, e: reqwest::Error) -> ManagerError {
        if e.is_timeout() {
            ManagerError::Timeout(self.timeout)
        } else if e.is_decode() {
            ManagerError::Decode(e.to_string())
        } else {
            ManagerError::Transport(e.to_string())
        }
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>, ManagerError> {
        let response = request.send().await.map_err(|e| self.transport(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport(e))?;
        trace!(status = status.as_u16(), body = %body, "manager reply");

        if !status.is_success() {
            return Err(ManagerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(None);
        }
        let envelope: Envelope<T> = serde_json::from_str(&body)
            .map_err(|e| ManagerError::Decode(format!("{e}, body: {body}")))?;
        Ok(envelope.resource)
    }

    async fn call_required<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ManagerError> {
        self.call(request)
            .await?
            .ok_or_else(|| ManagerError::Decode("empty resource".into()))
    }
}

fn parse_base(raw: &str) -> Result<Url, ClientBuildError> {
    let invalid = |reason: String| ClientBuildError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let mut url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(invalid("not a base url".into()));
    }
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[async_trait]
impl ManagerClient for HttpManagerClient {
    async fn register(&self, registration: &Registration) -> Result<RegistrationReply, ManagerError> {
        let url = self.endpoint(&["agent", "delegates", "register"], &[])?;
        debug!(url = %url, "registering");
        self.call_required(self.http.post(url).json(registration)).await
    }

    async fn poll_events(&self, delegate_id: &str) -> Result<Vec<TaskEvent>, ManagerError> {
        let url = self.endpoint(&["agent", "delegates", delegate_id, "task-events"], &[])?;
        Ok(self.call(self.http.get(url)).await?.unwrap_or_default())
    }

    async fn acquire_task(&self, delegate_id: &str, task_id: &TaskId) -> Result<Option<Task>, ManagerError> {
        let url = self.endpoint(
            &["agent", "delegates", delegate_id, "tasks", task_id.as_str(), "acquire"],
            &[],
        )?;
        self.call(self.http.put(url)).await
    }

    async fn report_validation(
        &self,
        delegate_id: &str,
        task_id: &TaskId,
        results: &[ValidationResult],
    ) -> Result<Option<Task>, ManagerError> {
        let url = self.endpoint(
            &["agent", "delegates", delegate_id, "tasks", task_id.as_str(), "report"],
            &[],
        )?;
        self.call(self.http.post(url).json(results)).await
    }

    async fn fail_if_all_rejected(&self, delegate_id: &str, task_id: &TaskId) -> Result<bool, ManagerError> {
        let url = self.endpoint(
            &["agent", "delegates", delegate_id, "tasks", task_id.as_str(), "fail"],
            &[],
        )?;
        Ok(self.call::<bool>(self.http.get(url)).await?.unwrap_or(false))
    }

    async fn send_response(&self, delegate_id: &str, response: &TaskResponse) -> Result<(), ManagerError> {
        let url = self.endpoint(
            &["agent", "delegates", delegate_id, "tasks", response.task_id.as_str()],
            &[],
        )?;
        self.call::<serde_json::Value>(self.http.post(url).json(response)).await?;
        Ok(())
    }

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<HeartbeatReply, ManagerError> {
        let url = self.endpoint(&["agent", "delegates", "heartbeat-with-polling"], &[])?;
        self.call_required(self.http.post(url).json(heartbeat)).await
    }

    async fn upgrade_info(&self, _delegate_id: &str, version: &str) -> Result<UpgradeInfo, ManagerError> {
        let url = self.endpoint(
            &["agent", "delegates", "delegateScripts"],
            &[("delegateVersion", version)],
        )?;
        Ok(self.call(self.http.get(url)).await?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> HttpManagerClient {
        HttpManagerClient::new(&ManagerConfig::new(url, "acc 1", "1.0.0")).unwrap()
    }

    #[test]
    fn base_gets_trailing_slash() {
        assert_eq!(client("https://m.example.com/api").base_url().as_str(), "https://m.example.com/api/");
    }

    #[test]
    fn endpoint_encodes_segments_and_account() {
        let c = client("https://m.example.com/api/");
        let url = c
            .endpoint(&["agent", "delegates", "d/1", "task-events"], &[("x", "y")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://m.example.com/api/agent/delegates/d%2F1/task-events?accountId=acc+1&x=y"
        );
    }

    #[test]
    fn rejects_non_http_urls() {
        let err = HttpManagerClient::new(&ManagerConfig::new("ftp://m/api/", "acc", "1")).unwrap_err();
        assert!(matches!(err, ClientBuildError::InvalidUrl { .. }));
        assert!(HttpManagerClient::new(&ManagerConfig::new("not a url", "acc", "1")).is_err());
    }
}
