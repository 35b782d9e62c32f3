use std::time::Duration;

use async_trait::async_trait;
use dlg_core::{PushLink, PushTransport, SourceError, parse_inbound};
use dlg_model::Heartbeat;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Message, client::IntoClientRequest, http::HeaderValue},
};
use tracing::{debug, trace, warn};

use crate::{config::ManagerConfig, error::ClientBuildError};

const INBOUND_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 8;

/// Push-channel base for a manager API url: `/api/` becomes `/stream/` and
/// `http(s)` becomes `ws(s)`.
pub fn stream_url(manager_url: &str) -> Result<Url, ClientBuildError> {
    let invalid = |reason: &str| ClientBuildError::InvalidUrl {
        url: manager_url.to_string(),
        reason: reason.to_string(),
    };
    let mut raw = manager_url.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    let raw = raw.replacen("/api/", "/stream/", 1);
    let raw = if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(invalid("expected an http or https url"));
    };
    Url::parse(&raw).map_err(|e| invalid(&e.to_string()))
}

/// [`PushTransport`] over a WebSocket to the manager's stream endpoint.
///
/// The proxy settings of [`ManagerConfig`] do not apply here; a delegate
/// behind a proxy should run in polling mode.
#[derive(Debug, Clone)]
pub struct WsPushTransport {
    base: Url,
    account_id: String,
    version: String,
    connect_timeout: Duration,
}

impl WsPushTransport {
    pub fn new(cfg: &ManagerConfig) -> Result<Self, ClientBuildError> {
        Ok(Self {
            base: stream_url(&cfg.url)?,
            account_id: cfg.account_id.clone(),
            version: cfg.version.clone(),
            connect_timeout: cfg.timeout,
        })
    }

    /// `<stream base>/delegate/<account>?delegateId=<id>`.
    pub fn url_for(&self, delegate_id: &str) -> Result<Url, SourceError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::Connect(format!("{} cannot be a base url", self.base)))?
            .pop_if_empty()
            .extend(["delegate", self.account_id.as_str()]);
        url.query_pairs_mut().append_pair("delegateId", delegate_id);
        Ok(url)
    }
}

#[async_trait]
impl PushTransport for WsPushTransport {
    async fn open(&self, delegate_id: &str) -> Result<PushLink, SourceError> {
        let url = self.url_for(delegate_id)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SourceError::Connect(e.to_string()))?;
        request.headers_mut().insert(
            "Version",
            HeaderValue::from_str(&self.version).map_err(|e| SourceError::Connect(e.to_string()))?,
        );

        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| SourceError::Connect(format!("timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| SourceError::Connect(e.to_string()))?;
        debug!(url = %url, "push channel open");

        let (mut sink, mut stream) = ws.split();
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Heartbeat>(OUTBOUND_CAPACITY);
        let (gone_tx, mut gone_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let parsed = match frame {
                    Ok(Message::Text(text)) => parse_inbound(&text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(Err(SourceError::Connect(e.to_string()))).await;
                        break;
                    }
                };
                if in_tx.send(parsed).await.is_err() {
                    break;
                }
            }
            trace!("push reader finished");
            drop(gone_tx);
        });

        tokio::spawn(async move {
            loop {
                let heartbeat = tokio::select! {
                    hb = out_rx.recv() => match hb {
                        Some(hb) => hb,
                        None => break,
                    },
                    _ = &mut gone_rx => break,
                };
                let text = match serde_json::to_string(&heartbeat) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to encode heartbeat");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "push send failed");
                    break;
                }
            }
            let _ = sink.close().await;
            trace!("push writer finished");
        });

        Ok(PushLink {
            inbound: in_rx,
            outbound: out_tx,
        })
    }
}
