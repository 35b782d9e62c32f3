//! Where task events come from: a push channel when one is open, polling otherwise.

mod stream;
pub use stream::EventStream;

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dlg_model::{DelegateId, Heartbeat, SELF_DESTRUCT, SequenceToken, TaskEvent};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::manager::ManagerError;

/// Heartbeat acknowledgement prefix on the push channel.
const ACK_PREFIX: &str = "[X]";
const TOKEN_MARKER: &str = "[TOKEN]";
/// Bare keepalive frame.
const KEEPALIVE: &str = "X";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("failed to open push channel: {0}")]
    Connect(String),

    #[error("push channel closed")]
    Closed,

    #[error("malformed push message: {0}")]
    Protocol(String),

    #[error("failed to send on push channel: {0}")]
    Send(String),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// A decoded push-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Event(TaskEvent),
    HeartbeatAck {
        delegate_id: DelegateId,
        sequence: Option<SequenceToken>,
    },
    SelfDestruct,
    KeepAlive,
}

/// Decode one text frame from the push channel.
///
/// Grammar: `[X]<id>[TOKEN]<token>[SEQ]<n>` acknowledges a heartbeat,
/// `SELF_DESTRUCT` orders self-destruct, `X` is a keepalive and anything
/// else must be a JSON task event.
pub fn parse_inbound(message: &str) -> Result<Inbound, SourceError> {
    let message = message.trim();

    if let Some(rest) = message.strip_prefix(ACK_PREFIX) {
        let (delegate_id, sequence) = match rest.find(TOKEN_MARKER) {
            Some(idx) => (&rest[..idx], rest[idx..].parse::<SequenceToken>().ok()),
            None => (rest, None),
        };
        return Ok(Inbound::HeartbeatAck {
            delegate_id: delegate_id.to_string(),
            sequence,
        });
    }
    if message == SELF_DESTRUCT {
        return Ok(Inbound::SelfDestruct);
    }
    if message == KEEPALIVE {
        return Ok(Inbound::KeepAlive);
    }

    serde_json::from_str::<TaskEvent>(message)
        .map(Inbound::Event)
        .map_err(|e| SourceError::Protocol(e.to_string()))
}

/// An open push channel.
///
/// Dropping the link closes the channel; the inbound half ends with `None`
/// once the transport is gone.
#[derive(Debug)]
pub struct PushLink {
    pub inbound: mpsc::Receiver<Result<Inbound, SourceError>>,
    pub outbound: mpsc::Sender<Heartbeat>,
}

/// Opens push channels to the manager.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(&self, delegate_id: &str) -> Result<PushLink, SourceError>;
}

/// Write half of the current push link, shared with the heartbeat loop.
#[derive(Debug, Clone, Default)]
pub struct Outlet {
    tx: Arc<Mutex<Option<mpsc::Sender<Heartbeat>>>>,
}

impl Outlet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, tx: mpsc::Sender<Heartbeat>) {
        *self.tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    pub(crate) fn detach(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_connected(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    pub async fn send(&self, heartbeat: Heartbeat) -> Result<(), SourceError> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SourceError::Closed)?;
        tx.send(heartbeat)
            .await
            .map_err(|e| SourceError::Send(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use dlg_model::TaskId;

    use super::*;

    #[test]
    fn heartbeat_ack_with_sequence() {
        let msg = parse_inbound("[X]d-1[TOKEN]abc[SEQ]5").unwrap();
        assert_eq!(
            msg,
            Inbound::HeartbeatAck {
                delegate_id: "d-1".into(),
                sequence: Some(SequenceToken::new("abc", Some("5".into()))),
            }
        );
    }

    #[test]
    fn bare_heartbeat_ack() {
        assert_eq!(
            parse_inbound("[X]d-1").unwrap(),
            Inbound::HeartbeatAck {
                delegate_id: "d-1".into(),
                sequence: None,
            }
        );
    }

    #[test]
    fn control_frames() {
        assert_eq!(parse_inbound("SELF_DESTRUCT").unwrap(), Inbound::SelfDestruct);
        assert_eq!(parse_inbound("X").unwrap(), Inbound::KeepAlive);
    }

    #[test]
    fn task_event_json() {
        let msg = parse_inbound(r#"{"delegateTaskId":"t1","accountId":"acc","sync":true}"#).unwrap();
        match msg {
            Inbound::Event(ev) => {
                assert_eq!(ev.task_id, TaskId::from("t1"));
                assert!(ev.sync);
                assert!(!ev.abort);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        assert!(matches!(parse_inbound("hello"), Err(SourceError::Protocol(_))));
    }

    #[tokio::test]
    async fn outlet_without_link_is_closed() {
        let outlet = Outlet::new();
        assert!(!outlet.is_connected());

        let hb = Heartbeat {
            delegate_id: "d".into(),
            last_heartbeat: 1,
            version: "1.0.0".into(),
            currently_executing_task_ids: Vec::new(),
            connected: true,
        };
        assert_eq!(outlet.send(hb.clone()).await, Err(SourceError::Closed));

        let (tx, mut rx) = mpsc::channel(1);
        outlet.attach(tx);
        assert!(outlet.is_connected());
        outlet.send(hb.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(hb));

        outlet.detach();
        assert!(!outlet.is_connected());
    }
}
