use std::{sync::Arc, time::Duration};

use dlg_model::{DelegateId, TaskEvent};
use tokio::{
    sync::{mpsc, watch},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{Inbound, Outlet, PushLink, PushTransport, SourceError};
use crate::{config::SourceConfig, lifecycle::LifecycleState, manager::ManagerClient};

/// Feeds inbound messages to a sink from the push channel, or by polling
/// the manager while no push channel is open.
///
/// Polling and push are never active together. A `true` on the paused watch
/// closes the push channel and stops polling until it flips back.
pub struct EventStream {
    manager: Arc<dyn ManagerClient>,
    push: Option<Arc<dyn PushTransport>>,
    delegate_id: DelegateId,
    cfg: SourceConfig,
    outlet: Outlet,
    flags: Arc<LifecycleState>,
    paused: watch::Receiver<bool>,
}

impl EventStream {
    pub fn new(
        delegate_id: impl Into<DelegateId>,
        manager: Arc<dyn ManagerClient>,
        push: Option<Arc<dyn PushTransport>>,
        cfg: SourceConfig,
        outlet: Outlet,
        flags: Arc<LifecycleState>,
        paused: watch::Receiver<bool>,
    ) -> Self {
        Self {
            manager,
            push,
            delegate_id: delegate_id.into(),
            cfg,
            outlet,
            flags,
            paused,
        }
    }

    #[instrument(name = "event_stream", skip_all, fields(push = self.push.is_some()))]
    pub async fn run(self, sink: mpsc::Sender<Inbound>, shutdown: CancellationToken) {
        let mut link: Option<PushLink> = None;
        let mut attempts: u32 = 0;
        let mut reconnect_at = self.push.as_ref().map(|_| Instant::now());

        let mut paused = self.paused.clone();
        let mut poll = tokio::time::interval(self.cfg.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'events: loop {
            if *paused.borrow_and_update() {
                if link.take().is_some() {
                    self.outlet.detach();
                    info!("push channel closed while paused");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = paused.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if self.push.is_some() {
                            attempts = 0;
                            reconnect_at = Some(Instant::now());
                        }
                        continue;
                    }
                }
            }

            let connected = link.is_some();
            let reconnect = reconnect_at.filter(|_| !connected);

            tokio::select! {
                _ = shutdown.cancelled() => break,

                changed = paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                msg = next_message(&mut link) => match msg {
                    Some(Ok(inbound)) => {
                        if sink.send(inbound).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(SourceError::Protocol(detail))) => {
                        warn!(%detail, "ignoring malformed push message");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "push channel failed; falling back to polling");
                        self.drop_link(&mut link);
                        reconnect_at = Some(Instant::now() + self.backoff(attempts));
                    }
                    None => {
                        info!("push channel closed; falling back to polling");
                        self.drop_link(&mut link);
                        reconnect_at = Some(Instant::now() + self.backoff(attempts));
                    }
                },

                _ = poll.tick(), if !connected => {
                    for event in self.poll_once().await {
                        if sink.send(Inbound::Event(event)).await.is_err() {
                            break 'events;
                        }
                    }
                }

                _ = sleep_until(reconnect), if reconnect.is_some() => {
                    match self.open().await {
                        Ok(opened) => {
                            attempts = 0;
                            reconnect_at = None;
                            self.outlet.attach(opened.outbound.clone());
                            link = Some(opened);
                            info!("push channel open; polling suspended");
                        }
                        Err(e) => {
                            attempts += 1;
                            reconnect_at = self.after_failed_connect(attempts, &e);
                        }
                    }
                }
            }
        }

        self.outlet.detach();
        debug!("event stream stopped");
    }

    async fn open(&self) -> Result<PushLink, SourceError> {
        match &self.push {
            Some(t) => t.open(&self.delegate_id).await,
            None => Err(SourceError::Connect("push transport not configured".into())),
        }
    }

    fn drop_link(&self, link: &mut Option<PushLink>) {
        link.take();
        self.outlet.detach();
    }

    /// Next reconnect instant, or `None` once the attempt budget is spent.
    fn after_failed_connect(&self, attempts: u32, err: &SourceError) -> Option<Instant> {
        if let Some(max) = self.cfg.max_reconnect_attempts
            && attempts >= max
        {
            warn!(attempts, error = %err, "giving up on the push channel; restart needed");
            self.flags.set_restart_needed(true);
            return None;
        }
        let pause = self.backoff(attempts);
        warn!(attempts, error = %err, retry_in = ?pause, "failed to open push channel");
        Some(Instant::now() + pause)
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32 << attempts.min(16);
        cmp_min(self.cfg.reconnect_pause.saturating_mul(factor), self.cfg.reconnect_max_pause)
    }

    async fn poll_once(&self) -> Vec<TaskEvent> {
        let call = self.manager.poll_events(&self.delegate_id);
        match tokio::time::timeout(self.cfg.poll_timeout, call).await {
            Ok(Ok(events)) => {
                if !events.is_empty() {
                    info!(count = events.len(), "polled task events");
                }
                events
            }
            Ok(Err(e)) => {
                warn!(error = %e, "unable to poll task events");
                Vec::new()
            }
            Err(_) => {
                warn!(timeout = ?self.cfg.poll_timeout, "timed out polling task events");
                Vec::new()
            }
        }
    }
}

#[inline]
fn cmp_min(a: Duration, b: Duration) -> Duration {
    if a < b { a } else { b }
}

async fn next_message(link: &mut Option<PushLink>) -> Option<Result<Inbound, SourceError>> {
    match link {
        Some(l) => l.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
