use std::sync::Arc;

use dlg_model::{DelegateId, Heartbeat};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::Liveness;
use crate::{
    config::HeartbeatConfig, lifecycle::LifecycleState, manager::ManagerClient, source::Outlet,
    state::InFlight, system::now_millis,
};

/// Periodic liveness report to the manager.
///
/// Goes over the push channel when one is open and as a direct call otherwise;
/// only the direct call carries a reply.
pub struct RemoteHeartbeat {
    delegate_id: DelegateId,
    version: String,
    manager: Arc<dyn ManagerClient>,
    outlet: Outlet,
    flights: InFlight,
    flags: Arc<LifecycleState>,
    liveness: Arc<Liveness>,
    cfg: HeartbeatConfig,
}

impl RemoteHeartbeat {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        delegate_id: impl Into<DelegateId>,
        version: impl Into<String>,
        manager: Arc<dyn ManagerClient>,
        outlet: Outlet,
        flights: InFlight,
        flags: Arc<LifecycleState>,
        liveness: Arc<Liveness>,
        cfg: HeartbeatConfig,
    ) -> Self {
        Self {
            delegate_id: delegate_id.into(),
            version: version.into(),
            manager,
            outlet,
            flights,
            flags,
            liveness,
            cfg,
        }
    }

    pub fn payload(&self, now: u64) -> Heartbeat {
        Heartbeat {
            delegate_id: self.delegate_id.clone(),
            last_heartbeat: now,
            version: self.version.clone(),
            currently_executing_task_ids: self.flights.executing_ids(),
            connected: self.outlet.is_connected(),
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.cfg.remote_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => self.beat().await,
            }
        }
        debug!("remote heartbeat stopped");
    }

    #[instrument(level = "debug", name = "remote_heartbeat", skip(self))]
    pub async fn beat(&self) {
        let now = now_millis();
        let heartbeat = self.payload(now);
        let limit = self.cfg.send_timeout;

        if self.outlet.is_connected() {
            match tokio::time::timeout(limit, self.outlet.send(heartbeat)).await {
                Ok(Ok(())) => self.liveness.sent(now),
                Ok(Err(e)) => warn!(error = %e, "failed to send heartbeat on push channel"),
                Err(_) => warn!(?limit, "timed out sending heartbeat on push channel"),
            }
            return;
        }

        match tokio::time::timeout(limit, self.manager.heartbeat(&heartbeat)).await {
            Ok(Ok(reply)) if reply.delegate_id == self.delegate_id => {
                self.liveness.sent(now);
                self.liveness.received(now_millis());
                if reply.is_deleted_for(&self.delegate_id) && self.flags.initiate_self_destruct() {
                    warn!("manager deleted this delegate; self-destructing");
                }
            }
            Ok(Ok(reply)) => {
                self.liveness.sent(now);
                info!(other = %reply.delegate_id, "heartbeat reply for another delegate");
            }
            Ok(Err(e)) => warn!(error = %e, "failed to send heartbeat"),
            Err(_) => warn!(?limit, "timed out sending heartbeat"),
        }
    }
}
