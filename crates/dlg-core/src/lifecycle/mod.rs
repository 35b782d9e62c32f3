//! Process lifecycle: registration, the running engine, drain, pause and
//! resume, upgrade staging and termination.

mod flags;
mod upgrade;

pub use flags::LifecycleState;
pub use upgrade::{RUN_SCRIPTS, UpgradeCheck, cleanup_versions, stage_scripts};

use std::{fmt, sync::Arc, time::Duration};

use dlg_model::{DelegateId, LocalCommand, LocalStatus, Registration, SequenceToken};
use tokio::{
    sync::{mpsc, watch},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    config::EngineConfig,
    dispatcher::Dispatcher,
    error::CoreError,
    heartbeat::{Liveness, LocalHeartbeat, RemoteHeartbeat},
    local::{LocalChannel, WatcherControl},
    manager::ManagerClient,
    router::RunnerRouter,
    sequence::SequenceFile,
    source::{EventStream, Inbound, Outlet, PushTransport},
    state::InFlight,
    system::{self, now_millis},
};

const INBOUND_BUFFER: usize = 256;
const COMMAND_BUFFER: usize = 16;
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Starting,
    Registering,
    Connected,
    /// Not acquiring; waiting for executing tasks to finish.
    Draining,
    /// Drained; event sources closed until resumed.
    Paused,
    Terminated,
    SelfDestructed,
}

impl AgentState {
    pub fn is_final(&self) -> bool {
        matches!(self, AgentState::Terminated | AgentState::SelfDestructed)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AgentState::Starting => "starting",
            AgentState::Registering => "registering",
            AgentState::Connected => "connected",
            AgentState::Draining => "draining",
            AgentState::Paused => "paused",
            AgentState::Terminated => "terminated",
            AgentState::SelfDestructed => "self-destructed",
        })
    }
}

/// Who this delegate says it is when registering.
#[derive(Debug, Clone, Default)]
pub struct AgentIdentity {
    pub account_id: String,
    pub name: String,
    pub delegate_type: Option<String>,
    pub group_name: Option<String>,
    pub description: String,
    pub version: String,
    pub host_name: String,
    pub ip: String,
}

impl AgentIdentity {
    /// Identity with host name and address read from the machine.
    pub fn detect(account_id: impl Into<String>, version: impl Into<String>) -> Self {
        let host_name = system::host_name();
        Self {
            account_id: account_id.into(),
            name: host_name.clone(),
            version: version.into(),
            ip: system::local_ip().to_string(),
            host_name,
            ..Self::default()
        }
    }
}

/// Outer collaborators of the engine.
pub struct Collaborators {
    pub manager: Arc<dyn ManagerClient>,
    pub router: Arc<RunnerRouter>,
    pub push: Option<Arc<dyn PushTransport>>,
    pub channel: Option<Arc<dyn LocalChannel>>,
    pub watcher: Option<Arc<dyn WatcherControl>>,
    pub sequence: Option<SequenceFile>,
}

impl Collaborators {
    pub fn new(manager: Arc<dyn ManagerClient>, router: Arc<RunnerRouter>) -> Self {
        Self {
            manager,
            router,
            push: None,
            channel: None,
            watcher: None,
            sequence: None,
        }
    }
}

/// Drives a running [`LifecycleController`] from outside, e.g. from signal handlers.
#[derive(Clone)]
pub struct ControlHandle {
    commands: mpsc::Sender<LocalCommand>,
    state: watch::Receiver<AgentState>,
    flags: Arc<LifecycleState>,
}

impl ControlHandle {
    /// `false` once the controller is gone.
    pub async fn send(&self, command: LocalCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn flags(&self) -> &LifecycleState {
        &self.flags
    }

    /// Wait until the controller reaches `target` or a final state.
    pub async fn wait_for(&mut self, target: AgentState) -> AgentState {
        let reached = self
            .state
            .wait_for(|s| *s == target || s.is_final())
            .await
            .map(|s| *s);
        match reached {
            Ok(s) => s,
            Err(_) => *self.state.borrow(),
        }
    }
}

/// Owns the delegate process lifecycle.
pub struct LifecycleController {
    identity: AgentIdentity,
    collab: Collaborators,
    cfg: EngineConfig,
    flags: Arc<LifecycleState>,
    state: watch::Sender<AgentState>,
    commands_tx: mpsc::Sender<LocalCommand>,
    commands_rx: mpsc::Receiver<LocalCommand>,
}

/// Parts that only exist once the delegate is registered.
struct Running {
    delegate_id: DelegateId,
    dispatcher: Dispatcher,
    liveness: Arc<Liveness>,
    local: Option<Arc<LocalHeartbeat>>,
    paused: watch::Sender<bool>,
}

impl LifecycleController {
    pub fn new(identity: AgentIdentity, collab: Collaborators, cfg: EngineConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state, _) = watch::channel(AgentState::Starting);
        Self {
            identity,
            collab,
            cfg,
            flags: Arc::new(LifecycleState::new()),
            state,
            commands_tx,
            commands_rx,
        }
    }

    pub fn flags(&self) -> Arc<LifecycleState> {
        Arc::clone(&self.flags)
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            commands: self.commands_tx.clone(),
            state: self.state.subscribe(),
            flags: Arc::clone(&self.flags),
        }
    }

    fn set_state(&self, next: AgentState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!(from = %prev, to = %next, "lifecycle transition");
        }
    }

    /// Run until shutdown, a finished drain (when configured to exit) or self-destruct.
    #[instrument(name = "lifecycle", skip_all, fields(version = %self.identity.version))]
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<AgentState, CoreError> {
        let stop = shutdown.child_token();
        let mut tasks = JoinSet::new();

        if let Some(channel) = self.collab.channel.clone() {
            tasks.spawn(command_inbox(
                Arc::clone(&channel),
                self.commands_tx.clone(),
                self.cfg.lifecycle.command_poll,
                stop.clone(),
            ));
            if self.cfg.lifecycle.watched {
                if let Err(e) = channel.announce_started().await {
                    warn!(error = %e, "failed to announce start to watcher");
                }
                if !self.wait_for_go_ahead(&stop).await {
                    return Ok(self.teardown(AgentState::Terminated, None, tasks, &stop).await);
                }
            }
        }

        self.set_state(AgentState::Registering);
        let delegate_id = match self.register(&stop).await {
            Ok(id) => id,
            Err(e) => {
                let outcome = if self.flags.is_self_destructing() {
                    AgentState::SelfDestructed
                } else if stop.is_cancelled() {
                    AgentState::Terminated
                } else {
                    error!(error = %e, "registration failed");
                    self.teardown(AgentState::Terminated, None, tasks, &stop).await;
                    return Err(e);
                };
                return Ok(self.teardown(outcome, None, tasks, &stop).await);
            }
        };

        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let running = self.start(delegate_id, inbound_tx, &mut tasks, &stop);
        self.set_state(AgentState::Connected);

        let (drained_tx, mut drained_rx) = mpsc::channel::<bool>(1);
        let mut drain: Option<JoinHandle<()>> = None;
        let mut check = tokio::time::interval(Duration::from_secs(1));

        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break AgentState::Terminated,

                Some(inbound) = inbound_rx.recv() => self.on_inbound(inbound, &running).await,

                Some(command) = self.commands_rx.recv() => {
                    info!(command = command.as_str(), "lifecycle command");
                    match command {
                        LocalCommand::StopAcquiring => {
                            if let Some(h) = self.begin_drain(running.dispatcher.in_flight().clone(), drained_tx.clone()) {
                                drain = Some(h);
                            }
                            publish(&running.local).await;
                        }
                        LocalCommand::Resume => {
                            if let Some(h) = drain.take() {
                                h.abort();
                            }
                            self.resume(&running);
                            publish(&running.local).await;
                        }
                        LocalCommand::SelfDestruct => {
                            self.flags.initiate_self_destruct();
                        }
                        LocalCommand::Upgrading => self.flags.set_upgrade_needed(false),
                        LocalCommand::GoAhead => debug!("go-ahead already received"),
                    }
                }

                Some(finished) = drained_rx.recv() => {
                    drain = None;
                    self.pause(&running, finished);
                    if self.cfg.lifecycle.exit_when_drained {
                        break AgentState::Terminated;
                    }
                }

                _ = check.tick() => {
                    if self.flags.is_self_destructing() {
                        break AgentState::SelfDestructed;
                    }
                }
            }
        };

        if let Some(h) = drain {
            h.abort();
        }
        Ok(self.teardown(outcome, Some(running), tasks, &stop).await)
    }

    /// Spawn every loop that runs while registered.
    fn start(
        &self,
        delegate_id: DelegateId,
        inbound: mpsc::Sender<Inbound>,
        tasks: &mut JoinSet<()>,
        stop: &CancellationToken,
    ) -> Running {
        let manager = Arc::clone(&self.collab.manager);
        let version = self.identity.version.clone();
        let dispatcher = Dispatcher::new(
            delegate_id.clone(),
            Arc::clone(&manager),
            Arc::clone(&self.collab.router),
            Arc::clone(&self.flags),
            &self.cfg,
        );
        let flights: InFlight = dispatcher.in_flight().clone();
        let outlet = Outlet::new();
        let liveness = Arc::new(Liveness::new(now_millis()));
        let (paused, paused_rx) = watch::channel(false);

        let stream = EventStream::new(
            delegate_id.clone(),
            Arc::clone(&manager),
            self.collab.push.clone(),
            self.cfg.source.clone(),
            outlet.clone(),
            Arc::clone(&self.flags),
            paused_rx,
        );
        tasks.spawn(stream.run(inbound, stop.clone()));

        let remote = RemoteHeartbeat::new(
            delegate_id.clone(),
            version.clone(),
            Arc::clone(&manager),
            outlet,
            flights.clone(),
            Arc::clone(&self.flags),
            Arc::clone(&liveness),
            self.cfg.heartbeat.clone(),
        );
        tasks.spawn(remote.run(stop.clone()));

        let local = match (&self.collab.channel, &self.collab.watcher) {
            (Some(channel), Some(watcher)) if self.cfg.lifecycle.watched => {
                let local = Arc::new(LocalHeartbeat::new(
                    Arc::clone(channel),
                    Arc::clone(watcher),
                    Arc::clone(&self.flags),
                    Arc::clone(&liveness),
                    flights,
                    version.clone(),
                    self.cfg.lifecycle.watcher_version.clone(),
                    self.cfg.heartbeat.clone(),
                ));
                tasks.spawn(Arc::clone(&local).run(stop.clone()));
                Some(local)
            }
            _ => None,
        };

        if let Some(every) = self.cfg.lifecycle.upgrade_interval {
            let check = UpgradeCheck::new(
                delegate_id.clone(),
                version,
                manager,
                Arc::clone(&self.flags),
                self.cfg.lifecycle.work_dir.clone(),
                self.cfg.lifecycle.upgrade_timeout,
            );
            tasks.spawn(check.run(every, stop.clone()));
        }

        Running {
            delegate_id,
            dispatcher,
            liveness,
            local,
            paused,
        }
    }

    async fn wait_for_go_ahead(&mut self, stop: &CancellationToken) -> bool {
        let limit = self.cfg.lifecycle.go_ahead_timeout;
        info!(timeout = ?limit, "waiting for go-ahead from watcher");

        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = stop.cancelled() => return false,
                _ = &mut deadline => {
                    warn!("no go-ahead from watcher; proceeding");
                    return true;
                }
                command = self.commands_rx.recv() => match command {
                    Some(LocalCommand::GoAhead) | None => {
                        info!("received go-ahead");
                        return true;
                    }
                    Some(LocalCommand::SelfDestruct) => {
                        self.flags.initiate_self_destruct();
                        return true;
                    }
                    Some(other) => debug!(command = other.as_str(), "ignoring command before go-ahead"),
                }
            }
        }
    }

    /// Register until the manager answers, acquisition stops or shutdown.
    async fn register(&self, stop: &CancellationToken) -> Result<DelegateId, CoreError> {
        let retry = self.cfg.lifecycle.registration_retry;
        let mut attempt = 0u32;

        while self.flags.is_acquiring() && !stop.is_cancelled() {
            attempt += 1;
            let registration = self.registration().await;
            info!(attempt, account = %self.identity.account_id, "registering delegate");

            match self.collab.manager.register(&registration).await {
                Ok(reply) if reply.is_self_destruct() => {
                    if self.flags.initiate_self_destruct() {
                        warn!("manager refused registration; self-destructing");
                    }
                    break;
                }
                Ok(reply) => {
                    let token = SequenceToken::from_parts(
                        reply.delegate_random_token.as_deref(),
                        reply.sequence_num.as_deref(),
                    );
                    if let Some(token) = token {
                        self.persist_sequence(token).await;
                    }
                    info!(delegate_id = %reply.delegate_id, status = ?reply.status, "delegate registered");
                    return Ok(reply.delegate_id);
                }
                Err(e) => error!(attempt, error = %e, retry_in = ?retry, "unable to register delegate"),
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(retry) => {}
            }
        }

        let why = if self.flags.is_self_destructing() {
            "self-destruct ordered"
        } else if stop.is_cancelled() {
            "shutdown requested"
        } else {
            "no longer acquiring tasks"
        };
        Err(CoreError::RegistrationAbandoned(why.to_string()))
    }

    async fn registration(&self) -> Registration {
        let token = match self.collab.sequence.clone() {
            Some(file) => match tokio::task::spawn_blocking(move || file.ensure()).await {
                Ok(Ok(token)) => Some(token),
                Ok(Err(e)) => {
                    warn!(error = %e, "unable to read sequence file");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "sequence file read aborted");
                    None
                }
            },
            None => None,
        };
        let id = &self.identity;

        Registration {
            delegate_id: None,
            account_id: id.account_id.clone(),
            host_name: id.host_name.clone(),
            ip: id.ip.clone(),
            delegate_name: id.name.clone(),
            delegate_type: id.delegate_type.clone(),
            delegate_group_name: id.group_name.clone(),
            description: id.description.clone(),
            version: id.version.clone(),
            last_heartbeat: now_millis(),
            sequence_num: token.as_ref().and_then(|t| t.sequence.clone()),
            delegate_random_token: token.map(|t| t.token),
        }
    }

    async fn persist_sequence(&self, token: SequenceToken) {
        let Some(file) = self.collab.sequence.clone() else {
            return;
        };
        match tokio::task::spawn_blocking(move || file.write(&token)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "unable to persist sequence number"),
            Err(e) => warn!(error = %e, "sequence file write aborted"),
        }
    }

    async fn on_inbound(&self, inbound: Inbound, running: &Running) {
        match inbound {
            Inbound::Event(event) if event.abort => {
                running.dispatcher.abort(&event.task_id);
            }
            Inbound::Event(event) => {
                let dispatcher = running.dispatcher.clone();
                tokio::spawn(async move { dispatcher.handle(event).await });
            }
            Inbound::HeartbeatAck { delegate_id, sequence } => {
                if delegate_id != running.delegate_id {
                    info!(other = %delegate_id, "heartbeat ack for another delegate");
                    return;
                }
                running.liveness.received(now_millis());
                if let Some(token) = sequence {
                    self.persist_sequence(token).await;
                }
            }
            Inbound::SelfDestruct => {
                if self.flags.initiate_self_destruct() {
                    warn!("manager ordered self-destruct");
                }
            }
            Inbound::KeepAlive => trace!("keepalive"),
        }
    }

    /// Stop acquiring and wait for executing tasks in the background.
    /// `None` when a drain is already under way.
    fn begin_drain(&self, flights: InFlight, done: mpsc::Sender<bool>) -> Option<JoinHandle<()>> {
        if !self.flags.stop_acquiring(now_millis()) {
            info!("already stopped acquiring tasks");
            return None;
        }
        self.set_state(AgentState::Draining);

        let limit = self.cfg.lifecycle.drain_timeout;
        let every = self.cfg.lifecycle.drain_poll;
        info!(executing = flights.executing_len(), timeout = ?limit, "stopped acquiring tasks; draining");

        Some(tokio::spawn(async move {
            let finished = drain(flights, limit, every).await;
            let _ = done.send(finished).await;
        }))
    }

    fn pause(&self, running: &Running, finished: bool) {
        if finished {
            info!("all executing tasks completed");
        } else {
            warn!(
                remaining = ?running.dispatcher.in_flight().executing_ids(),
                "drain timed out with tasks still executing"
            );
        }
        running.paused.send_replace(true);
        self.set_state(AgentState::Paused);
    }

    fn resume(&self, running: &Running) {
        self.flags.resume();
        running.paused.send_replace(false);
        self.set_state(AgentState::Connected);
        info!("resumed acquiring tasks");
    }

    async fn teardown(
        &self,
        outcome: AgentState,
        running: Option<Running>,
        mut tasks: JoinSet<()>,
        stop: &CancellationToken,
    ) -> AgentState {
        stop.cancel();
        let joined = tokio::time::timeout(TEARDOWN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            warn!("background loops did not stop in time; aborting them");
            tasks.shutdown().await;
        }

        if let Some(running) = &running {
            let left = running.dispatcher.in_flight().executing_ids();
            if !left.is_empty() {
                warn!(tasks = ?left, "terminating with tasks still executing");
            }
        }

        if self.flags.is_upgrade_pending() {
            let dir = self.cfg.lifecycle.work_dir.clone();
            let current = self.identity.version.clone();
            let next = self.flags.upgrade_version();
            let cleaned = tokio::task::spawn_blocking(move || {
                cleanup_versions(&dir, &current, next.as_deref())
            })
            .await;
            match cleaned {
                Ok(Ok(n)) => info!(removed = n, "old version artifacts cleaned up"),
                Ok(Err(e)) => warn!(error = %e, "unable to clean up old versions"),
                Err(e) => warn!(error = %e, "version cleanup aborted"),
            }
        }

        if let Some(channel) = &self.collab.channel {
            let res = if outcome == AgentState::SelfDestructed {
                channel.publish(&LocalStatus::self_destructing()).await
            } else {
                channel.close().await
            };
            if let Err(e) = res {
                warn!(error = %e, "unable to finalize local channel");
            }
        }

        self.set_state(outcome);
        outcome
    }
}

async fn publish(local: &Option<Arc<LocalHeartbeat>>) {
    if let Some(local) = local {
        local.publish().await;
    }
}

/// Poll until nothing is executing. `false` if `limit` passed first.
async fn drain(flights: InFlight, limit: Duration, every: Duration) -> bool {
    let started = tokio::time::Instant::now();
    loop {
        let left = flights.executing_len();
        if left == 0 {
            return true;
        }
        if started.elapsed() >= limit {
            return false;
        }
        debug!(executing = left, elapsed = ?started.elapsed(), "waiting for tasks to complete");
        tokio::time::sleep(every).await;
    }
}

async fn command_inbox(
    channel: Arc<dyn LocalChannel>,
    commands: mpsc::Sender<LocalCommand>,
    every: Duration,
    stop: CancellationToken,
) {
    let mut tick = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tick.tick() => match channel.take_commands().await {
                Ok(taken) => {
                    for command in taken {
                        if commands.send(command).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "unable to read watcher commands"),
            },
        }
    }
}
