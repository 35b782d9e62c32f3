mod config;

use std::sync::Arc;

use anyhow::{Context, bail};
use dlg_core::{
    AgentState, Collaborators, ControlHandle, LifecycleController, RunnerError, RunnerRouter, SequenceFile,
    local::FileChannel, system,
};
use dlg_exec::{FnRunner, ScriptWatcher, ShellRunner};
use dlg_manager::{HttpManagerClient, WsPushTransport};
use dlg_model::LocalCommand;
use dlg_observe::init_logger;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AgentConfig;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SEQUENCE_FILE: &str = "sequence_config";
const CHANNEL_DIR: &str = "msg";

/// Task type answered in-process with a description of this host.
const HOST_INFO: &str = "HOST_INFO";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::from_env().context("invalid configuration")?;
    init_logger(&cfg.logger)?;
    info!(version = VERSION, manager = %cfg.manager_url, account = %cfg.account_id, "delegate starting");

    let manager_cfg = cfg.manager(VERSION);
    let manager = Arc::new(HttpManagerClient::new(&manager_cfg)?);

    let functions = FnRunner::new();
    functions.register(HOST_INFO, |_task, ctx| async move {
        Ok::<_, RunnerError>(json!({
            "delegateId": ctx.delegate_id,
            "hostName": system::host_name(),
            "ip": system::local_ip().to_string(),
            "pid": system::process_id(),
            "version": VERSION,
        }))
    });
    let router = RunnerRouter::new()
        .with(Arc::new(ShellRunner::new().with_cwd(&cfg.work_dir)))
        .with(Arc::new(functions));
    info!(runners = ?router.names(), "runners registered");

    let mut collab = Collaborators::new(manager, Arc::new(router));
    if cfg.poll_for_tasks {
        info!("polling for tasks");
    } else {
        collab.push = Some(Arc::new(WsPushTransport::new(&manager_cfg)?));
    }
    if cfg.watched {
        let root = cfg.work_dir.join(CHANNEL_DIR);
        collab.channel = Some(Arc::new(FileChannel::for_process(root, system::process_id())));
        collab.watcher = Some(Arc::new(ScriptWatcher::new(&cfg.work_dir)));
    }
    if cfg.requires_sequence() {
        collab.sequence = Some(SequenceFile::new(cfg.work_dir.join(SEQUENCE_FILE)));
    }

    let controller = LifecycleController::new(cfg.identity(VERSION), collab, cfg.engine());
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(controller.handle(), shutdown.clone()));

    match controller.run(shutdown).await {
        Ok(AgentState::SelfDestructed) => bail!("delegate self-destructed"),
        Ok(state) => {
            info!(%state, "delegate stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "delegate failed");
            Err(e.into())
        }
    }
}

/// First signal drains, the second one stops immediately.
async fn watch_signals(handle: ControlHandle, shutdown: CancellationToken) {
    let mut draining = false;
    loop {
        if let Err(e) = next_signal().await {
            warn!(error = %e, "signal handling unavailable");
            return;
        }
        if draining {
            info!("second signal; stopping now");
            shutdown.cancel();
            return;
        }
        info!("signal received; draining");
        draining = true;
        if !handle.send(LocalCommand::StopAcquiring).await {
            shutdown.cancel();
            return;
        }
    }
}

#[cfg(unix)]
async fn next_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn next_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
