use std::{collections::HashMap, path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use dlg_core::{Criterion, RunContext, Runner, RunnerError};
use dlg_model::Task;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::{
    criteria::{CommandAvailable, TcpReachable},
    error::ExecError,
    util::{kill_graceful, shell_command},
    utils::{ProcessLimits, attach_limits},
};

/// Task type handled by [`ShellRunner`].
pub const SHELL_SCRIPT: &str = "SHELL_SCRIPT";

const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

fn default_true() -> bool {
    true
}

/// Parameters of a `SHELL_SCRIPT` task.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellParams {
    pub script: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub fail_on_non_zero: bool,
    /// Programs that must be on `PATH` for this delegate to take the task.
    #[serde(default)]
    pub required_commands: Vec<String>,
    /// `host:port` endpoints that must be reachable.
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub limits: ProcessLimits,
}

/// Runs `SHELL_SCRIPT` tasks through `sh -c` (`cmd /C` on Windows).
///
/// The result carries the exit code and the tail of stdout and stderr.
pub struct ShellRunner {
    name: &'static str,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    connect_timeout: Duration,
    output_limit: usize,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            name: "shell",
            env: Vec::new(),
            cwd: None,
            connect_timeout: Duration::from_secs(5),
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Environment every script inherits; task parameters override it.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Working directory when the task names none.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = bytes.max(1);
        self
    }

    fn params(task: &Task) -> Result<ShellParams, ExecError> {
        serde_json::from_value(task.parameters.clone())
            .map_err(|e| ExecError::InvalidParameters(e.to_string()))
    }
}

#[async_trait]
impl Runner for ShellRunner {
    fn name(&self) -> &'static str {
        self.name
    }

    fn supports(&self, task: &Task) -> bool {
        task.task_type == SHELL_SCRIPT
    }

    fn criteria(&self, task: &Task) -> Result<Vec<Arc<dyn Criterion>>, RunnerError> {
        let params = Self::params(task)?;
        let mut criteria: Vec<Arc<dyn Criterion>> = Vec::new();
        for program in params.required_commands {
            criteria.push(Arc::new(CommandAvailable::new(program)));
        }
        for target in params.targets {
            criteria.push(Arc::new(TcpReachable::new(target, self.connect_timeout)));
        }
        Ok(criteria)
    }

    async fn run(&self, task: &Task, ctx: RunContext) -> Result<Value, RunnerError> {
        let params = Self::params(task)?;
        if params.script.trim().is_empty() {
            return Err(ExecError::MissingScript.into());
        }

        let mut cmd = shell_command(&params.script);
        if let Some(cwd) = params.cwd.as_ref().or(self.cwd.as_ref()) {
            cmd.current_dir(cwd);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        for (k, v) in &params.env {
            cmd.env(k, v);
        }
        cmd.env("DELEGATE_ID", &ctx.delegate_id)
            .env("TASK_ID", task.id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        attach_limits(&mut cmd, &params.limits);

        trace!(task = %task.id, script = %params.script, "spawn");
        let mut child = cmd.spawn().map_err(|e| ExecError::Spawn(e.to_string()))?;

        let limit = self.output_limit;
        let stdout = tokio::spawn(capture(child.stdout.take(), limit));
        let stderr = tokio::spawn(capture(child.stderr.take(), limit));

        let status = tokio::select! {
            status = child.wait() => status.map_err(ExecError::from)?,
            _ = ctx.cancel.cancelled() => {
                debug!(task = %task.id, "cancelled; killing child");
                let _ = kill_graceful(&mut child).await;
                return Err(ExecError::Cancelled.into());
            }
        };
        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();

        if !status.success() && params.fail_on_non_zero {
            let err = match status.code() {
                Some(code) => ExecError::NonZeroExit { code },
                None => ExecError::KilledBySignal,
            };
            debug!(task = %task.id, error = %err, "script failed");
            let detail = stderr.trim();
            return Err(RunnerError::Failed(if detail.is_empty() {
                err.to_string()
            } else {
                format!("{err}: {detail}")
            }));
        }

        Ok(json!({
            "exitCode": status.code(),
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

/// Read a pipe to the end, keeping only the last `limit` bytes.
async fn capture<R: AsyncRead + Unpin>(pipe: Option<R>, limit: usize) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut kept: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > limit * 2 {
                    kept.drain(..kept.len() - limit);
                }
            }
        }
    }
    if kept.len() > limit {
        kept.drain(..kept.len() - limit);
    }
    String::from_utf8_lossy(&kept).into_owned()
}
