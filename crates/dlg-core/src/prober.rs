use std::{sync::Arc, time::Duration};

use dlg_model::{Task, ValidationResult};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::router::RunnerRouter;

/// Evaluates whether this delegate can run a task.
#[derive(Clone)]
pub struct CapabilityProber {
    router: Arc<RunnerRouter>,
    timeout: Duration,
}

impl CapabilityProber {
    pub fn new(router: Arc<RunnerRouter>, timeout: Duration) -> Self {
        Self { router, timeout }
    }

    /// One result per criterion, in criteria order.
    ///
    /// A criterion that errors, panics, times out or is cancelled counts as
    /// not validated. A task without criteria yields a single passing result
    /// named after its type; a task without a runner yields a failing one.
    #[instrument(level = "debug", skip_all, fields(task = %task.id, kind = %task.task_type))]
    pub async fn probe(&self, task: &Task, cancel: CancellationToken) -> Vec<ValidationResult> {
        let criteria = match self.router.criteria(task) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "cannot validate task");
                return vec![ValidationResult::new(task.task_type.clone(), false)];
            }
        };
        if criteria.is_empty() {
            debug!("no capability criteria; task is runnable");
            return vec![ValidationResult::new(task.task_type.clone(), true)];
        }

        let mut results: Vec<ValidationResult> = criteria
            .iter()
            .map(|c| ValidationResult::new(c.describe(), false))
            .collect();

        let mut set = JoinSet::new();
        for (idx, criterion) in criteria.into_iter().enumerate() {
            let cancel = cancel.clone();
            let limit = self.timeout;
            set.spawn(async move {
                let name = criterion.describe();
                let validated = tokio::select! {
                    _ = cancel.cancelled() => false,
                    res = tokio::time::timeout(limit, criterion.check(&cancel)) => match res {
                        Ok(Ok(v)) => v,
                        Ok(Err(e)) => {
                            warn!(criteria = %name, error = %e, "criterion check failed");
                            false
                        }
                        Err(_) => {
                            warn!(criteria = %name, ?limit, "criterion check timed out");
                            false
                        }
                    },
                };
                (idx, validated)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, validated)) => results[idx].validated = validated,
                Err(e) => warn!(error = %e, "criterion check aborted"),
            }
        }

        debug!(?results, "capability probe finished");
        results
    }
}
