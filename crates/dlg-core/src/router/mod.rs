use std::sync::Arc;

use dlg_model::Task;
use serde_json::Value;
use tracing::{instrument, trace};

use crate::runner::{Criterion, RunContext, Runner, RunnerError};

/// Picks the first registered runner that supports a task.
#[derive(Default)]
pub struct RunnerRouter {
    runners: Vec<Arc<dyn Runner>>,
}

impl RunnerRouter {
    #[inline]
    pub fn new() -> Self {
        Self { runners: Vec::new() }
    }

    #[inline]
    pub fn register(&mut self, runner: Arc<dyn Runner>) {
        self.runners.push(runner);
    }

    #[inline]
    pub fn with(mut self, runner: Arc<dyn Runner>) -> Self {
        self.register(runner);
        self
    }

    pub fn pick(&self, task: &Task) -> Option<&Arc<dyn Runner>> {
        self.runners.iter().find(|r| r.supports(task))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.runners.iter().map(|r| r.name()).collect()
    }

    fn require(&self, task: &Task) -> Result<&Arc<dyn Runner>, RunnerError> {
        self.pick(task)
            .ok_or_else(|| RunnerError::NoRunner(task.task_type.clone()))
    }

    pub fn criteria(&self, task: &Task) -> Result<Vec<Arc<dyn Criterion>>, RunnerError> {
        self.require(task)?.criteria(task)
    }

    #[instrument(level = "trace", skip(self, task, ctx), fields(task = %task.id, kind = %task.task_type))]
    pub async fn run(&self, task: &Task, ctx: RunContext) -> Result<Value, RunnerError> {
        let r = self.require(task)?;
        trace!(runner = r.name(), "runner picked");
        r.run(task, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;

    struct Echo;

    #[async_trait]
    impl Runner for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn supports(&self, task: &Task) -> bool {
            task.task_type == "ECHO"
        }
        async fn run(&self, task: &Task, _ctx: RunContext) -> Result<Value, RunnerError> {
            Ok(task.parameters.clone())
        }
    }

    fn ctx() -> RunContext {
        RunContext {
            delegate_id: "d1".into(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn routes_by_task_type() {
        let router = RunnerRouter::new().with(Arc::new(Echo));
        let task = Task::new("t1", "ECHO", 10).with_parameters(serde_json::json!({"x": 1}));

        assert_eq!(router.run(&task, ctx()).await, Ok(serde_json::json!({"x": 1})));
        assert_eq!(router.names(), vec!["echo"]);
    }

    #[tokio::test]
    async fn unknown_type_has_no_runner() {
        let router = RunnerRouter::new().with(Arc::new(Echo));
        let task = Task::new("t1", "HTTP", 10);

        assert_eq!(
            router.run(&task, ctx()).await,
            Err(RunnerError::NoRunner("HTTP".into()))
        );
        assert!(router.criteria(&task).is_err());
    }
}
