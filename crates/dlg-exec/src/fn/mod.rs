use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use dlg_core::{RunContext, Runner, RunnerError};
use dlg_model::Task;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::ExecError;

type BoxFuture = Pin<Box<dyn Future<Output = Result<Value, RunnerError>> + Send>>;
type TaskFn = Arc<dyn Fn(Task, RunContext) -> BoxFuture + Send + Sync>;

/// Runner for in-process functions keyed by task type.
///
/// Functions must be registered before tasks of their type arrive.
pub struct FnRunner {
    name: &'static str,
    registry: Arc<RwLock<HashMap<String, TaskFn>>>,
}

impl FnRunner {
    pub fn new() -> Self {
        Self::with_name("fn")
    }

    pub fn with_name(name: &'static str) -> Self {
        Self {
            name,
            registry: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register `f` for `task_type`, replacing any previous function.
    pub fn register<F, Fut>(&self, task_type: impl Into<String>, f: F) -> &Self
    where
        F: Fn(Task, RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RunnerError>> + Send + 'static,
    {
        let task_type = task_type.into();
        let f: TaskFn = Arc::new(move |task, ctx| Box::pin(f(task, ctx)));
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_type.clone(), f);
        trace!(task_type, "function registered");
        self
    }

    pub fn unregister(&self, task_type: &str) -> bool {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_type)
            .is_some()
    }

    pub fn is_registered(&self, task_type: &str) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(task_type)
    }

    pub fn count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn lookup(&self, task_type: &str) -> Option<TaskFn> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_type)
            .cloned()
    }
}

impl Default for FnRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for FnRunner {
    fn name(&self) -> &'static str {
        self.name
    }

    fn supports(&self, task: &Task) -> bool {
        self.is_registered(&task.task_type)
    }

    async fn run(&self, task: &Task, ctx: RunContext) -> Result<Value, RunnerError> {
        let f = self
            .lookup(&task.task_type)
            .ok_or_else(|| ExecError::FunctionNotFound(task.task_type.clone()))?;
        debug!(task = %task.id, kind = %task.task_type, "running registered function");
        f(task.clone(), ctx).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn ctx() -> RunContext {
        RunContext {
            delegate_id: "d1".into(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn registered_function_runs() {
        let runner = FnRunner::new();
        runner.register("ADD", |task: Task, _ctx| async move {
            let a = task.parameters["a"].as_i64().unwrap_or(0);
            let b = task.parameters["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });

        let task = Task::new("t1", "ADD", 100).with_parameters(json!({"a": 2, "b": 3}));
        assert!(runner.supports(&task));
        assert_eq!(runner.run(&task, ctx()).await, Ok(json!(5)));
    }

    #[tokio::test]
    async fn unregistered_type_is_not_supported() {
        let runner = FnRunner::new();
        let task = Task::new("t1", "MISSING", 100);
        assert!(!runner.supports(&task));
        assert!(matches!(runner.run(&task, ctx()).await, Err(RunnerError::InvalidTask(_))));
    }

    #[test]
    fn register_replaces_and_unregister_removes() {
        let runner = FnRunner::with_name("custom");
        runner.register("A", |_t, _c| async { Ok(Value::Null) });
        runner.register("A", |_t, _c| async { Ok(json!(1)) });
        assert_eq!(runner.count(), 1);
        assert_eq!(runner.name(), "custom");

        assert!(runner.unregister("A"));
        assert!(!runner.is_registered("A"));
        assert!(!runner.unregister("A"));
    }
}
