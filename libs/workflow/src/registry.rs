//! Workflow handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{WorkflowContext, WorkflowError};

/// Future returned by a type-erased workflow handler.
pub type WorkflowFuture = BoxFuture<'static, Result<Value, WorkflowError>>;

/// Type-erased workflow handler.
pub type WorkflowFn = Arc<dyn Fn(WorkflowContext, Value) -> WorkflowFuture + Send + Sync>;

/// Wraps a typed workflow function into a [`WorkflowFn`].
///
/// Input is decoded from JSON before the function runs; a decode failure
/// fails the execution without calling it.
pub fn workflow_fn<I, O, F, Fut>(f: F) -> WorkflowFn
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, WorkflowError>> + Send + 'static,
{
    Arc::new(move |ctx: WorkflowContext, input: Value| -> WorkflowFuture {
        let started = serde_json::from_value::<I>(input).map(|input| f(ctx, input));

        Box::pin(async move {
            let output = started
                .map_err(|e| WorkflowError::decode("workflow input", e))?
                .await?;
            serde_json::to_value(output).map_err(|e| WorkflowError::decode("workflow output", e))
        })
    })
}

/// Workflow handlers available on a worker, by workflow name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, WorkflowFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub fn register(&mut self, name: impl Into<String>, handler: WorkflowFn) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn with(mut self, name: impl Into<String>, handler: WorkflowFn) -> Self {
        self.register(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<WorkflowFn> {
        self.handlers.get(name).cloned()
    }

    /// Registered workflow names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("workflows", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Environment, Invoker, MemoryJournal, OperationBackend, SignalRegistry, TaskQueues, InvokeError};
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;

    struct NoBackend;

    #[async_trait]
    impl OperationBackend for NoBackend {
        async fn invoke(&self, operation: &str, _input: Value) -> Result<Value, InvokeError> {
            Err(InvokeError::UnknownOperation(operation.to_string()))
        }
    }

    fn ctx() -> WorkflowContext {
        let env = Environment {
            invoker: Arc::new(Invoker::new(Arc::new(NoBackend))),
            signals: SignalRegistry::new(),
            journal: Arc::new(MemoryJournal::new()),
            queues: TaskQueues::new(),
        };
        WorkflowContext::new(env, "wf", "q")
    }

    #[derive(Deserialize)]
    struct AddInput {
        a: i64,
        b: i64,
    }

    async fn add(_ctx: WorkflowContext, input: AddInput) -> Result<i64, WorkflowError> {
        Ok(input.a + input.b)
    }

    #[tokio::test]
    async fn test_workflow_fn_decodes_and_encodes() {
        let handler = workflow_fn(add);
        let out = handler(ctx(), json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(out, json!(5));
    }

    #[tokio::test]
    async fn test_workflow_fn_rejects_bad_input() {
        let handler = workflow_fn(add);
        let err = handler(ctx(), json!({"a": "two"})).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Decode { .. }));
    }

    #[test]
    fn test_registry_names() {
        let registry = HandlerRegistry::new()
            .with("sum", workflow_fn(add))
            .with("add", workflow_fn(add));

        assert_eq!(registry.names(), vec!["add", "sum"]);
        assert!(registry.get("sum").is_some());
        assert!(registry.get("deploy").is_none());
    }
}
