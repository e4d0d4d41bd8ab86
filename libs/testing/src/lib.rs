//! # fleetd-testing
//!
//! Test doubles shared by the fleetd crates.
//!
//! [`FakeController`] stands in for the controller and power drivers: tests
//! script a response per operation and assert on the calls afterwards. Hooks
//! registered with [`FakeController::on_call`] let a test react to a call,
//! for example by delivering the events a machine emits once powered.
//! [`environment`] wires it into an engine [`Environment`] with an in-memory
//! journal and no retries.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use fleetd_workflow::{
    Environment, InvokeError, Invoker, Journal, MemoryJournal, OperationBackend, RetryPolicy,
    SignalRegistry, TaskQueues,
};
use serde_json::Value;

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub operation: String,
    pub input: Value,
}

#[derive(Debug, Clone)]
enum Scripted {
    Respond(Value),
    Fail(InvokeError),
}

type Hook = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct State {
    once: HashMap<String, VecDeque<Scripted>>,
    sticky: HashMap<String, Scripted>,
    calls: Vec<RecordedCall>,
    hooks: HashMap<String, Hook>,
}

/// Scripted operation backend.
///
/// One-shot responses are consumed first, in order; after that the sticky
/// response for the operation applies. Unscripted operations answer `null`.
#[derive(Default)]
pub struct FakeController {
    state: Mutex<State>,
}

impl FakeController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Always answer `operation` with `output`.
    pub fn respond(&self, operation: &str, output: Value) -> &Self {
        self.state()
            .sticky
            .insert(operation.to_string(), Scripted::Respond(output));
        self
    }

    /// Answer the next call to `operation` with `output`.
    pub fn respond_once(&self, operation: &str, output: Value) -> &Self {
        self.state()
            .once
            .entry(operation.to_string())
            .or_default()
            .push_back(Scripted::Respond(output));
        self
    }

    /// Always fail `operation` with `error`.
    pub fn fail(&self, operation: &str, error: InvokeError) -> &Self {
        self.state()
            .sticky
            .insert(operation.to_string(), Scripted::Fail(error));
        self
    }

    /// Fail the next call to `operation` with `error`.
    pub fn fail_once(&self, operation: &str, error: InvokeError) -> &Self {
        self.state()
            .once
            .entry(operation.to_string())
            .or_default()
            .push_back(Scripted::Fail(error));
        self
    }

    /// Run `hook` with the input of every call to `operation`, before the
    /// call is answered. Replaces any earlier hook for `operation`.
    pub fn on_call<F>(&self, operation: &str, hook: F) -> &Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.state()
            .hooks
            .insert(operation.to_string(), Arc::new(hook));
        self
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    /// Inputs of every call to `operation`, in order.
    pub fn calls_to(&self, operation: &str) -> Vec<Value> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.input.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    /// Names of the operations called, in order.
    pub fn operations(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .map(|c| c.operation.clone())
            .collect()
    }
}

#[async_trait]
impl OperationBackend for FakeController {
    async fn invoke(&self, operation: &str, input: Value) -> Result<Value, InvokeError> {
        let (scripted, hook) = {
            let mut state = self.state();
            state.calls.push(RecordedCall {
                operation: operation.to_string(),
                input: input.clone(),
            });

            let once = state.once.get_mut(operation).and_then(VecDeque::pop_front);
            let scripted = once.or_else(|| state.sticky.get(operation).cloned());
            (scripted, state.hooks.get(operation).cloned())
        };

        if let Some(hook) = hook {
            hook(&input);
        }

        match scripted.unwrap_or(Scripted::Respond(Value::Null)) {
            Scripted::Respond(output) => Ok(output),
            Scripted::Fail(error) => Err(error),
        }
    }
}

/// A remote rejection with `status` and `code`.
pub fn remote_error(operation: &str, status: u16, code: &str) -> InvokeError {
    InvokeError::Remote {
        operation: operation.to_string(),
        status,
        code: code.to_string(),
        message: format!("{operation} rejected"),
    }
}

/// Engine environment backed by `backend`, with no retries and an
/// in-memory journal.
pub fn environment(backend: Arc<dyn OperationBackend>) -> Environment {
    environment_with_journal(backend, Arc::new(MemoryJournal::new()))
}

/// Like [`environment`], with a caller-supplied journal.
pub fn environment_with_journal(
    backend: Arc<dyn OperationBackend>,
    journal: Arc<dyn Journal>,
) -> Environment {
    Environment {
        invoker: Arc::new(Invoker::new(backend).with_retry_policy(RetryPolicy::none())),
        signals: SignalRegistry::new(),
        journal,
        queues: TaskQueues::new(),
    }
}
