//! In-process task queue broker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use fleetd_id::ExecutionId;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{WorkerError, WorkflowError};

/// Maximum task queue name length.
pub const MAX_TASK_QUEUE_LEN: usize = 200;

/// Tasks buffered per queue before `submit` waits.
pub const TASK_QUEUE_CAPACITY: usize = 1024;

/// Validates a task queue name.
pub fn validate_task_queue(name: &str) -> Result<(), WorkerError> {
    let invalid = |reason: &str| WorkerError::InvalidTaskQueue {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_TASK_QUEUE_LEN {
        return Err(invalid("name is too long"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(invalid("name contains whitespace"));
    }
    Ok(())
}

/// A request to run a workflow.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Registered workflow name.
    pub workflow: String,

    /// Workflow input.
    pub input: Value,

    /// Workflow id. Defaults to the execution id.
    pub workflow_id: Option<String>,
}

impl TaskRequest {
    pub fn new(workflow: impl Into<String>, input: Value) -> Self {
        Self {
            workflow: workflow.into(),
            input,
            workflow_id: None,
        }
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }
}

/// A queued execution, as handed to a worker.
pub(crate) struct Task {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub workflow: String,
    pub input: Value,
    pub reply: oneshot::Sender<Result<Value, WorkflowError>>,
}

/// Handle to a submitted execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    execution_id: ExecutionId,
    workflow_id: String,
    rx: oneshot::Receiver<Result<Value, WorkflowError>>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Wait for the execution to finish.
    pub async fn result(self) -> Result<Value, WorkflowError> {
        let execution_id = self.execution_id;
        self.rx.await.map_err(|_| WorkflowError::ExecutionLost {
            execution_id: execution_id.to_string(),
        })?
    }
}

/// Receiving side of a task queue.
///
/// Several pollers on the same queue share one receiver; each task goes to
/// exactly one of them.
pub struct TaskPoller {
    task_queue: String,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
}

impl TaskPoller {
    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    /// Next task, or `None` once the queue is closed and drained.
    pub(crate) async fn next(&self) -> Option<Task> {
        self.rx.lock().await.recv().await
    }
}

/// Connects pollers to task queues for the worker pool.
pub trait WorkerConnector: Send + Sync {
    fn connect(&self, task_queue: &str) -> Result<TaskPoller, WorkerError>;
}

struct QueueSlot {
    tx: Option<mpsc::Sender<Task>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
}

impl QueueSlot {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(TASK_QUEUE_CAPACITY);
        Self {
            tx: Some(tx),
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

/// Broker of named task queues.
///
/// Queues are created on first use by either side, so executions submitted
/// before a worker connects stay buffered until one does.
#[derive(Clone, Default)]
pub struct TaskQueues {
    queues: Arc<Mutex<HashMap<String, QueueSlot>>>,
}

impl TaskQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit an execution to `task_queue`.
    pub async fn submit(
        &self,
        task_queue: &str,
        request: TaskRequest,
    ) -> Result<ExecutionHandle, WorkerError> {
        validate_task_queue(task_queue)?;

        let closed = || WorkerError::QueueClosed {
            task_queue: task_queue.to_string(),
        };

        let tx = {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = queues
                .entry(task_queue.to_string())
                .or_insert_with(QueueSlot::new);
            slot.tx.clone().ok_or_else(closed)?
        };

        let execution_id = ExecutionId::new();
        let workflow_id = request
            .workflow_id
            .unwrap_or_else(|| execution_id.to_string());
        let (reply, rx) = oneshot::channel();

        let task = Task {
            execution_id,
            workflow_id: workflow_id.clone(),
            workflow: request.workflow,
            input: request.input,
            reply,
        };

        debug!(
            task_queue,
            execution_id = %execution_id,
            workflow = %task.workflow,
            "Submitting execution"
        );
        tx.send(task).await.map_err(|_| closed())?;

        Ok(ExecutionHandle {
            execution_id,
            workflow_id,
            rx,
        })
    }

    /// Close `task_queue`. Buffered tasks are still delivered; pollers see
    /// the end of the queue afterwards and further submissions and
    /// connections fail. An unknown queue is created closed.
    pub fn close(&self, task_queue: &str) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues
            .entry(task_queue.to_string())
            .or_insert_with(QueueSlot::new)
            .tx = None;
    }

    /// Returns true if `task_queue` exists and is open.
    pub fn is_open(&self, task_queue: &str) -> bool {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_queue)
            .is_some_and(|slot| slot.tx.is_some())
    }
}

impl WorkerConnector for TaskQueues {
    fn connect(&self, task_queue: &str) -> Result<TaskPoller, WorkerError> {
        validate_task_queue(task_queue)?;

        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = queues
            .entry(task_queue.to_string())
            .or_insert_with(QueueSlot::new);

        if slot.tx.is_none() {
            return Err(WorkerError::QueueClosed {
                task_queue: task_queue.to_string(),
            });
        }

        Ok(TaskPoller {
            task_queue: task_queue.to_string(),
            rx: Arc::clone(&slot.rx),
        })
    }
}
