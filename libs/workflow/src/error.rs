//! Error types for the workflow engine.

use std::time::Duration;

use thiserror::Error;

// =============================================================================
// Remote Operations
// =============================================================================

/// Errors returned by an [`OperationBackend`](crate::OperationBackend).
#[derive(Debug, Error, Clone)]
pub enum InvokeError {
    /// The call did not complete within its timeout.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// The backend could not be reached.
    #[error("{operation} transport error: {message}")]
    Transport { operation: String, message: String },

    /// The backend answered with an error.
    #[error("{operation} failed with status {status} ({code}): {message}")]
    Remote {
        operation: String,
        status: u16,
        code: String,
        message: String,
    },

    /// The backend answer could not be decoded.
    #[error("{operation} returned an undecodable response: {message}")]
    Decode { operation: String, message: String },

    /// No backend knows this operation.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
}

impl InvokeError {
    /// Returns true if retrying the same call may succeed.
    ///
    /// Timeouts, transport failures and server-side (5xx) errors are
    /// retryable; client errors and decode failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            InvokeError::Timeout { .. } | InvokeError::Transport { .. } => true,
            InvokeError::Remote { status, .. } => *status >= 500,
            InvokeError::Decode { .. } | InvokeError::UnknownOperation(_) => false,
        }
    }

    /// Returns the remote error code, if the backend supplied one.
    pub fn code(&self) -> Option<&str> {
        match self {
            InvokeError::Remote { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// Returns the operation the error belongs to.
    pub fn operation(&self) -> &str {
        match self {
            InvokeError::Timeout { operation, .. }
            | InvokeError::Transport { operation, .. }
            | InvokeError::Remote { operation, .. }
            | InvokeError::Decode { operation, .. } => operation,
            InvokeError::UnknownOperation(operation) => operation,
        }
    }
}

// =============================================================================
// Journal
// =============================================================================

/// Errors from journal storage.
#[derive(Debug, Error, Clone)]
pub enum JournalError {
    #[error("journal storage error: {0}")]
    Storage(String),

    #[error("journal serialization error: {0}")]
    Serialization(String),
}

// =============================================================================
// Workflows
// =============================================================================

/// Errors that terminate a workflow execution.
#[derive(Debug, Error, Clone)]
pub enum WorkflowError {
    /// A domain failure raised by workflow code.
    #[error("{kind}: {message}")]
    Application {
        kind: String,
        message: String,
        non_retryable: bool,
    },

    /// A remote operation failed.
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    /// A signal channel was closed while being awaited.
    #[error("signal channel {channel} closed")]
    SignalClosed { channel: String },

    /// Input or output could not be (de)serialized.
    #[error("failed to decode {context}: {message}")]
    Decode { context: String, message: String },

    /// Journal storage failed.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// A replayed step does not match what was recorded.
    #[error(
        "non-deterministic replay of {workflow_id} at step {seq}: expected {expected}, recorded {recorded}"
    )]
    NonDeterministic {
        workflow_id: String,
        seq: u64,
        expected: String,
        recorded: String,
    },

    /// No handler is registered for the workflow name.
    #[error("unknown workflow {name} on task queue {task_queue}")]
    UnknownWorkflow { name: String, task_queue: String },

    /// Submitting or running the execution failed at the worker level.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// The execution ended without producing a result.
    #[error("execution {execution_id} ended without a result")]
    ExecutionLost { execution_id: String },
}

impl WorkflowError {
    /// Creates a non-retryable application error.
    pub fn application(kind: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::Application {
            kind: kind.into(),
            message: message.into(),
            non_retryable: true,
        }
    }

    /// Returns true if re-running the failed step may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::Application { non_retryable, .. } => !non_retryable,
            WorkflowError::Invoke(e) => e.is_retryable(),
            WorkflowError::Journal(_) => true,
            WorkflowError::SignalClosed { .. }
            | WorkflowError::Decode { .. }
            | WorkflowError::NonDeterministic { .. }
            | WorkflowError::UnknownWorkflow { .. }
            | WorkflowError::Worker(_)
            | WorkflowError::ExecutionLost { .. } => false,
        }
    }

    /// Returns the application error kind, if this is an application error.
    pub fn kind(&self) -> Option<&str> {
        match self {
            WorkflowError::Application { kind, .. } => Some(kind.as_str()),
            _ => None,
        }
    }

    pub(crate) fn decode(context: impl Into<String>, err: serde_json::Error) -> Self {
        WorkflowError::Decode {
            context: context.into(),
            message: err.to_string(),
        }
    }
}

// =============================================================================
// Workers
// =============================================================================

/// Errors from task queues, workers and the worker pool.
#[derive(Debug, Error, Clone)]
pub enum WorkerError {
    /// The task queue name is not acceptable.
    #[error("invalid task queue '{name}': {reason}")]
    InvalidTaskQueue { name: String, reason: String },

    /// The task queue was closed.
    #[error("task queue {task_queue} closed")]
    QueueClosed { task_queue: String },

    /// Connecting a poller to the task queue failed.
    #[error("failed to connect worker to {task_queue}: {message}")]
    Connect { task_queue: String, message: String },

    /// An execution panicked.
    #[error("execution on {task_queue} panicked: {message}")]
    ExecutionPanicked { task_queue: String, message: String },

    /// The pool's main worker is already running.
    #[error("worker pool already started")]
    AlreadyStarted,
}
