//! # fleetd-workflow
//!
//! In-process execution engine for long-running, signal-driven workflows.
//!
//! ## Pieces
//!
//! - [`TaskQueues`]: named, bounded queues that executions are submitted to
//! - [`Worker`] / [`WorkerPool`]: pollers bound to one task queue each,
//!   organized into a main worker plus named groups
//! - [`HandlerRegistry`]: maps workflow names to type-erased handlers
//! - [`WorkflowContext`]: what a running workflow uses to call remote
//!   operations, wait on signals and start child workflows
//! - [`Invoker`]: routes operation names to backends, with per-call timeout
//!   and bounded retry
//! - [`SignalRegistry`]: named mailboxes for external events
//! - [`Journal`]: per-workflow record of completed steps
//!
//! ## Replay
//!
//! Every context operation draws a sequence number when it is created and
//! records its result in the journal under `(workflow_id, seq)`. A workflow
//! re-run under the same id replays recorded results instead of re-issuing
//! the side effect. The journal for a workflow id is cleared once its
//! execution reaches a terminal state.

mod context;
mod error;
mod invoke;
mod journal;
mod pool;
mod registry;
mod retry;
mod signal;
mod task_queue;
mod worker;

pub use context::{ChildOptions, Environment, WorkflowContext};
pub use error::{InvokeError, JournalError, WorkerError, WorkflowError};
pub use invoke::{CallOptions, Invoker, OperationBackend, DEFAULT_OPERATION_TIMEOUT};
pub use journal::{Journal, JournalEntry, MemoryJournal};
pub use pool::{main_task_queue, PoolStats, WorkerPool, DEFAULT_MAIN_QUEUE_SUFFIX, MAIN_WORKER_CONCURRENCY};
pub use registry::{workflow_fn, HandlerRegistry, WorkflowFn, WorkflowFuture};
pub use retry::{BackoffPolicy, RetryPolicy};
pub use signal::SignalRegistry;
pub use task_queue::{
    validate_task_queue, ExecutionHandle, TaskPoller, TaskQueues, TaskRequest, WorkerConnector,
    MAX_TASK_QUEUE_LEN, TASK_QUEUE_CAPACITY,
};
pub use worker::{Worker, WorkerOptions, DEFAULT_MAX_CONCURRENT_EXECUTIONS};
