//! Task queue workers.
//!
//! A worker polls one task queue and runs each execution as its own task,
//! bounded by a semaphore. Stopping a worker ends the poll loop; executions
//! already running are detached and finish on their own.

use std::any::Any;
use std::sync::Arc;

use fleetd_id::WorkerId;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::task_queue::Task;
use crate::{Environment, HandlerRegistry, TaskPoller, WorkerError, WorkflowContext, WorkflowError};

/// Default per-worker execution limit.
pub const DEFAULT_MAX_CONCURRENT_EXECUTIONS: usize = 64;

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Executions this worker runs at once.
    pub max_concurrent_executions: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_executions: DEFAULT_MAX_CONCURRENT_EXECUTIONS,
        }
    }
}

impl WorkerOptions {
    pub fn with_max_concurrent_executions(max: usize) -> Self {
        Self {
            max_concurrent_executions: max,
        }
    }
}

/// A running worker bound to one task queue.
pub struct Worker {
    id: WorkerId,
    task_queue: String,
    shutdown_tx: watch::Sender<bool>,
    task_handle: JoinHandle<()>,
}

impl Worker {
    /// Start polling `poller`.
    ///
    /// Fatal errors (the queue closing underneath the worker, an execution
    /// panicking) are reported on `fatal_tx`.
    pub fn start(
        poller: TaskPoller,
        handlers: Arc<HandlerRegistry>,
        env: Environment,
        options: WorkerOptions,
        fatal_tx: mpsc::UnboundedSender<WorkerError>,
    ) -> Self {
        let id = WorkerId::new();
        let task_queue = poller.task_queue().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker_loop = WorkerLoop {
            id,
            poller,
            handlers,
            env,
            options,
            fatal_tx,
        };
        let task_handle = tokio::spawn(worker_loop.run(shutdown_rx));

        info!(worker_id = %id, task_queue = %task_queue, "Started worker");

        Self {
            id,
            task_queue,
            shutdown_tx,
            task_handle,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    /// Check if the poll loop is still running.
    pub fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    /// Stop polling and wait for the poll loop to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.task_handle.await {
            warn!(worker_id = %self.id, error = %e, "Worker loop ended abnormally");
        }

        info!(worker_id = %self.id, task_queue = %self.task_queue, "Stopped worker");
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("task_queue", &self.task_queue)
            .finish()
    }
}

// =============================================================================
// Poll Loop
// =============================================================================

struct WorkerLoop {
    id: WorkerId,
    poller: TaskPoller,
    handlers: Arc<HandlerRegistry>,
    env: Environment,
    options: WorkerOptions,
    fatal_tx: mpsc::UnboundedSender<WorkerError>,
}

impl WorkerLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let task_queue = self.poller.task_queue().to_string();
        let permits = Arc::new(Semaphore::new(self.options.max_concurrent_executions.max(1)));
        let mut executions = JoinSet::new();
        let mut started: u64 = 0;

        loop {
            // Only pull a task once there is capacity to run it.
            let permit = tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                Some(joined) = executions.join_next(), if !executions.is_empty() => {
                    if let Err(e) = joined {
                        self.report_join_error(&task_queue, e);
                    }
                }

                task = self.poller.next() => match task {
                    Some(task) => {
                        started += 1;
                        let handlers = Arc::clone(&self.handlers);
                        let env = self.env.clone();
                        let queue = task_queue.clone();
                        executions.spawn(async move {
                            let _permit = permit;
                            run_execution(task, handlers, env, queue).await;
                        });
                    }
                    None => {
                        error!(worker_id = %self.id, task_queue = %task_queue, "Task queue closed");
                        let _ = self.fatal_tx.send(WorkerError::QueueClosed {
                            task_queue: task_queue.clone(),
                        });
                        break;
                    }
                },
            }
        }

        // Reap what already finished so panics are not lost, then let the
        // rest run to completion on their own.
        while let Some(joined) = executions.try_join_next() {
            if let Err(e) = joined {
                self.report_join_error(&task_queue, e);
            }
        }
        executions.detach_all();

        debug!(worker_id = %self.id, task_queue = %task_queue, started, "Worker loop exited");
    }

    fn report_join_error(&self, task_queue: &str, err: JoinError) {
        if !err.is_panic() {
            return;
        }

        let message = panic_message(err.into_panic());
        error!(worker_id = %self.id, task_queue, panic = %message, "Execution panicked");
        let _ = self.fatal_tx.send(WorkerError::ExecutionPanicked {
            task_queue: task_queue.to_string(),
            message,
        });
    }
}

async fn run_execution(task: Task, handlers: Arc<HandlerRegistry>, env: Environment, task_queue: String) {
    let Task {
        execution_id,
        workflow_id,
        workflow,
        input,
        reply,
    } = task;

    debug!(
        execution_id = %execution_id,
        workflow_id = %workflow_id,
        workflow = %workflow,
        "Execution started"
    );

    let result = match handlers.get(&workflow) {
        Some(handler) => {
            let ctx = WorkflowContext::for_execution(
                env.clone(),
                workflow_id.clone(),
                execution_id,
                task_queue.clone(),
            );
            handler(ctx, input).await
        }
        None => Err(WorkflowError::UnknownWorkflow {
            name: workflow.clone(),
            task_queue: task_queue.clone(),
        }),
    };

    if let Err(e) = env.journal.clear(&workflow_id) {
        warn!(workflow_id = %workflow_id, error = %e, "Failed to clear journal");
    }

    match &result {
        Ok(_) => info!(
            execution_id = %execution_id,
            workflow = %workflow,
            task_queue = %task_queue,
            "Execution completed"
        ),
        Err(e) => warn!(
            execution_id = %execution_id,
            workflow = %workflow,
            task_queue = %task_queue,
            error = %e,
            "Execution failed"
        ),
    }

    let _ = reply.send(result);
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        workflow_fn, InvokeError, Invoker, MemoryJournal, OperationBackend, SignalRegistry,
        TaskQueues, TaskRequest, WorkerConnector,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct NoBackend;

    #[async_trait]
    impl OperationBackend for NoBackend {
        async fn invoke(&self, operation: &str, _input: Value) -> Result<Value, InvokeError> {
            Err(InvokeError::UnknownOperation(operation.to_string()))
        }
    }

    fn env() -> Environment {
        Environment {
            invoker: Arc::new(Invoker::new(Arc::new(NoBackend))),
            signals: SignalRegistry::new(),
            journal: Arc::new(MemoryJournal::new()),
            queues: TaskQueues::new(),
        }
    }

    async fn wait_signal(ctx: WorkflowContext, channel: String) -> Result<Value, WorkflowError> {
        ctx.receive(&channel).await
    }

    async fn explode(_ctx: WorkflowContext, _input: Value) -> Result<Value, WorkflowError> {
        panic!("boom");
    }

    fn handlers() -> Arc<HandlerRegistry> {
        Arc::new(
            HandlerRegistry::new()
                .with("wait-signal", workflow_fn(wait_signal))
                .with("explode", workflow_fn(explode)),
        )
    }

    #[tokio::test]
    async fn test_runs_submitted_execution() {
        let env = env();
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let poller = env.queues.connect("q").unwrap();
        let worker = Worker::start(poller, handlers(), env.clone(), WorkerOptions::default(), fatal_tx);

        env.signals.signal("go", json!("ok")).unwrap();
        let handle = env
            .queues
            .submit("q", TaskRequest::new("wait-signal", json!("go")))
            .await
            .unwrap();

        assert_eq!(handle.result().await.unwrap(), json!("ok"));
        assert!(worker.is_running());
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_workflow_fails_execution() {
        let env = env();
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let poller = env.queues.connect("q").unwrap();
        let worker = Worker::start(poller, handlers(), env.clone(), WorkerOptions::default(), fatal_tx);

        let handle = env
            .queues
            .submit("q", TaskRequest::new("deploy", json!(null)))
            .await
            .unwrap();

        assert!(matches!(
            handle.result().await,
            Err(WorkflowError::UnknownWorkflow { ref name, .. }) if name == "deploy"
        ));
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let env = env();
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let poller = env.queues.connect("q").unwrap();
        let worker = Worker::start(
            poller,
            handlers(),
            env.clone(),
            WorkerOptions::with_max_concurrent_executions(1),
            fatal_tx,
        );

        let first = env
            .queues
            .submit("q", TaskRequest::new("wait-signal", json!("a")))
            .await
            .unwrap();
        let second = env
            .queues
            .submit("q", TaskRequest::new("wait-signal", json!("b")))
            .await
            .unwrap();

        // The second execution cannot start while the first holds the permit.
        env.signals.signal("b", json!("b")).unwrap();
        let second = tokio::spawn(second.result());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        env.signals.signal("a", json!("a")).unwrap();
        assert_eq!(first.result().await.unwrap(), json!("a"));
        assert_eq!(second.await.unwrap().unwrap(), json!("b"));

        worker.stop().await;
    }

    #[tokio::test]
    async fn test_stop_detaches_in_flight_execution() {
        let env = env();
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let poller = env.queues.connect("q").unwrap();
        let worker = Worker::start(poller, handlers(), env.clone(), WorkerOptions::default(), fatal_tx);

        let handle = env
            .queues
            .submit("q", TaskRequest::new("wait-signal", json!("late")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        worker.stop().await;

        env.signals.signal("late", json!(1)).unwrap();
        assert_eq!(handle.result().await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_queue_close_is_fatal() {
        let env = env();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let poller = env.queues.connect("q").unwrap();
        let worker = Worker::start(poller, handlers(), env.clone(), WorkerOptions::default(), fatal_tx);

        env.queues.close("q");

        let err = fatal_rx.recv().await.unwrap();
        assert!(matches!(err, WorkerError::QueueClosed { ref task_queue } if task_queue == "q"));
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_panic_is_fatal() {
        let env = env();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let poller = env.queues.connect("q").unwrap();
        let worker = Worker::start(poller, handlers(), env.clone(), WorkerOptions::default(), fatal_tx);

        let handle = env
            .queues
            .submit("q", TaskRequest::new("explode", json!(null)))
            .await
            .unwrap();

        assert!(matches!(
            handle.result().await,
            Err(WorkflowError::ExecutionLost { .. })
        ));

        // The panic is reaped on the next loop turn.
        env.queues
            .submit("q", TaskRequest::new("wait-signal", json!("never")))
            .await
            .unwrap();

        let err = fatal_rx.recv().await.unwrap();
        assert!(matches!(
            err,
            WorkerError::ExecutionPanicked { ref message, .. } if message == "boom"
        ));
        worker.stop().await;
    }
}
