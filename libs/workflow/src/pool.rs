//! Worker pool: one main worker plus named groups of auxiliary workers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use fleetd_id::{SystemId, WorkerId};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::task_queue::validate_task_queue;
use crate::{Environment, HandlerRegistry, Worker, WorkerConnector, WorkerError, WorkerOptions};

/// Default suffix of the main task queue.
pub const DEFAULT_MAIN_QUEUE_SUFFIX: &str = "main";

/// Concurrency limit of the main worker.
pub const MAIN_WORKER_CONCURRENCY: usize = 2;

/// Name of an agent's main task queue: `{system_id}@{suffix}`.
pub fn main_task_queue(system_id: &SystemId, suffix: &str) -> String {
    format!("{system_id}@{suffix}")
}

/// Snapshot of pool membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub main_running: bool,
    pub groups: BTreeMap<String, usize>,
}

/// Owns every worker of an agent.
///
/// Group membership sits behind one async lock. Adding and removing are
/// separate operations; a caller rebuilding a group removes it first.
pub struct WorkerPool {
    system_id: SystemId,
    main_queue: String,
    connector: Arc<dyn WorkerConnector>,
    env: Environment,
    main: Mutex<Option<Worker>>,
    groups: Mutex<HashMap<String, Vec<Worker>>>,
    fatal_tx: mpsc::UnboundedSender<WorkerError>,
    fatal_rx: Mutex<mpsc::UnboundedReceiver<WorkerError>>,
}

impl WorkerPool {
    /// Create a pool. Workers connect through `connector`.
    pub fn new(system_id: SystemId, env: Environment, connector: Arc<dyn WorkerConnector>) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let main_queue = main_task_queue(&system_id, DEFAULT_MAIN_QUEUE_SUFFIX);

        Self {
            system_id,
            main_queue,
            connector,
            env,
            main: Mutex::new(None),
            groups: Mutex::new(HashMap::new()),
            fatal_tx,
            fatal_rx: Mutex::new(fatal_rx),
        }
    }

    /// Use `{system_id}@{suffix}` as the main task queue.
    pub fn with_main_queue_suffix(mut self, suffix: &str) -> Self {
        self.main_queue = main_task_queue(&self.system_id, suffix);
        self
    }

    pub fn system_id(&self) -> &SystemId {
        &self.system_id
    }

    pub fn main_task_queue(&self) -> &str {
        &self.main_queue
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Start the main worker with `handlers`.
    pub async fn start(&self, handlers: HandlerRegistry) -> Result<(), WorkerError> {
        let mut main = self.main.lock().await;
        if main.is_some() {
            return Err(WorkerError::AlreadyStarted);
        }

        let poller = self.connector.connect(&self.main_queue)?;
        *main = Some(Worker::start(
            poller,
            Arc::new(handlers),
            self.env.clone(),
            WorkerOptions::with_max_concurrent_executions(MAIN_WORKER_CONCURRENCY),
            self.fatal_tx.clone(),
        ));

        info!(
            system_id = %self.system_id,
            task_queue = %self.main_queue,
            "Worker pool started"
        );
        Ok(())
    }

    /// Start a worker on `task_queue` and add it to `group`.
    ///
    /// Nothing is added if the worker cannot be connected.
    pub async fn add_worker(
        &self,
        group: &str,
        task_queue: &str,
        handlers: Arc<HandlerRegistry>,
        options: WorkerOptions,
    ) -> Result<WorkerId, WorkerError> {
        validate_task_queue(task_queue)?;

        let mut groups = self.groups.lock().await;
        let poller = self.connector.connect(task_queue)?;
        let worker = Worker::start(poller, handlers, self.env.clone(), options, self.fatal_tx.clone());
        let id = worker.id();

        groups.entry(group.to_string()).or_default().push(worker);

        info!(group, task_queue, worker_id = %id, "Added worker to group");
        Ok(id)
    }

    /// Stop every member of `group` and forget the group.
    ///
    /// Returns the number of workers stopped; removing an unknown group is
    /// a no-op.
    pub async fn remove_workers(&self, group: &str) -> usize {
        let mut groups = self.groups.lock().await;
        let Some(workers) = groups.remove(group) else {
            return 0;
        };

        let count = workers.len();
        for worker in workers {
            worker.stop().await;
        }

        info!(group, count, "Removed worker group");
        count
    }

    /// Wait for the first fatal worker error.
    pub async fn error(&self) -> Option<WorkerError> {
        self.fatal_rx.lock().await.recv().await
    }

    /// Task queues served by `group`, in insertion order.
    pub async fn group_task_queues(&self, group: &str) -> Vec<String> {
        self.groups
            .lock()
            .await
            .get(group)
            .map(|workers| workers.iter().map(|w| w.task_queue().to_string()).collect())
            .unwrap_or_default()
    }

    pub async fn group_size(&self, group: &str) -> usize {
        self.groups.lock().await.get(group).map_or(0, Vec::len)
    }

    pub async fn stats(&self) -> PoolStats {
        let main_running = self
            .main
            .lock()
            .await
            .as_ref()
            .is_some_and(Worker::is_running);

        let groups = self
            .groups
            .lock()
            .await
            .iter()
            .map(|(name, workers)| (name.clone(), workers.len()))
            .collect();

        PoolStats {
            main_running,
            groups,
        }
    }

    /// Stop every group and the main worker.
    pub async fn shutdown(&self) {
        let groups: Vec<_> = self.groups.lock().await.drain().collect();
        for (group, workers) in groups {
            for worker in workers {
                worker.stop().await;
            }
            info!(group, "Stopped worker group");
        }

        if let Some(main) = self.main.lock().await.take() {
            main.stop().await;
        }

        info!(system_id = %self.system_id, "Worker pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        workflow_fn, InvokeError, Invoker, MemoryJournal, OperationBackend, SignalRegistry,
        TaskPoller, TaskQueues, TaskRequest, WorkflowContext, WorkflowError,
    };
    use async_trait::async_trait;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    struct NoBackend;

    #[async_trait]
    impl OperationBackend for NoBackend {
        async fn invoke(&self, operation: &str, _input: Value) -> Result<Value, InvokeError> {
            Err(InvokeError::UnknownOperation(operation.to_string()))
        }
    }

    /// Refuses to connect to one queue.
    struct RefuseQueue {
        inner: TaskQueues,
        refused: String,
    }

    impl WorkerConnector for RefuseQueue {
        fn connect(&self, task_queue: &str) -> Result<TaskPoller, WorkerError> {
            if task_queue == self.refused {
                return Err(WorkerError::Connect {
                    task_queue: task_queue.to_string(),
                    message: "refused".to_string(),
                });
            }
            self.inner.connect(task_queue)
        }
    }

    fn system_id() -> SystemId {
        SystemId::parse("agent1").unwrap()
    }

    fn pool() -> WorkerPool {
        let queues = TaskQueues::new();
        let env = Environment {
            invoker: Arc::new(Invoker::new(Arc::new(NoBackend))),
            signals: SignalRegistry::new(),
            journal: Arc::new(MemoryJournal::new()),
            queues: queues.clone(),
        };
        WorkerPool::new(system_id(), env, Arc::new(queues))
    }

    async fn echo(_ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
        Ok(input)
    }

    fn handlers() -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry::new().with("echo", workflow_fn(echo)))
    }

    #[test]
    fn test_main_task_queue_name() {
        assert_eq!(main_task_queue(&system_id(), "main"), "agent1@main");
        assert_eq!(
            main_task_queue(&system_id(), "agent:main"),
            "agent1@agent:main"
        );
    }

    #[tokio::test]
    async fn test_main_queue_suffix() {
        let pool = pool().with_main_queue_suffix("agent:main");
        assert_eq!(pool.main_task_queue(), "agent1@agent:main");
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let pool = pool();
        pool.start(HandlerRegistry::new()).await.unwrap();
        assert!(matches!(
            pool.start(HandlerRegistry::new()).await,
            Err(WorkerError::AlreadyStarted)
        ));
        assert!(pool.stats().await.main_running);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_main_worker_runs_executions() {
        let pool = pool();
        pool.start(HandlerRegistry::new().with("echo", workflow_fn(echo)))
            .await
            .unwrap();

        let handle = pool
            .environment()
            .queues
            .submit("agent1@main", TaskRequest::new("echo", json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(handle.result().await.unwrap(), json!({"x": 1}));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_and_remove_group() {
        let pool = pool();

        pool.add_worker("deploy-service", "agent:deploy@vlan-10", handlers(), WorkerOptions::default())
            .await
            .unwrap();
        pool.add_worker("deploy-service", "agent:deploy@vlan-20", handlers(), WorkerOptions::default())
            .await
            .unwrap();

        assert_eq!(
            pool.group_task_queues("deploy-service").await,
            vec!["agent:deploy@vlan-10", "agent:deploy@vlan-20"]
        );

        let handle = pool
            .environment()
            .queues
            .submit("agent:deploy@vlan-20", TaskRequest::new("echo", json!(7)))
            .await
            .unwrap();
        assert_eq!(handle.result().await.unwrap(), json!(7));

        assert_eq!(pool.remove_workers("deploy-service").await, 2);
        assert_eq!(pool.group_size("deploy-service").await, 0);
        assert!(pool.stats().await.groups.is_empty());
    }

    #[tokio::test]
    async fn test_remove_twice_is_noop() {
        let pool = pool();
        pool.add_worker("g", "q1", handlers(), WorkerOptions::default())
            .await
            .unwrap();

        assert_eq!(pool.remove_workers("g").await, 1);
        assert_eq!(pool.remove_workers("g").await, 0);
        assert_eq!(pool.remove_workers("never-existed").await, 0);
    }

    #[tokio::test]
    async fn test_failed_add_adds_nothing() {
        let queues = TaskQueues::new();
        let env = Environment {
            invoker: Arc::new(Invoker::new(Arc::new(NoBackend))),
            signals: SignalRegistry::new(),
            journal: Arc::new(MemoryJournal::new()),
            queues: queues.clone(),
        };
        let connector = RefuseQueue {
            inner: queues,
            refused: "bad".to_string(),
        };
        let pool = WorkerPool::new(system_id(), env, Arc::new(connector));

        pool.add_worker("g", "good", handlers(), WorkerOptions::default())
            .await
            .unwrap();
        let err = pool
            .add_worker("g", "bad", handlers(), WorkerOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::Connect { .. }));
        assert_eq!(pool.group_task_queues("g").await, vec!["good"]);

        assert!(pool
            .add_worker("g", "bad queue", handlers(), WorkerOptions::default())
            .await
            .is_err());
        assert_eq!(pool.group_size("g").await, 1);
    }

    #[tokio::test]
    async fn test_fatal_error_surfaces() {
        let pool = pool();
        pool.add_worker("g", "doomed", handlers(), WorkerOptions::default())
            .await
            .unwrap();

        pool.environment().queues.close("doomed");

        let err = pool.error().await.unwrap();
        assert!(matches!(err, WorkerError::QueueClosed { ref task_queue } if task_queue == "doomed"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_remove_then_n_adds_gives_n_workers(before in 0usize..5, n in 0usize..8) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let pool = pool();
                for i in 0..before {
                    pool.add_worker("g", &format!("old-{i}"), handlers(), WorkerOptions::default())
                        .await
                        .unwrap();
                }

                pool.remove_workers("g").await;
                for i in 0..n {
                    pool.add_worker("g", &format!("new-{i}"), handlers(), WorkerOptions::default())
                        .await
                        .unwrap();
                }

                assert_eq!(pool.group_size("g").await, n);
                pool.shutdown().await;
            });
        }
    }
}
