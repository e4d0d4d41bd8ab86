//! The context a running workflow operates through.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fleetd_id::ExecutionId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    CallOptions, Invoker, Journal, JournalEntry, RetryPolicy, SignalRegistry, TaskQueues,
    TaskRequest, WorkflowError,
};

/// Services shared by every execution on an agent.
#[derive(Clone)]
pub struct Environment {
    pub invoker: Arc<Invoker>,
    pub signals: SignalRegistry,
    pub journal: Arc<dyn Journal>,
    pub queues: TaskQueues,
}

/// Options for a child execution.
#[derive(Debug, Clone)]
pub struct ChildOptions {
    /// Workflow id of the child. Defaults to its execution id.
    pub workflow_id: Option<String>,

    /// Attempts for retryable child failures.
    pub retry: RetryPolicy,
}

impl Default for ChildOptions {
    fn default() -> Self {
        Self {
            workflow_id: None,
            retry: RetryPolicy::none(),
        }
    }
}

impl ChildOptions {
    pub fn workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Handle a workflow uses to perform journaled steps.
///
/// Each step takes its sequence number when the step future is created, not
/// when it is first polled, so branches joined with `try_join!` are numbered
/// in program order.
#[derive(Clone)]
pub struct WorkflowContext {
    env: Environment,
    workflow_id: String,
    execution_id: ExecutionId,
    task_queue: String,
    seq: Arc<AtomicU64>,
}

impl WorkflowContext {
    /// Create a context for a fresh execution.
    pub fn new(env: Environment, workflow_id: impl Into<String>, task_queue: impl Into<String>) -> Self {
        Self::for_execution(env, workflow_id.into(), ExecutionId::new(), task_queue.into())
    }

    pub(crate) fn for_execution(
        env: Environment,
        workflow_id: String,
        execution_id: ExecutionId,
        task_queue: String,
    ) -> Self {
        Self {
            env,
            workflow_id,
            execution_id,
            task_queue,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn replay(&self, seq: u64, step: &str) -> Result<Option<Value>, WorkflowError> {
        match self.env.journal.load(&self.workflow_id, seq)? {
            Some(entry) if entry.step == step => {
                debug!(workflow_id = %self.workflow_id, seq, step, "Replaying journaled step");
                Ok(Some(entry.payload))
            }
            Some(entry) => Err(WorkflowError::NonDeterministic {
                workflow_id: self.workflow_id.clone(),
                seq,
                expected: step.to_string(),
                recorded: entry.step,
            }),
            None => Ok(None),
        }
    }

    fn record(&self, seq: u64, step: &str, payload: &Value) -> Result<(), WorkflowError> {
        let entry = JournalEntry {
            seq,
            step: step.to_string(),
            payload: payload.clone(),
        };
        self.env.journal.record(&self.workflow_id, &entry)?;
        Ok(())
    }

    /// Call a remote operation.
    pub fn execute<'a, I, O>(
        &'a self,
        operation: &'a str,
        input: &I,
        options: CallOptions,
    ) -> impl Future<Output = Result<O, WorkflowError>> + Send + 'a
    where
        I: Serialize + ?Sized + 'a,
        O: DeserializeOwned + Send + 'a,
    {
        let seq = self.next_seq();
        let input = serde_json::to_value(input)
            .map_err(|e| WorkflowError::decode(format!("{operation} input"), e));

        async move {
            let input = input?;

            let output = match self.replay(seq, operation)? {
                Some(recorded) => recorded,
                None => {
                    let output = self.env.invoker.call(operation, input, &options).await?;
                    self.record(seq, operation, &output)?;
                    output
                }
            };

            serde_json::from_value(output)
                .map_err(|e| WorkflowError::decode(format!("{operation} output"), e))
        }
    }

    /// Wait for the next signal on `channel`.
    pub fn receive<'a, T>(
        &'a self,
        channel: &'a str,
    ) -> impl Future<Output = Result<T, WorkflowError>> + Send + 'a
    where
        T: DeserializeOwned + Send + 'a,
    {
        let seq = self.next_seq();

        async move {
            let step = format!("signal:{channel}");

            let payload = match self.replay(seq, &step)? {
                Some(recorded) => recorded,
                None => {
                    let payload = self.env.signals.receive(channel).await?;
                    self.record(seq, &step, &payload)?;
                    payload
                }
            };

            serde_json::from_value(payload)
                .map_err(|e| WorkflowError::decode(format!("signal on {channel}"), e))
        }
    }

    /// Drop whatever is buffered on `channels`, so that only signals
    /// arriving from now on are seen. Journaled: a replay does not discard
    /// again, since the signals buffered by then belong to later steps.
    pub fn discard_signals(&self, channels: &[String]) -> Result<u64, WorkflowError> {
        let seq = self.next_seq();
        if let Some(recorded) = self.replay(seq, "discard")? {
            return Ok(recorded.as_u64().unwrap_or_default());
        }

        let dropped: usize = channels
            .iter()
            .map(|channel| self.env.signals.discard(channel))
            .sum();
        let dropped = dropped as u64;
        if dropped > 0 {
            debug!(workflow_id = %self.workflow_id, dropped, "Discarded stale signals");
        }

        self.record(seq, "discard", &Value::from(dropped))?;
        Ok(dropped)
    }

    /// Forget `channels` and anything still buffered on them. Used once the
    /// workflow no longer waits on them; not journaled.
    pub fn release_signals(&self, channels: &[String]) {
        for channel in channels {
            self.env.signals.remove(channel);
        }
    }

    /// Run `workflow` on `task_queue` and wait for its result.
    pub fn execute_child<'a, I, O>(
        &'a self,
        task_queue: &'a str,
        workflow: &'a str,
        input: &I,
        options: ChildOptions,
    ) -> impl Future<Output = Result<O, WorkflowError>> + Send + 'a
    where
        I: Serialize + ?Sized + 'a,
        O: DeserializeOwned + Send + 'a,
    {
        let seq = self.next_seq();
        let input = serde_json::to_value(input)
            .map_err(|e| WorkflowError::decode(format!("{workflow} input"), e));

        async move {
            let input = input?;
            let step = format!("child:{workflow}");

            let output = match self.replay(seq, &step)? {
                Some(recorded) => recorded,
                None => {
                    let output = self.run_child(task_queue, workflow, input, &options).await?;
                    self.record(seq, &step, &output)?;
                    output
                }
            };

            serde_json::from_value(output)
                .map_err(|e| WorkflowError::decode(format!("{workflow} output"), e))
        }
    }

    async fn run_child(
        &self,
        task_queue: &str,
        workflow: &str,
        input: Value,
        options: &ChildOptions,
    ) -> Result<Value, WorkflowError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut request = TaskRequest::new(workflow, input.clone());
            request.workflow_id = options.workflow_id.clone();

            let result = match self.env.queues.submit(task_queue, request).await {
                Ok(handle) => handle.result().await,
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && options.retry.allows_retry(attempt) => {
                    let delay = options.retry.backoff.delay(attempt - 1);
                    warn!(
                        workflow_id = %self.workflow_id,
                        child = workflow,
                        task_queue,
                        attempt,
                        error = %e,
                        "Child execution failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("workflow_id", &self.workflow_id)
            .field("execution_id", &self.execution_id)
            .field("task_queue", &self.task_queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InvokeError, MemoryJournal, OperationBackend};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Echoes `{operation, input}` and counts calls.
    #[derive(Default)]
    struct Echo {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OperationBackend for Echo {
        async fn invoke(&self, operation: &str, input: Value) -> Result<Value, InvokeError> {
            self.calls.lock().unwrap().push(operation.to_string());
            Ok(json!({ "operation": operation, "input": input }))
        }
    }

    fn env(backend: Arc<Echo>, journal: Arc<MemoryJournal>) -> Environment {
        Environment {
            invoker: Arc::new(Invoker::new(backend).with_retry_policy(RetryPolicy::none())),
            signals: SignalRegistry::new(),
            journal,
            queues: TaskQueues::new(),
        }
    }

    #[tokio::test]
    async fn test_execute_records_and_replays() {
        let backend = Arc::new(Echo::default());
        let journal = Arc::new(MemoryJournal::new());

        let ctx = WorkflowContext::new(env(backend.clone(), journal.clone()), "wf-1", "q");
        let first: Value = ctx
            .execute("propose-ip", &json!({"system_id": "abc"}), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(first["operation"], "propose-ip");
        assert_eq!(journal.entries("wf-1").len(), 1);

        // Same workflow id, fresh context: the step is served from the journal.
        let replay = WorkflowContext::new(env(backend.clone(), journal.clone()), "wf-1", "q");
        let second: Value = replay
            .execute("propose-ip", &json!({"system_id": "abc"}), CallOptions::default())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_mismatch_is_non_deterministic() {
        let backend = Arc::new(Echo::default());
        let journal = Arc::new(MemoryJournal::new());

        let ctx = WorkflowContext::new(env(backend.clone(), journal.clone()), "wf-1", "q");
        let _: Value = ctx
            .execute("power-on", &json!({}), CallOptions::default())
            .await
            .unwrap();

        let replay = WorkflowContext::new(env(backend, journal), "wf-1", "q");
        let err = replay
            .execute::<_, Value>("power-cycle", &json!({}), CallOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::NonDeterministic { seq: 0, ref expected, ref recorded, .. }
                if expected == "power-cycle" && recorded == "power-on"
        ));
    }

    #[tokio::test]
    async fn test_sequence_numbers_follow_creation_order() {
        let backend = Arc::new(Echo::default());
        let journal = Arc::new(MemoryJournal::new());
        let ctx = WorkflowContext::new(env(backend, journal.clone()), "wf-1", "q");

        let a = ctx.execute::<_, Value>("get-power-params", &json!({}), CallOptions::default());
        let b = ctx.execute::<_, Value>("get-user-info", &json!({}), CallOptions::default());
        // Poll in reverse order; numbering must not change.
        let (rb, ra) = tokio::join!(b, a);
        rb.unwrap();
        ra.unwrap();

        let steps: Vec<_> = journal
            .entries("wf-1")
            .into_iter()
            .map(|e| (e.seq, e.step))
            .collect();
        assert_eq!(
            steps,
            vec![
                (0, "get-power-params".to_string()),
                (1, "get-user-info".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_receive_is_journaled() {
        let backend = Arc::new(Echo::default());
        let journal = Arc::new(MemoryJournal::new());
        let environment = env(backend, journal.clone());
        environment.signals.signal("leases:abc", json!({"n": 1})).unwrap();

        let ctx = WorkflowContext::new(environment.clone(), "wf-1", "q");
        let got: Value = ctx.receive("leases:abc").await.unwrap();
        assert_eq!(got, json!({"n": 1}));

        // Replay does not consume a second signal.
        let replay = WorkflowContext::new(environment, "wf-1", "q");
        let again: Value = replay.receive("leases:abc").await.unwrap();
        assert_eq!(again, got);
        assert_eq!(journal.entries("wf-1")[0].step, "signal:leases:abc");
    }

    #[tokio::test]
    async fn test_discard_is_journaled() {
        let backend = Arc::new(Echo::default());
        let journal = Arc::new(MemoryJournal::new());
        let environment = env(backend, journal.clone());
        let channels = vec!["leases:abc".to_string(), "boot-assets:abc".to_string()];
        environment.signals.signal("leases:abc", json!("stale")).unwrap();

        let ctx = WorkflowContext::new(environment.clone(), "wf-1", "q");
        assert_eq!(ctx.discard_signals(&channels).unwrap(), 1);

        environment.signals.signal("leases:abc", json!("fresh")).unwrap();
        let got: Value = ctx.receive("leases:abc").await.unwrap();
        assert_eq!(got, json!("fresh"));

        // Replay neither discards nor consumes what arrived since.
        environment.signals.signal("leases:abc", json!("next")).unwrap();
        let replay = WorkflowContext::new(environment.clone(), "wf-1", "q");
        assert_eq!(replay.discard_signals(&channels).unwrap(), 1);
        let again: Value = replay.receive("leases:abc").await.unwrap();
        assert_eq!(again, json!("fresh"));
        assert_eq!(environment.signals.discard("leases:abc"), 1);

        let steps: Vec<_> = journal.entries("wf-1").into_iter().map(|e| e.step).collect();
        assert_eq!(steps, vec!["discard", "signal:leases:abc"]);
    }

    #[tokio::test]
    async fn test_release_removes_channels() {
        let backend = Arc::new(Echo::default());
        let environment = env(backend, Arc::new(MemoryJournal::new()));
        environment.signals.signal("leases:abc", json!(1)).unwrap();

        let ctx = WorkflowContext::new(environment.clone(), "wf-1", "q");
        ctx.release_signals(&["leases:abc".to_string()]);

        assert!(environment.signals.is_empty());
    }

    #[tokio::test]
    async fn test_decode_failure_reports_operation() {
        let backend = Arc::new(Echo::default());
        let ctx = WorkflowContext::new(env(backend, Arc::new(MemoryJournal::new())), "wf", "q");

        let err = ctx
            .execute::<_, u64>("check-disk-status", &json!({}), CallOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::Decode { ref context, .. } if context == "check-disk-status output"
        ));
    }
}
