//! Capacity configurator.
//!
//! Runs as the `configure-agent` workflow on the main worker and rebuilds
//! the deploy worker groups from the controller's segment list.

use std::sync::{Arc, Weak};

use fleetd_id::{SegmentId, SystemId};
use fleetd_workflow::{
    workflow_fn, CallOptions, HandlerRegistry, WorkerOptions, WorkerPool, WorkflowContext,
    WorkflowError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::deploy::{MachineInput, SegmentList};

pub const CONFIGURE_WORKFLOW: &str = "configure-agent";

/// Group of per-segment deploy workers.
pub const DEPLOY_SERVICE_GROUP: &str = "deploy-service";

/// Group holding the agent's own deploy worker.
pub const DEPLOY_FALLBACK_GROUP: &str = "deploy-fallback";

/// Deploy queue of a network segment.
pub fn deploy_task_queue(segment: SegmentId) -> String {
    format!("agent:deploy@vlan-{segment}")
}

/// Deploy queue addressed to one agent directly.
pub fn fallback_task_queue(system_id: &SystemId) -> String {
    format!("{system_id}@agent:deploy")
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureInput {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl Default for ConfigureInput {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Deploy queues served after a successful reconfiguration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureResult {
    pub task_queues: Vec<String>,
}

pub struct CapacityConfigurator {
    pool: Weak<WorkerPool>,
    deploy_handlers: Arc<HandlerRegistry>,
    options: WorkerOptions,
    /// Held for a whole reconfiguration. The main worker runs more than one
    /// execution at a time, and interleaved runs would leave the union of
    /// their segment sets.
    reconfiguring: Mutex<()>,
}

impl CapacityConfigurator {
    pub fn new(pool: &Arc<WorkerPool>, deploy_handlers: HandlerRegistry, options: WorkerOptions) -> Arc<Self> {
        Arc::new(Self {
            pool: Arc::downgrade(pool),
            deploy_handlers: Arc::new(deploy_handlers),
            options,
            reconfiguring: Mutex::new(()),
        })
    }

    /// Handlers of the main worker.
    pub fn handlers(self: &Arc<Self>) -> HandlerRegistry {
        let configurator = Arc::clone(self);
        HandlerRegistry::new().with(
            CONFIGURE_WORKFLOW,
            workflow_fn(move |ctx: WorkflowContext, input: ConfigureInput| {
                let configurator = Arc::clone(&configurator);
                async move { configurator.configure(&ctx, input).await }
            }),
        )
    }

    /// Tear down the deploy groups and, if enabled, rebuild them.
    ///
    /// Runs one at a time; a second request waits and then replaces what
    /// the first built. On failure both groups are left empty.
    pub async fn configure(
        &self,
        ctx: &WorkflowContext,
        input: ConfigureInput,
    ) -> Result<ConfigureResult, WorkflowError> {
        let pool = self.pool.upgrade().ok_or_else(|| {
            WorkflowError::application("agent_shutting_down", "worker pool is gone")
        })?;
        let _reconfiguring = self.reconfiguring.lock().await;

        let removed = pool.remove_workers(DEPLOY_SERVICE_GROUP).await
            + pool.remove_workers(DEPLOY_FALLBACK_GROUP).await;
        info!(removed, enabled = input.enabled, "Reconfiguring deploy workers");

        if !input.enabled {
            return Ok(ConfigureResult::default());
        }

        match self.build(ctx, &pool).await {
            Ok(result) => {
                info!(task_queues = ?result.task_queues, "Deploy workers configured");
                Ok(result)
            }
            Err(e) => {
                error!(error = %e, "Reconfiguration failed, deploy workers stopped");
                pool.remove_workers(DEPLOY_SERVICE_GROUP).await;
                pool.remove_workers(DEPLOY_FALLBACK_GROUP).await;
                Err(e)
            }
        }
    }

    async fn build(&self, ctx: &WorkflowContext, pool: &WorkerPool) -> Result<ConfigureResult, WorkflowError> {
        let list: SegmentList = ctx
            .execute(
                "get-segment-list",
                &MachineInput::new(pool.system_id()),
                CallOptions::default(),
            )
            .await?;

        let mut task_queues = Vec::with_capacity(list.segments.len() + 1);

        for segment in list.segments {
            let queue = deploy_task_queue(segment);
            pool.add_worker(
                DEPLOY_SERVICE_GROUP,
                &queue,
                Arc::clone(&self.deploy_handlers),
                self.options.clone(),
            )
            .await?;
            task_queues.push(queue);
        }

        let fallback = fallback_task_queue(pool.system_id());
        pool.add_worker(
            DEPLOY_FALLBACK_GROUP,
            &fallback,
            Arc::clone(&self.deploy_handlers),
            self.options.clone(),
        )
        .await?;
        task_queues.push(fallback);

        Ok(ConfigureResult { task_queues })
    }
}
