//! Agent assembly: environment, worker pool, configurator and router.

use std::sync::Arc;

use axum::Router;
use fleetd_workflow::{
    Environment, Invoker, Journal, OperationBackend, SignalRegistry, TaskQueues, TaskRequest,
    WorkerError, WorkerOptions, WorkerPool, WorkflowError,
};
use tracing::info;

use crate::api::{create_router, AppState};
use crate::config::Config;
use crate::configurator::{CapacityConfigurator, ConfigureInput, ConfigureResult, CONFIGURE_WORKFLOW};
use crate::deploy::{deploy_handlers, DeployOptions};

/// Operation that goes to the address scanner when one is configured.
pub const SCANNER_OPERATION: &str = "check-ip";

/// Build the execution environment of an agent.
///
/// Every operation goes to `backend`, except `check-ip` when a `scanner`
/// is given.
pub fn build_environment(
    config: &Config,
    backend: Arc<dyn OperationBackend>,
    scanner: Option<Arc<dyn OperationBackend>>,
    journal: Arc<dyn Journal>,
) -> Environment {
    let mut invoker = Invoker::new(backend).with_timeout(config.operation_timeout);
    if let Some(scanner) = scanner {
        invoker = invoker.with_route(SCANNER_OPERATION, scanner);
    }

    Environment {
        invoker: Arc::new(invoker),
        signals: SignalRegistry::new(),
        journal,
        queues: TaskQueues::new(),
    }
}

/// A running deployment agent.
pub struct Agent {
    pool: Arc<WorkerPool>,
    configurator: Arc<CapacityConfigurator>,
}

impl Agent {
    /// Assemble an agent. Workers connect to the environment's task queues.
    pub fn new(config: &Config, env: Environment) -> Self {
        let connector = Arc::new(env.queues.clone());
        let pool = Arc::new(
            WorkerPool::new(config.system_id.clone(), env, connector)
                .with_main_queue_suffix(&config.main_queue_suffix),
        );

        let deploy = deploy_handlers(DeployOptions {
            report_failure_status: config.report_failure_status,
        });
        let configurator = CapacityConfigurator::new(
            &pool,
            deploy,
            WorkerOptions::with_max_concurrent_executions(config.max_concurrent_deploys),
        );

        Self { pool, configurator }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn env(&self) -> &Environment {
        self.pool.environment()
    }

    /// Start the main worker.
    pub async fn start(&self) -> Result<(), WorkerError> {
        self.pool.start(self.configurator.handlers()).await
    }

    /// Run `configure-agent` on the main queue and wait for it.
    pub async fn configure(&self, enabled: bool) -> Result<ConfigureResult, WorkflowError> {
        let input = serde_json::to_value(ConfigureInput { enabled }).map_err(|e| WorkflowError::Decode {
            context: "configure-agent input".to_string(),
            message: e.to_string(),
        })?;

        let handle = self
            .env()
            .queues
            .submit(
                self.pool.main_task_queue(),
                TaskRequest::new(CONFIGURE_WORKFLOW, input),
            )
            .await?;
        info!(execution_id = %handle.execution_id(), enabled, "Configuring agent");

        let output = handle.result().await?;
        serde_json::from_value(output).map_err(|e| WorkflowError::Decode {
            context: "configure-agent output".to_string(),
            message: e.to_string(),
        })
    }

    /// HTTP control surface of this agent.
    pub fn router(&self) -> Router {
        create_router(AppState::new(Arc::clone(&self.pool)))
    }

    /// Wait for the first fatal worker error.
    pub async fn error(&self) -> Option<WorkerError> {
        self.pool.error().await
    }

    /// Stop every worker. In-flight executions are detached.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
