//! The `deploy` and `deploy-n` workflows.

use std::time::Duration;

use fleetd_events::NodeStatus;
use fleetd_id::SystemId;
use fleetd_workflow::{
    workflow_fn, CallOptions, ChildOptions, HandlerRegistry, RetryPolicy, WorkflowContext,
    WorkflowError,
};
use serde_json::Value;
use tracing::{error, info, warn};

use super::allocate::allocate_ips;
use super::boot::{deploy_ephemeral_os, deploy_installed_os, machine_channels};
use super::error::{DeployError, DeployFailure};
use super::types::{
    BootOrderInput, DeployInput, DeployNInput, DeployResult, DiskStatus, MachineInput,
    NodeStatusInput, PowerParams, ResolvedDeployParams, UserInfo, UserInfoInput,
};

pub const DEPLOY_WORKFLOW: &str = "deploy";
pub const DEPLOY_N_WORKFLOW: &str = "deploy-n";

/// Timeout of the precheck and parameter resolution calls.
pub const PRECHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts per machine in a bulk deployment.
pub const DEPLOY_CHILD_ATTEMPTS: u32 = 5;

/// Agent-level deployment behaviour.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Write `failed-deployment` when an attempt fails after its
    /// parameters were resolved.
    pub report_failure_status: bool,
}

/// Workflow id of the child deployment for `system_id`.
pub fn deploy_workflow_id(system_id: &SystemId) -> String {
    format!("{DEPLOY_WORKFLOW}:{system_id}")
}

/// Deploy one machine.
///
/// Whatever the outcome, the machine's event channels are released once
/// the attempt is over.
pub async fn deploy(
    ctx: &WorkflowContext,
    input: DeployInput,
    options: &DeployOptions,
) -> Result<DeployResult, DeployFailure> {
    let channels = machine_channels(&input.system_id);
    let outcome = attempt(ctx, input, options).await;
    ctx.release_signals(&channels);
    outcome
}

async fn attempt(
    ctx: &WorkflowContext,
    input: DeployInput,
    options: &DeployOptions,
) -> Result<DeployResult, DeployFailure> {
    let system_id = input.system_id.clone();
    let fail = |source: DeployError| {
        error!(
            system_id = %system_id,
            execution_id = %ctx.execution_id(),
            kind = source.kind(),
            error = %source,
            "Deployment failed"
        );
        DeployFailure {
            system_id: system_id.clone(),
            execution_id: ctx.execution_id(),
            source,
        }
    };

    let (power, params) = prepare(ctx, &input).await.map_err(fail)?;

    match drive(ctx, &input, &power, &params).await {
        Ok(()) => {
            info!(system_id = %system_id, "Machine deployed");
            Ok(DeployResult {
                system_id: system_id.clone(),
                status: NodeStatus::Deployed,
            })
        }
        Err(source) => {
            if options.report_failure_status {
                report_failure(ctx, &system_id).await;
            }
            Err(fail(source))
        }
    }
}

/// Precheck, disk validation and parameter resolution. Nothing here has
/// side effects on the machine itself.
async fn prepare(
    ctx: &WorkflowContext,
    input: &DeployInput,
) -> Result<(PowerParams, ResolvedDeployParams), DeployError> {
    let machine = MachineInput::new(&input.system_id);
    let user = UserInfoInput {
        user_id: input.requesting_user_id,
    };

    let (power, user): (PowerParams, UserInfo) = tokio::try_join!(
        ctx.execute(
            "get-power-params",
            &machine,
            CallOptions::with_timeout(PRECHECK_TIMEOUT)
        ),
        ctx.execute(
            "get-user-info",
            &user,
            CallOptions::with_timeout(PRECHECK_TIMEOUT)
        ),
    )?;

    if (input.install_kvm || input.register_vmhost) && !user.is_superuser {
        return Err(DeployError::InsufficientPermissions {
            reason: "you must be an administrator to deploy a machine as a managed VM host"
                .to_string(),
        });
    }

    if !input.ephemeral_deploy {
        let disk: DiskStatus = ctx
            .execute(
                "check-disk-status",
                &machine,
                CallOptions::with_timeout(PRECHECK_TIMEOUT),
            )
            .await?;
        if disk.diskless {
            return Err(DeployError::InvalidStorageConfig {
                reason: "cannot deploy to a disk in a diskless machine, deploy to memory must be used instead"
                    .to_string(),
            });
        }
    }

    let params: ResolvedDeployParams = ctx
        .execute(
            "set-deploy-params",
            input,
            CallOptions::with_timeout(PRECHECK_TIMEOUT),
        )
        .await?;

    if !params.status.is_deployable() {
        return Err(DeployError::InvalidNodeStatus {
            status: params.status,
        });
    }

    Ok((power, params))
}

/// Allocation, both boots and completion.
async fn drive(
    ctx: &WorkflowContext,
    input: &DeployInput,
    power: &PowerParams,
    params: &ResolvedDeployParams,
) -> Result<(), DeployError> {
    let system_id = &input.system_id;

    allocate_ips(ctx, system_id).await?;

    deploy_ephemeral_os(ctx, system_id, power, params).await?;

    if !input.ephemeral_deploy {
        let boot_order = BootOrderInput {
            system_id: system_id.clone(),
            netboot: false,
        };
        let _: Value = ctx
            .execute("set-boot-order", &boot_order, CallOptions::default())
            .await?;

        deploy_installed_os(ctx, system_id, power).await?;
    }

    let deployed = NodeStatusInput {
        system_id: system_id.clone(),
        status: NodeStatus::Deployed,
    };
    let _: Value = ctx
        .execute("update-node-status", &deployed, CallOptions::default())
        .await?;

    Ok(())
}

async fn report_failure(ctx: &WorkflowContext, system_id: &SystemId) {
    let failed = NodeStatusInput {
        system_id: system_id.clone(),
        status: NodeStatus::FailedDeployment,
    };
    let reported: Result<Value, WorkflowError> = ctx
        .execute("update-node-status", &failed, CallOptions::default())
        .await;

    if let Err(e) = reported {
        warn!(system_id = %system_id, error = %e, "Failed to report failed deployment");
    }
}

/// Deploy every machine in `input`, one at a time, each as a child
/// `deploy` on its own queue.
pub async fn deploy_n(ctx: &WorkflowContext, input: DeployNInput) -> Result<Vec<DeployResult>, WorkflowError> {
    let mut results = Vec::with_capacity(input.params.len());

    for param in &input.params {
        let options = ChildOptions::default()
            .workflow_id(deploy_workflow_id(&param.system_id))
            .retry(RetryPolicy {
                max_attempts: DEPLOY_CHILD_ATTEMPTS,
                ..RetryPolicy::default()
            });

        let result: DeployResult = ctx
            .execute_child(&param.queue, DEPLOY_WORKFLOW, param, options)
            .await?;
        results.push(result);
    }

    info!(deployed = results.len(), "Bulk deployment finished");
    Ok(results)
}

/// Handlers served on every deploy queue.
pub fn deploy_handlers(options: DeployOptions) -> HandlerRegistry {
    HandlerRegistry::new()
        .with(
            DEPLOY_WORKFLOW,
            workflow_fn(move |ctx: WorkflowContext, input: DeployInput| {
                let options = options.clone();
                async move { deploy(&ctx, input, &options).await.map_err(WorkflowError::from) }
            }),
        )
        .with(
            DEPLOY_N_WORKFLOW,
            workflow_fn(|ctx: WorkflowContext, input: DeployNInput| async move {
                deploy_n(&ctx, input).await
            }),
        )
}
