//! Deployment failures.

use fleetd_events::NodeStatus;
use fleetd_id::{ExecutionId, SystemId};
use fleetd_workflow::WorkflowError;
use thiserror::Error;

/// Application error kinds surfaced to callers.
pub mod kind {
    pub const INVALID_NODE_STATUS: &str = "invalid_node_status";
    pub const IP_ALLOCATION_CONFLICT: &str = "ip_allocation_conflict";
    pub const INSUFFICIENT_PERMISSIONS: &str = "insufficient_permissions";
    pub const INVALID_STORAGE_CONFIG: &str = "invalid_storage_config";
    pub const DEPLOYMENT_FAILED: &str = "deployment_failed";
}

/// Why a deployment attempt stopped.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("the node is in the incorrect status for this operation: {status}")]
    InvalidNodeStatus { status: NodeStatus },

    #[error("one or more IPs proposed for allocation were already allocated: {message}")]
    IpAllocationConflict { message: String },

    #[error("requesting user does not have permissions for this operation, {reason}")]
    InsufficientPermissions { reason: String },

    #[error("the storage configuration is invalid with the given params, {reason}")]
    InvalidStorageConfig { reason: String },

    /// A remote operation, signal or child execution failed.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

impl DeployError {
    /// Application error kind of this failure.
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::InvalidNodeStatus { .. } => kind::INVALID_NODE_STATUS,
            DeployError::IpAllocationConflict { .. } => kind::IP_ALLOCATION_CONFLICT,
            DeployError::InsufficientPermissions { .. } => kind::INSUFFICIENT_PERMISSIONS,
            DeployError::InvalidStorageConfig { .. } => kind::INVALID_STORAGE_CONFIG,
            DeployError::Workflow(_) => kind::DEPLOYMENT_FAILED,
        }
    }

    /// Precondition and conflict failures are final for the attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeployError::Workflow(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// A failed deployment, tagged with the machine and execution.
#[derive(Debug, Error)]
#[error("failed deployment for {system_id} ({execution_id}): {source}")]
pub struct DeployFailure {
    pub system_id: SystemId,
    pub execution_id: ExecutionId,
    pub source: DeployError,
}

impl From<DeployFailure> for WorkflowError {
    fn from(failure: DeployFailure) -> Self {
        WorkflowError::Application {
            kind: failure.source.kind().to_string(),
            non_retryable: !failure.source.is_retryable(),
            message: failure.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_workflow::InvokeError;

    fn failure(source: DeployError) -> DeployFailure {
        DeployFailure {
            system_id: SystemId::parse("m1").unwrap(),
            execution_id: ExecutionId::new(),
            source,
        }
    }

    #[test]
    fn test_failure_message_names_machine_and_execution() {
        let f = failure(DeployError::InvalidStorageConfig {
            reason: "diskless".to_string(),
        });
        let msg = f.to_string();

        assert!(msg.starts_with("failed deployment for m1 (exec_"), "{msg}");
        assert!(msg.ends_with("the storage configuration is invalid with the given params, diskless"));
    }

    #[test]
    fn test_domain_failures_are_non_retryable_application_errors() {
        let err: WorkflowError = failure(DeployError::InvalidNodeStatus {
            status: NodeStatus::Deployed,
        })
        .into();

        assert_eq!(err.kind(), Some(kind::INVALID_NODE_STATUS));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transport_failures_stay_retryable() {
        let err: WorkflowError = failure(DeployError::Workflow(
            InvokeError::Transport {
                operation: "propose-ip".to_string(),
                message: "connection reset".to_string(),
            }
            .into(),
        ))
        .into();

        assert_eq!(err.kind(), Some(kind::DEPLOYMENT_FAILED));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("propose-ip transport error"));
    }
}
