//! Controller API client.
//!
//! Every remote operation is a `POST` to
//! `{controller_url}/v1/agents/{system_id}/operations/{operation}` with the
//! operation input as the JSON body. Errors come back as problem documents
//! whose `code` identifies the failure class.

use std::time::Duration;

use async_trait::async_trait;
use fleetd_id::SystemId;
use fleetd_workflow::{InvokeError, OperationBackend};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

/// Problem document returned by the controller on failure.
#[derive(Debug, Default, Deserialize)]
struct RemoteProblem {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

/// Controller API client.
pub struct ControllerClient {
    client: reqwest::Client,
    base_url: String,
    system_id: SystemId,
}

impl ControllerClient {
    /// Create a new controller client.
    pub fn new(base_url: &str, system_id: SystemId) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            system_id,
        })
    }

    fn operation_url(&self, operation: &str) -> String {
        format!(
            "{}/v1/agents/{}/operations/{}",
            self.base_url, self.system_id, operation
        )
    }
}

#[async_trait]
impl OperationBackend for ControllerClient {
    async fn invoke(&self, operation: &str, input: Value) -> Result<Value, InvokeError> {
        let url = self.operation_url(operation);
        debug!(url = %url, operation, "Calling controller");

        let response = self
            .client
            .post(&url)
            .json(&input)
            .send()
            .await
            .map_err(|e| InvokeError::Transport {
                operation: operation.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| InvokeError::Transport {
            operation: operation.to_string(),
            message: e.to_string(),
        })?;

        if !status.is_success() {
            let problem: RemoteProblem = serde_json::from_slice(&body).unwrap_or_default();
            let message = problem
                .detail
                .or(problem.title)
                .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());

            error!(operation, status = %status, message = %message, "Controller rejected operation");
            return Err(InvokeError::Remote {
                operation: operation.to_string(),
                status: status.as_u16(),
                code: problem.code.unwrap_or_else(|| "unknown".to_string()),
                message,
            });
        }

        if body.is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_slice(&body).map_err(|e| InvokeError::Decode {
            operation: operation.to_string(),
            message: e.to_string(),
        })
    }
}
