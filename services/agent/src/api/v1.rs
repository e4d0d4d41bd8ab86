//! API v1 routes.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use fleetd_events::SignalEnvelope;
use fleetd_workflow::{TaskRequest, WorkflowError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::error::ApiError;
use super::AppState;
use crate::configurator::{ConfigureInput, CONFIGURE_WORKFLOW};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/signals/{channel}", post(deliver_signal))
        .route("/queues/{queue}/executions", post(submit_execution))
        .route("/configure", post(configure))
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

// =============================================================================
// Signals
// =============================================================================

#[derive(Debug, Serialize)]
pub struct SignalAccepted {
    pub channel: String,
    pub received_at: String,
}

/// Deliver an external event to whichever execution waits on `channel`.
async fn deliver_signal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    let request_id = request_id(&headers);

    let envelope = SignalEnvelope::validate(&channel, payload).map_err(|e| {
        warn!(channel = %channel, error = %e, "Rejected signal");
        ApiError::from(e).with_request_id(request_id.clone())
    })?;

    state
        .env()
        .signals
        .signal(&envelope.channel, envelope.payload)
        .map_err(|e| match e {
            WorkflowError::SignalClosed { .. } => {
                ApiError::conflict("channel_closed", e.to_string()).with_request_id(request_id.clone())
            }
            other => ApiError::from(other).with_request_id(request_id.clone()),
        })?;

    debug!(channel = %envelope.channel, "Signal delivered");

    let body = SignalAccepted {
        channel: envelope.channel,
        received_at: envelope.received_at.to_rfc3339(),
    };
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

// =============================================================================
// Executions
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitExecutionRequest {
    pub workflow: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub workflow_id: Option<String>,
    /// Wait for the execution to finish and return its result.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize)]
pub struct ExecutionResponse {
    pub execution_id: String,
    pub workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

async fn submit_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(queue): Path<String>,
    Json(req): Json<SubmitExecutionRequest>,
) -> Result<Response, ApiError> {
    let request_id = request_id(&headers);

    let mut request = TaskRequest::new(req.workflow.clone(), req.input);
    if let Some(workflow_id) = req.workflow_id {
        request = request.with_workflow_id(workflow_id);
    }

    let handle = state
        .env()
        .queues
        .submit(&queue, request)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;

    let execution_id = handle.execution_id().to_string();
    let workflow_id = handle.workflow_id().to_string();
    info!(
        task_queue = %queue,
        workflow = %req.workflow,
        execution_id = %execution_id,
        wait = req.wait,
        "Execution submitted"
    );

    if !req.wait {
        let body = ExecutionResponse {
            execution_id,
            workflow_id,
            result: None,
        };
        return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
    }

    let result = handle
        .result()
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id))?;

    let body = ExecutionResponse {
        execution_id,
        workflow_id,
        result: Some(result),
    };
    Ok((StatusCode::OK, Json(body)).into_response())
}

// =============================================================================
// Configuration
// =============================================================================

/// Run `configure-agent` on the main queue and wait for it.
async fn configure(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<ConfigureInput>>,
) -> Result<Response, ApiError> {
    let request_id = request_id(&headers);
    let input = body.map(|Json(input)| input).unwrap_or_default();

    let payload = serde_json::to_value(&input)
        .map_err(|e| ApiError::internal("serialization_error", e.to_string()))?;

    let handle = state
        .env()
        .queues
        .submit(
            state.pool().main_task_queue(),
            TaskRequest::new(CONFIGURE_WORKFLOW, payload),
        )
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;

    let result = handle
        .result()
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id))?;

    Ok((StatusCode::OK, Json(result)).into_response())
}
