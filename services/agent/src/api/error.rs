//! Problem documents returned by the control surface.

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use fleetd_events::EventError;
use fleetd_workflow::{InvokeError, WorkerError, WorkflowError};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://fleetd.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_GATEWAY, code, message)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message).retryable(true)
    }

    pub fn gateway_timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::GATEWAY_TIMEOUT, code, message).retryable(true)
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.problem.retryable = retryable;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        let request_id = request_id.into();
        self.problem.request_id = request_id.clone();
        if self.problem.instance.is_none() {
            self.problem.instance = Some(request_id);
        }
        self
    }
}

impl From<EventError> for ApiError {
    fn from(e: EventError) -> Self {
        let code = match &e {
            EventError::UnknownKind(_) => "unknown_signal_kind",
            EventError::InvalidChannel { .. } => "invalid_channel",
            EventError::InvalidPayload { .. } => "invalid_payload",
            EventError::MachineMismatch { .. } => "machine_mismatch",
            EventError::Serialization(_) => "invalid_payload",
        };
        ApiError::bad_request(code, e.to_string())
    }
}

impl From<WorkerError> for ApiError {
    fn from(e: WorkerError) -> Self {
        match &e {
            WorkerError::InvalidTaskQueue { .. } => ApiError::bad_request("invalid_task_queue", e.to_string()),
            WorkerError::QueueClosed { .. } => ApiError::service_unavailable("queue_closed", e.to_string()),
            _ => ApiError::internal("worker_error", e.to_string()),
        }
    }
}

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        let retryable = e.is_retryable();
        match e {
            WorkflowError::Application { ref kind, .. } => {
                ApiError::conflict(kind.clone(), e.to_string()).retryable(retryable)
            }
            WorkflowError::Invoke(InvokeError::Timeout { .. }) => {
                ApiError::gateway_timeout("operation_timeout", e.to_string())
            }
            WorkflowError::Invoke(ref invoke) => {
                let code = invoke.code().unwrap_or("operation_failed").to_string();
                ApiError::bad_gateway(code, e.to_string()).retryable(retryable)
            }
            WorkflowError::UnknownWorkflow { .. } => ApiError::not_found("unknown_workflow", e.to_string()),
            WorkflowError::Decode { .. } => ApiError::bad_request("invalid_input", e.to_string()),
            WorkflowError::Worker(worker) => worker.into(),
            WorkflowError::SignalClosed { .. }
            | WorkflowError::Journal(_)
            | WorkflowError::NonDeterministic { .. }
            | WorkflowError::ExecutionLost { .. } => {
                ApiError::internal("execution_failed", e.to_string()).retryable(retryable)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_error_is_conflict_with_kind_code() {
        let err: ApiError = WorkflowError::application("invalid_node_status", "deployed").into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.problem.code, "invalid_node_status");
        assert!(!err.problem.retryable);
    }

    #[test]
    fn test_timeout_is_retryable_gateway_timeout() {
        let err: ApiError = WorkflowError::from(InvokeError::Timeout {
            operation: "get-segment-list".to_string(),
            after: std::time::Duration::from_secs(60),
        })
        .into();
        assert_eq!(err.status, StatusCode::GATEWAY_TIMEOUT);
        assert!(err.problem.retryable);
    }

    #[test]
    fn test_request_id_fills_instance() {
        let err = ApiError::bad_request("invalid_channel", "nope").with_request_id("req-1");
        assert_eq!(err.problem.request_id, "req-1");
        assert_eq!(err.problem.instance.as_deref(), Some("req-1"));
    }
}
