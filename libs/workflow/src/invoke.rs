//! Remote operation invocation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{InvokeError, RetryPolicy};

/// Default per-call timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Something that can execute a named operation: the controller API, a
/// local power driver, an address scanner.
#[async_trait]
pub trait OperationBackend: Send + Sync {
    async fn invoke(&self, operation: &str, input: Value) -> Result<Value, InvokeError>;
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Timeout for a single attempt. Falls back to the invoker default.
    pub timeout: Option<Duration>,

    /// Retry policy. Falls back to the invoker default.
    pub retry: Option<RetryPolicy>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            retry: None,
        }
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Routes operations to backends and applies timeout and retry.
pub struct Invoker {
    default: Arc<dyn OperationBackend>,
    routes: HashMap<String, Arc<dyn OperationBackend>>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl Invoker {
    /// Create an invoker sending every operation to `default`.
    pub fn new(default: Arc<dyn OperationBackend>) -> Self {
        Self {
            default,
            routes: HashMap::new(),
            timeout: DEFAULT_OPERATION_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    /// Send `operation` to `backend` instead of the default.
    pub fn with_route(mut self, operation: impl Into<String>, backend: Arc<dyn OperationBackend>) -> Self {
        self.routes.insert(operation.into(), backend);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Call `operation`, retrying retryable failures.
    pub async fn call(
        &self,
        operation: &str,
        input: Value,
        options: &CallOptions,
    ) -> Result<Value, InvokeError> {
        let backend = self.routes.get(operation).unwrap_or(&self.default);
        let timeout = options.timeout.unwrap_or(self.timeout);
        let retry = options.retry.as_ref().unwrap_or(&self.retry);

        let mut attempt = 0;
        loop {
            attempt += 1;

            let result = match tokio::time::timeout(timeout, backend.invoke(operation, input.clone())).await {
                Ok(result) => result,
                Err(_) => Err(InvokeError::Timeout {
                    operation: operation.to_string(),
                    after: timeout,
                }),
            };

            match result {
                Ok(output) => {
                    debug!(operation, attempt, "Operation completed");
                    return Ok(output);
                }
                Err(e) if e.is_retryable() && retry.allows_retry(attempt) => {
                    let delay = retry.backoff.delay(attempt - 1);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
