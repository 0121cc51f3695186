use serde::{Deserialize, Serialize};

use super::descriptors::ServiceDescriptor;

pub type CorrelationId = String;
pub type MethodName = String;
pub type CallArgs = Vec<serde_json::Value>;

/// One outbound invocation.
///
/// The timeout bounds both channel acquisition and the wait for the result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallRequest {
    pub id: CorrelationId,
    pub service: ServiceDescriptor,
    pub method: MethodName,
    pub args: CallArgs,
    pub timeout_ms: u64,
}

impl CallRequest {
    /// Creates a request with a fresh correlation id and the service's
    /// configured timeout.
    pub fn new(service: ServiceDescriptor, method: impl Into<String>, args: CallArgs) -> Self {
        let timeout_ms = service.timeout_ms;
        CallRequest {
            id: generate_correlation_id(),
            service,
            method: method.into(),
            args,
            timeout_ms,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

/// Mints a globally unique correlation id.
pub fn generate_correlation_id() -> CorrelationId {
    uuid::Uuid::new_v4().to_string()
}
