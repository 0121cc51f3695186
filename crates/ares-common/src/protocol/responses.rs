//! Ares Response Types
//!
//! This module defines the response side of the wire contract.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::{Result, RpcError};
use super::CorrelationId;

/// Category of a failure captured on the provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    /// Admission control could not grant a permit within the call timeout
    Rejected,
    /// No implementation is published for the requested interface
    ServiceNotFound,
    /// The interface is published but has no such method
    MethodNotFound,
    /// The method ran and failed
    Invocation,
    /// The request could not be decoded
    BadRequest,
}

/// A failure captured on the provider and shipped back in the response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Either the method's return value or a captured failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Outcome {
    Success(serde_json::Value),
    Failure(RemoteFailure),
}

/// One inbound result.
///
/// # Fields
///
/// - `id`: correlation id copied from the request
/// - `timeout_ms`: the request's timeout, echoed
/// - `outcome`: value or captured failure
/// - `received_at_ms`: set by the client when the response is ingested
///
/// # Example
///
/// ```
/// use ares_common::protocol::{CallResponse, FailureKind};
/// use serde_json::json;
///
/// let ok = CallResponse::success("abc".to_string(), 500, json!("hi"));
/// assert!(ok.is_success());
///
/// let rejected = CallResponse::failure("abc".to_string(), 500, FailureKind::Rejected, "busy");
/// assert!(!rejected.is_success());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallResponse {
    pub id: CorrelationId,
    pub timeout_ms: u64,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at_ms: Option<u64>,
}

impl CallResponse {
    pub fn success(id: CorrelationId, timeout_ms: u64, value: serde_json::Value) -> Self {
        CallResponse {
            id,
            timeout_ms,
            outcome: Outcome::Success(value),
            received_at_ms: None,
        }
    }

    pub fn failure(
        id: CorrelationId,
        timeout_ms: u64,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        CallResponse {
            id,
            timeout_ms,
            outcome: Outcome::Failure(RemoteFailure::new(kind, message)),
            received_at_ms: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    /// Unwraps the outcome. An admission rejection becomes
    /// [`RpcError::Rejected`] so it joins the timeout family; every other
    /// failure is [`RpcError::Remote`].
    pub fn into_result(self) -> Result<serde_json::Value> {
        match self.outcome {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(failure) if failure.kind == FailureKind::Rejected => {
                Err(RpcError::Rejected(failure.message))
            }
            Outcome::Failure(failure) => Err(RpcError::Remote(failure)),
        }
    }

    /// Stamps the receipt time with the current wall clock.
    pub fn stamp_received(&mut self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.received_at_ms = Some(now);
    }
}
