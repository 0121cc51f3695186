pub mod descriptors;
pub mod error;
pub mod requests;
pub mod responses;

#[cfg(test)]
mod tests;

pub use descriptors::{ConsumerDescriptor, ServiceDescriptor, DEFAULT_GROUP, DEFAULT_TIMEOUT_MS};
pub use error::{Result, RpcError};
pub use requests::{generate_correlation_id, CallArgs, CallRequest, CorrelationId, MethodName};
pub use responses::{CallResponse, FailureKind, Outcome, RemoteFailure};
