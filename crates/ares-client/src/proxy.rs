use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use ares_common::{CallArgs, CallRequest, Result, RpcError};
use ares_registry::Registry;

use crate::engine::InvocationEngine;
use crate::strategy::ClusterStrategy;

/// Call surface for one remote interface.
///
/// Every call picks a live replica with the configured cluster strategy and
/// runs the exchange on the client's bounded worker pool. The call timeout
/// caps the wait for a worker plus the whole round trip; when it runs out the
/// worker is cancelled and [`RpcError::Timeout`] is returned.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example(proxy: ares_client::ClusterProxy) -> ares_common::Result<()> {
/// use serde_json::json;
///
/// let greeting: String = proxy.invoke("sayHello", vec![json!("ares")]).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ClusterProxy {
    interface: String,
    invoker_host: String,
    timeout: Duration,
    registry: Arc<Registry>,
    engine: Arc<InvocationEngine>,
    strategy: Arc<dyn ClusterStrategy>,
    workers: Arc<Semaphore>,
}

impl ClusterProxy {
    pub fn new(
        interface: impl Into<String>,
        invoker_host: impl Into<String>,
        timeout: Duration,
        registry: Arc<Registry>,
        engine: Arc<InvocationEngine>,
        strategy: Arc<dyn ClusterStrategy>,
        workers: Arc<Semaphore>,
    ) -> Self {
        Self {
            interface: interface.into(),
            invoker_host: invoker_host.into(),
            timeout,
            registry,
            engine,
            strategy,
            workers,
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Calls `method` and returns the raw result value.
    pub async fn call(&self, method: &str, args: CallArgs) -> Result<Value> {
        self.call_with_timeout(method, args, self.timeout).await
    }

    /// Calls `method` and deserializes the result into `T`.
    pub async fn invoke<T: DeserializeOwned>(&self, method: &str, args: CallArgs) -> Result<T> {
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Like [`call`](Self::call) with an explicit budget.
    pub async fn call_with_timeout(&self, method: &str, args: CallArgs, timeout: Duration) -> Result<Value> {
        let timeout_ms = timeout.as_millis() as u64;
        let deadline = Instant::now() + timeout;

        let candidates = self.registry.provider_candidates(&self.interface);
        let target = self
            .strategy
            .select(&candidates, &self.invoker_host)
            .ok_or_else(|| RpcError::NoProviders(self.interface.clone()))?;

        let request = CallRequest::new(target, method, args).with_timeout(timeout_ms);
        debug!(
            id = %request.id,
            interface = %self.interface,
            method = %method,
            target = %request.service.address(),
            "Dispatching call"
        );

        let permit = match tokio::time::timeout_at(deadline, self.workers.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(RpcError::Shutdown),
            Err(_) => {
                warn!(interface = %self.interface, method = %method, "No worker available in time");
                return Err(RpcError::Timeout(timeout_ms));
            }
        };

        let engine = self.engine.clone();
        let mut worker = tokio::spawn(async move {
            let _permit = permit;
            engine.invoke(request).await
        });

        let response = match tokio::time::timeout_at(deadline, &mut worker).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => return Err(RpcError::Transport(format!("call worker failed: {}", e))),
            Err(_) => {
                // slot and channel are released once the aborted task is dropped
                worker.abort();
                let _ = worker.await;
                return Err(RpcError::Timeout(timeout_ms));
            }
        };

        response.into_result()
    }
}

impl std::fmt::Debug for ClusterProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterProxy")
            .field("interface", &self.interface)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ares_common::{CallResponse, FailureKind};
    use serde_json::json;

    #[test]
    fn test_into_result_success() {
        let response = CallResponse::success("a".to_string(), 10, json!([1, 2]));
        assert_eq!(response.into_result().unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_rejection_is_timeout_family() {
        let response = CallResponse::failure("a".to_string(), 10, FailureKind::Rejected, "busy");
        let err = response.into_result().unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_invocation_failure_is_remote() {
        let response = CallResponse::failure("a".to_string(), 10, FailureKind::Invocation, "boom");
        match response.into_result() {
            Err(RpcError::Remote(failure)) => {
                assert_eq!(failure.kind, FailureKind::Invocation);
                assert_eq!(failure.message, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
