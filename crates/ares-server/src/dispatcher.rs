use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use ares_common::{CallRequest, CallResponse, FailureKind, Result, RpcError, ServiceDescriptor};

/// A callable method of a published service.
///
/// Handlers run on the blocking thread pool, so they may block. An `Err`
/// becomes an invocation failure in the response.
pub trait ServiceHandler: Send + Sync {
    fn invoke(&self, args: &[Value]) -> std::result::Result<Value, String>;
}

impl<F> ServiceHandler for F
where
    F: Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync,
{
    fn invoke(&self, args: &[Value]) -> std::result::Result<Value, String> {
        self(args)
    }
}

/// Methods of one service, by name.
#[derive(Default, Clone)]
pub struct Methods {
    handlers: HashMap<String, Arc<dyn ServiceHandler>>,
}

impl Methods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.add_handler(name, Arc::new(handler))
    }

    pub fn add_handler(mut self, name: impl Into<String>, handler: Arc<dyn ServiceHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

struct PublishedService {
    descriptor: ServiceDescriptor,
    permits: Arc<Semaphore>,
}

/// Routes requests to published handlers under per-service admission control.
///
/// Each published service gets a semaphore sized to its `max_concurrency`
/// at publish time. A request that cannot get a permit within its own
/// timeout is answered with a `Rejected` failure and never reaches the
/// handler.
#[derive(Default)]
pub struct Dispatcher {
    services: RwLock<HashMap<String, Arc<PublishedService>>>,
    handlers: RwLock<HashMap<(String, String), Arc<dyn ServiceHandler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `methods` callable under `descriptor.interface`.
    pub fn publish(&self, descriptor: ServiceDescriptor, methods: Methods) -> Result<()> {
        descriptor.validate()?;
        if methods.is_empty() {
            return Err(RpcError::InvalidDescriptor(format!(
                "{}: no methods to publish",
                descriptor.interface
            )));
        }

        let mut services = self.services.write();
        if services.contains_key(&descriptor.interface) {
            return Err(RpcError::InvalidDescriptor(format!(
                "{} is already published",
                descriptor.interface
            )));
        }

        let interface = descriptor.interface.clone();
        {
            let mut handlers = self.handlers.write();
            for (name, handler) in methods.handlers {
                handlers.insert((interface.clone(), name), handler);
            }
        }

        debug!(
            interface = %interface,
            max_concurrency = descriptor.max_concurrency,
            "Service published"
        );
        services.insert(
            interface,
            Arc::new(PublishedService {
                permits: Arc::new(Semaphore::new(descriptor.max_concurrency as usize)),
                descriptor,
            }),
        );
        Ok(())
    }

    /// Descriptors of every published service.
    pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
        self.services
            .read()
            .values()
            .map(|s| s.descriptor.clone())
            .collect()
    }

    /// Free admission permits of a service, if it is published.
    pub fn available_permits(&self, interface: &str) -> Option<usize> {
        self.services
            .read()
            .get(interface)
            .map(|s| s.permits.available_permits())
    }

    /// Handles one request. Every failure is reported in the response.
    pub async fn dispatch(&self, request: CallRequest) -> CallResponse {
        let CallRequest {
            id,
            service,
            method,
            args,
            timeout_ms,
        } = request;
        let interface = service.interface;

        let Some(published) = self.services.read().get(&interface).cloned() else {
            warn!(interface = %interface, "Call for unknown service");
            return CallResponse::failure(
                id,
                timeout_ms,
                FailureKind::ServiceNotFound,
                format!("service {} is not published here", interface),
            );
        };

        let Some(handler) = self
            .handlers
            .read()
            .get(&(interface.clone(), method.clone()))
            .cloned()
        else {
            warn!(interface = %interface, method = %method, "Call for unknown method");
            return CallResponse::failure(
                id,
                timeout_ms,
                FailureKind::MethodNotFound,
                format!("{}.{} does not exist", interface, method),
            );
        };

        let admission = tokio::time::timeout(
            std::time::Duration::from_millis(timeout_ms),
            published.permits.clone().acquire_owned(),
        )
        .await;
        let permit = match admission {
            Ok(Ok(permit)) => permit,
            _ => {
                warn!(
                    id = %id,
                    interface = %interface,
                    method = %method,
                    timeout_ms,
                    "Admission timed out, rejecting call"
                );
                return CallResponse::failure(
                    id,
                    timeout_ms,
                    FailureKind::Rejected,
                    format!(
                        "{} is at its limit of {} concurrent calls",
                        interface, published.descriptor.max_concurrency
                    ),
                );
            }
        };

        let outcome = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            handler.invoke(&args)
        })
        .await;

        match outcome {
            Ok(Ok(value)) => CallResponse::success(id, timeout_ms, value),
            Ok(Err(message)) => {
                debug!(id = %id, interface = %interface, method = %method, "Handler returned an error");
                CallResponse::failure(id, timeout_ms, FailureKind::Invocation, message)
            }
            Err(e) => {
                error!(id = %id, interface = %interface, method = %method, "Handler did not complete: {}", e);
                let message = if e.is_panic() {
                    format!("{}.{} panicked", interface, method)
                } else {
                    format!("{}.{} was cancelled", interface, method)
                };
                CallResponse::failure(id, timeout_ms, FailureKind::Invocation, message)
            }
        }
    }
}
