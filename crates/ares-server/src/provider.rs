use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use ares_common::config::ServerSection;
use ares_common::{Result, ServiceDescriptor, DEFAULT_GROUP, DEFAULT_TIMEOUT_MS};
use ares_registry::Registry;

use crate::dispatcher::{Dispatcher, Methods};
use crate::server::{RpcServer, ServerHandle};

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Address to listen on
    pub bind: String,
    /// Host published in the registry. Defaults to the bound IP, or
    /// `127.0.0.1` when bound to an unspecified address.
    pub advertise_host: Option<String>,
    pub app_key: String,
    pub group: String,
    pub weight: u32,
    pub max_concurrency: u32,
    pub timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8081".to_string(),
            advertise_host: None,
            app_key: "ares".to_string(),
            group: DEFAULT_GROUP.to_string(),
            weight: 1,
            max_concurrency: 10,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl From<&ServerSection> for ProviderConfig {
    fn from(section: &ServerSection) -> Self {
        Self {
            bind: section.bind.clone(),
            advertise_host: None,
            app_key: section.app_key.clone(),
            group: section.group.clone(),
            weight: section.weight,
            max_concurrency: section.max_concurrency,
            timeout_ms: section.timeout_ms,
        }
    }
}

/// Collects services before a [`Provider`] starts.
pub struct ProviderBuilder {
    registry: Arc<Registry>,
    config: ProviderConfig,
    services: Vec<(String, Methods)>,
}

impl ProviderBuilder {
    /// Adds a service published with the provider-wide settings.
    pub fn service(mut self, interface: impl Into<String>, methods: Methods) -> Self {
        self.services.push((interface.into(), methods));
        self
    }

    /// Binds the server, publishes every service into the dispatcher and
    /// registers the replicas.
    pub async fn start(self) -> Result<Provider> {
        let dispatcher = Arc::new(Dispatcher::new());
        let server = RpcServer::bind(&self.config.bind, dispatcher.clone()).await?;
        let local_addr = server.local_addr()?;
        let host = advertised_host(&self.config, local_addr);

        let mut published = Vec::with_capacity(self.services.len());
        for (interface, methods) in self.services {
            let descriptor = ServiceDescriptor::new(interface, host.clone(), local_addr.port())
                .with_app_key(self.config.app_key.clone())
                .with_group(self.config.group.clone())
                .with_weight(self.config.weight)
                .with_max_concurrency(self.config.max_concurrency)
                .with_timeout(self.config.timeout_ms);
            dispatcher.publish(descriptor.clone(), methods)?;
            published.push(descriptor);
        }

        let handle = server.spawn()?;
        self.registry.register_provider(&published).await?;

        info!(
            addr = %local_addr,
            services = published.len(),
            app_key = %self.config.app_key,
            "Provider started"
        );

        Ok(Provider {
            registry: self.registry,
            dispatcher,
            published,
            handle,
        })
    }
}

fn advertised_host(config: &ProviderConfig, local_addr: SocketAddr) -> String {
    match &config.advertise_host {
        Some(host) => host.clone(),
        None if local_addr.ip().is_unspecified() => "127.0.0.1".to_string(),
        None => local_addr.ip().to_string(),
    }
}

/// Provider bootstrap: a server plus its registry entries.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ares_registry::{MemoryEnsemble, Registry, RegistryConfig};
/// use ares_server::{Methods, Provider, ProviderConfig};
/// use serde_json::{json, Value};
///
/// # #[tokio::main]
/// # async fn main() -> ares_common::Result<()> {
/// let ensemble = MemoryEnsemble::new();
/// let registry = Registry::new(Arc::new(ensemble.connect()), RegistryConfig::default());
///
/// let provider = Provider::builder(registry, ProviderConfig::default())
///     .service(
///         "ares.demo.HelloService",
///         Methods::new().add("sayHello", |args: &[Value]| Ok(json!(format!("hello, {}", args[0])))),
///     )
///     .start()
///     .await?;
///
/// provider.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Provider {
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    published: Vec<ServiceDescriptor>,
    handle: ServerHandle,
}

impl Provider {
    pub fn builder(registry: Arc<Registry>, config: ProviderConfig) -> ProviderBuilder {
        ProviderBuilder {
            registry,
            config,
            services: Vec::new(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    pub fn descriptors(&self) -> &[ServiceDescriptor] {
        &self.published
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Removes the registry leaves and stops accepting connections.
    pub async fn shutdown(&self) {
        let removals = self
            .published
            .iter()
            .map(|descriptor| self.registry.unregister_provider(descriptor));
        for (descriptor, result) in self.published.iter().zip(futures::future::join_all(removals).await) {
            if let Err(e) = result {
                warn!(interface = %descriptor.interface, error = %e, "Failed to unregister provider");
            }
        }

        self.handle.stop();
        info!(addr = %self.local_addr(), "Provider stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertised_host() {
        let unspecified: SocketAddr = "0.0.0.0:8081".parse().unwrap();
        let loopback: SocketAddr = "127.0.0.1:8081".parse().unwrap();

        let config = ProviderConfig::default();
        assert_eq!(advertised_host(&config, unspecified), "127.0.0.1");
        assert_eq!(advertised_host(&config, loopback), "127.0.0.1");

        let config = ProviderConfig {
            advertise_host: Some("10.0.0.5".to_string()),
            ..ProviderConfig::default()
        };
        assert_eq!(advertised_host(&config, unspecified), "10.0.0.5");
    }

    #[test]
    fn test_config_from_section() {
        let section = ServerSection {
            max_concurrency: 3,
            ..ServerSection::default()
        };
        let config = ProviderConfig::from(&section);
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.bind, "0.0.0.0:8081");
        assert!(config.advertise_host.is_none());
    }
}
