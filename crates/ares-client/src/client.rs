use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::info;

use ares_common::config::ClientSection;
use ares_common::{ConsumerDescriptor, Result, RpcError, DEFAULT_GROUP, DEFAULT_TIMEOUT_MS};
use ares_registry::Registry;

use crate::engine::InvocationEngine;
use crate::holder::ResponseHolder;
use crate::pool::{ChannelPool, PoolConfig};
use crate::proxy::ClusterProxy;
use crate::strategy::ClusterStrategyKind;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// App key the remote services are published under
    pub app_key: String,
    pub group: String,
    /// Per-call budget
    pub timeout: Duration,
    /// Size of the bounded worker pool shared by all proxies
    pub worker_threads: usize,
    pub strategy: ClusterStrategyKind,
    pub pool: PoolConfig,
    pub sweep_interval: Duration,
    /// Host recorded in consumer registrations and used by the hash strategy
    pub invoker_host: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            app_key: "ares".to_string(),
            group: DEFAULT_GROUP.to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            worker_threads: 16,
            strategy: ClusterStrategyKind::default(),
            pool: PoolConfig::default(),
            sweep_interval: Duration::from_millis(10),
            invoker_host: "127.0.0.1".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            ..Default::default()
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn with_strategy(mut self, strategy: ClusterStrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_invoker_host(mut self, host: impl Into<String>) -> Self {
        self.invoker_host = host.into();
        self
    }

    /// Rejects settings the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(RpcError::Config("worker_threads must be greater than 0".to_string()));
        }
        if self.pool.channels_per_address == 0 {
            return Err(RpcError::Config(
                "channels_per_address must be greater than 0".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(RpcError::Config("sweep_interval must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn from_section(section: &ClientSection) -> Result<Self> {
        Ok(Self {
            app_key: section.app_key.clone(),
            group: section.group.clone(),
            timeout: Duration::from_millis(section.timeout_ms),
            worker_threads: section.worker_threads,
            strategy: section.cluster_strategy.parse()?,
            pool: PoolConfig::from(section),
            sweep_interval: Duration::from_millis(section.sweep_interval_ms),
            ..Default::default()
        })
    }
}

/// Client bootstrap.
///
/// [`start`](Self::start) discovers the services published under the
/// configured app key and group, seeds channel pools for every replica and
/// starts the slot sweeper. [`proxy`](Self::proxy) hands out a
/// [`ClusterProxy`] per interface and records this client as a consumer.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ares_client::{ClientConfig, RpcClient};
/// use ares_registry::{MemoryEnsemble, Registry, RegistryConfig};
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> ares_common::Result<()> {
/// let ensemble = MemoryEnsemble::new();
/// let registry = Registry::new(Arc::new(ensemble.connect()), RegistryConfig::default());
///
/// let client = RpcClient::start(registry, ClientConfig::new("ares")).await?;
/// let hello = client.proxy("ares.demo.HelloService").await?;
/// let greeting: String = hello.invoke("sayHello", vec![json!("ares")]).await?;
///
/// client.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct RpcClient {
    config: ClientConfig,
    registry: Arc<Registry>,
    holder: Arc<ResponseHolder>,
    pool: Arc<ChannelPool>,
    engine: Arc<InvocationEngine>,
    workers: Arc<Semaphore>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    pub async fn start(registry: Arc<Registry>, config: ClientConfig) -> Result<Self> {
        config.validate()?;

        registry.init_provider_map(&config.app_key, &config.group).await?;

        let holder = Arc::new(ResponseHolder::new());
        let pool = Arc::new(ChannelPool::new(config.pool.clone(), holder.clone()));
        pool.init(&registry.addresses()).await?;

        let engine = Arc::new(InvocationEngine::new(pool.clone(), holder.clone()));
        let sweeper = holder.spawn_sweeper(config.sweep_interval);

        info!(
            app_key = %config.app_key,
            group = %config.group,
            strategy = %config.strategy,
            "Client started"
        );

        Ok(Self {
            workers: Arc::new(Semaphore::new(config.worker_threads)),
            config,
            registry,
            holder,
            pool,
            engine,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Call surface for `interface`.
    ///
    /// Fails when no replica of the interface was discovered.
    pub async fn proxy(&self, interface: &str) -> Result<ClusterProxy> {
        if self.registry.provider_candidates(interface).is_empty() {
            return Err(RpcError::NoProviders(format!(
                "{}: service provider list is empty",
                interface
            )));
        }

        let consumer = ConsumerDescriptor::new(interface, &self.config.app_key, &self.config.invoker_host)
            .with_group(&self.config.group);
        self.registry.register_invoker(&consumer).await?;

        Ok(ClusterProxy::new(
            interface,
            &self.config.invoker_host,
            self.config.timeout,
            self.registry.clone(),
            self.engine.clone(),
            self.config.strategy.build(),
            self.workers.clone(),
        ))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<InvocationEngine> {
        &self.engine
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.holder.len()
    }

    /// Stops the sweeper, closes the channel pools and the worker pool.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.workers.close();
        self.pool.close();
        info!("Client shut down");
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_section() {
        let section = ClientSection {
            cluster_strategy: "Hash".to_string(),
            timeout_ms: 250,
            ..ClientSection::default()
        };
        let config = ClientConfig::from_section(&section).unwrap();
        assert_eq!(config.strategy, ClusterStrategyKind::Hash);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.pool.channels_per_address, 10);
    }

    #[test]
    fn test_config_from_section_rejects_unknown_strategy() {
        let section = ClientSection {
            cluster_strategy: "Fastest".to_string(),
            ..ClientSection::default()
        };
        assert!(ClientConfig::from_section(&section).is_err());
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        assert!(ClientConfig::default().validate().is_ok());

        let config = ClientConfig::default().with_worker_threads(0);
        assert!(matches!(config.validate(), Err(RpcError::Config(_))));

        let config = ClientConfig::default().with_pool(PoolConfig {
            channels_per_address: 0,
            connect_timeout_ms: 100,
        });
        assert!(matches!(config.validate(), Err(RpcError::Config(m)) if m.contains("channels_per_address")));

        let config = ClientConfig {
            sweep_interval: Duration::ZERO,
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(RpcError::Config(m)) if m.contains("sweep_interval")));
    }

    #[tokio::test]
    async fn test_start_rejects_zero_sweep_interval() {
        let ensemble = ares_registry::MemoryEnsemble::new();
        let registry = Registry::new(
            Arc::new(ensemble.connect()),
            ares_registry::RegistryConfig::default(),
        );
        let config = ClientConfig {
            sweep_interval: Duration::ZERO,
            ..ClientConfig::new("ares")
        };
        assert!(matches!(
            RpcClient::start(registry, config).await,
            Err(RpcError::Config(_))
        ));
    }
}
