use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ares_common::config::{RegistrySection, DEFAULT_ROOT_PATH};
use ares_common::{ConsumerDescriptor, Result, RpcError, ServiceDescriptor};

use crate::coordination::{ChildChange, CoordinationClient};

const PROVIDER_TYPE: &str = "provider";
const CONSUMER_TYPE: &str = "consumer";

/// Descriptors grouped by interface name.
pub type ServiceMap = HashMap<String, Vec<ServiceDescriptor>>;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Root of the registry tree in the coordination service
    pub root_path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root_path: DEFAULT_ROOT_PATH.to_string(),
        }
    }
}

impl From<&RegistrySection> for RegistryConfig {
    fn from(section: &RegistrySection) -> Self {
        Self {
            root_path: section.root_path.clone(),
        }
    }
}

/// State guarded by the structural lock.
#[derive(Default)]
struct Structure {
    /// Provider paths this registry is subscribed to
    watched: HashSet<String>,
}

/// Service registry and discovery.
///
/// Keeps two caches keyed by interface name:
///
/// - the **provider** cache holds what this process published
/// - the **consumer** cache holds what this process discovered
///
/// Both are refreshed from child-change notifications of the provider paths,
/// consumed by a single updater task. On a notification the cached
/// descriptors under that path are intersected with the live replicas;
/// replicas that appear later are not added back to the consumer cache.
///
/// Node creation, subscriptions and cache installs are serialized by one
/// async lock. Readers get cheap `Arc` snapshots and never wait on it.
pub struct Registry {
    client: Arc<dyn CoordinationClient>,
    root_path: String,
    providers: RwLock<Arc<ServiceMap>>,
    consumers: RwLock<Arc<ServiceMap>>,
    structure: tokio::sync::Mutex<Structure>,
    events: mpsc::UnboundedSender<ChildChange>,
    updater: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    /// Creates the registry and spawns its updater task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(client: Arc<dyn CoordinationClient>, config: RegistryConfig) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            client,
            root_path: config.root_path.trim_end_matches('/').to_string(),
            providers: RwLock::new(Arc::new(HashMap::new())),
            consumers: RwLock::new(Arc::new(HashMap::new())),
            structure: tokio::sync::Mutex::new(Structure::default()),
            events,
            updater: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::run_updater(Arc::downgrade(&registry), rx));
        *registry.updater.lock() = Some(handle);
        registry
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    /// Publishes the given replicas.
    ///
    /// For each descriptor this creates the persistent app and provider
    /// paths, the ephemeral leaf for the replica, and subscribes to the
    /// provider path.
    pub async fn register_provider(&self, descriptors: &[ServiceDescriptor]) -> Result<()> {
        if descriptors.is_empty() {
            return Ok(());
        }

        let mut structure = self.structure.lock().await;

        for descriptor in descriptors {
            descriptor.validate()?;
            if descriptor.app_key.is_empty() {
                return Err(RpcError::InvalidDescriptor(format!(
                    "{}: app key is empty",
                    descriptor.interface
                )));
            }

            let app_path = format!("{}/{}", self.root_path, descriptor.app_key);
            self.client.create_persistent(&app_path, true).await?;

            let provider_path = self.provider_path(
                &descriptor.app_key,
                &descriptor.group,
                &descriptor.interface,
            );
            self.client.create_persistent(&provider_path, true).await?;

            let leaf_path = format!("{}/{}", provider_path, descriptor.to_leaf());
            match self.client.create_ephemeral(&leaf_path).await {
                Ok(()) | Err(RpcError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }

            self.watch(&mut structure, &provider_path).await?;
            info!(
                "Registered provider {} at {}",
                descriptor.interface,
                descriptor.address()
            );
        }

        let mut next = (**self.providers.read()).clone();
        for descriptor in descriptors {
            let list = next.entry(descriptor.interface.clone()).or_default();
            if !list.contains(descriptor) {
                list.push(descriptor.clone());
            }
        }
        *self.providers.write() = Arc::new(next);

        Ok(())
    }

    /// Snapshot of the publisher-side cache.
    pub fn get_provider_service_map(&self) -> Arc<ServiceMap> {
        self.providers.read().clone()
    }

    /// Snapshot of the consumer-side cache.
    pub fn get_consumer_service_map(&self) -> Arc<ServiceMap> {
        self.consumers.read().clone()
    }

    /// Discovers every service published under `app_key`/`group`.
    ///
    /// Does nothing when the consumer cache is already populated.
    pub async fn init_provider_map(&self, app_key: &str, group: &str) -> Result<()> {
        if !self.consumers.read().is_empty() {
            return Ok(());
        }

        let mut structure = self.structure.lock().await;
        if !self.consumers.read().is_empty() {
            return Ok(());
        }

        let group_path = format!("{}/{}/{}", self.root_path, app_key, group);
        let services = match self.client.get_children(&group_path).await {
            Ok(services) => services,
            Err(RpcError::NoNode(_)) => {
                warn!("No services published under {}", group_path);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut next = ServiceMap::new();
        for service in services {
            let provider_path = self.provider_path(app_key, group, &service);
            let leaves = match self.client.get_children(&provider_path).await {
                Ok(leaves) => leaves,
                Err(RpcError::NoNode(_)) => Vec::new(),
                Err(e) => return Err(e),
            };

            let descriptors = parse_leaves(&service, app_key, &leaves);
            debug!("Discovered {} replicas of {}", descriptors.len(), service);
            if !descriptors.is_empty() {
                next.insert(service.clone(), descriptors);
            }

            self.watch(&mut structure, &provider_path).await?;
        }

        info!(
            "Consumer cache initialized for {}/{}: {} services",
            app_key,
            group,
            next.len()
        );
        *self.consumers.write() = Arc::new(next);
        Ok(())
    }

    /// Records a consumer of a remote interface. Governance only.
    pub async fn register_invoker(&self, consumer: &ConsumerDescriptor) -> Result<()> {
        let _structure = self.structure.lock().await;

        self.client.create_persistent(&self.root_path, true).await?;

        let consumer_path = format!(
            "{}/{}/{}/{}/{}",
            self.root_path, consumer.remote_app_key, consumer.group, consumer.interface, CONSUMER_TYPE
        );
        self.client.create_persistent(&consumer_path, true).await?;

        let leaf_path = format!("{}/{}", consumer_path, consumer.invoker_host);
        match self.client.create_ephemeral(&leaf_path).await {
            Ok(()) | Err(RpcError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }

        debug!("Registered invoker {} for {}", consumer.invoker_host, consumer.interface);
        Ok(())
    }

    /// Walks the `app_key` subtree and lists the providers and invokers of
    /// `service_name` across all groups.
    pub async fn query_providers_and_invokers(
        &self,
        service_name: &str,
        app_key: &str,
    ) -> Result<(Vec<ServiceDescriptor>, Vec<ConsumerDescriptor>)> {
        let mut providers = Vec::new();
        let mut invokers = Vec::new();

        let app_path = format!("{}/{}", self.root_path, app_key);
        let groups = match self.client.get_children(&app_path).await {
            Ok(groups) => groups,
            Err(RpcError::NoNode(_)) => return Ok((providers, invokers)),
            Err(e) => return Err(e),
        };

        for group in groups {
            let group_path = format!("{}/{}", app_path, group);
            let services = self.children_or_empty(&group_path).await?;

            for service in services.into_iter().filter(|s| s == service_name) {
                let service_path = format!("{}/{}", group_path, service);
                for node_type in self.children_or_empty(&service_path).await? {
                    let type_path = format!("{}/{}", service_path, node_type);
                    let leaves = self.children_or_empty(&type_path).await?;

                    match node_type.as_str() {
                        PROVIDER_TYPE => {
                            providers.extend(parse_leaves(&service, app_key, &leaves));
                        }
                        CONSUMER_TYPE => {
                            invokers.extend(leaves.into_iter().map(|host| {
                                ConsumerDescriptor::new(service.clone(), app_key, host)
                                    .with_group(group.clone())
                            }));
                        }
                        other => debug!("Ignoring unknown node type {} under {}", other, service_path),
                    }
                }
            }
        }

        Ok((providers, invokers))
    }

    /// Discovered replicas of one interface.
    pub fn provider_candidates(&self, interface: &str) -> Vec<ServiceDescriptor> {
        self.consumers
            .read()
            .get(interface)
            .cloned()
            .unwrap_or_default()
    }

    /// Discovered replicas grouped by `host:port`, used to seed channel pools.
    pub fn addresses(&self) -> HashMap<String, Vec<ServiceDescriptor>> {
        let snapshot = self.get_consumer_service_map();
        let mut by_address: HashMap<String, Vec<ServiceDescriptor>> = HashMap::new();
        for descriptor in snapshot.values().flatten() {
            by_address
                .entry(descriptor.address())
                .or_default()
                .push(descriptor.clone());
        }
        by_address
    }

    /// Removes a published replica's leaf and drops it from the provider cache.
    pub async fn unregister_provider(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        let _structure = self.structure.lock().await;

        let provider_path =
            self.provider_path(&descriptor.app_key, &descriptor.group, &descriptor.interface);
        let leaf_path = format!("{}/{}", provider_path, descriptor.to_leaf());
        match self.client.delete(&leaf_path).await {
            Ok(()) | Err(RpcError::NoNode(_)) => {}
            Err(e) => return Err(e),
        }

        let mut next = (**self.providers.read()).clone();
        if let Some(list) = next.get_mut(&descriptor.interface) {
            list.retain(|d| d != descriptor);
            if list.is_empty() {
                next.remove(&descriptor.interface);
            }
        }
        *self.providers.write() = Arc::new(next);

        info!("Unregistered provider {} at {}", descriptor.interface, descriptor.address());
        Ok(())
    }

    /// Applies one membership notification to both caches.
    ///
    /// Descriptors published under `change.path` whose address is not among
    /// the reported children are dropped. Applying the same change twice has
    /// no further effect.
    pub async fn apply_change(&self, change: &ChildChange) {
        let _structure = self.structure.lock().await;
        self.apply_children(&change.path, &change.children);
    }

    /// Stops the updater task. Caches keep their last contents.
    pub fn shutdown(&self) {
        if let Some(handle) = self.updater.lock().take() {
            handle.abort();
            info!("Registry updater stopped");
        }
    }

    fn provider_path(&self, app_key: &str, group: &str, interface: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.root_path, app_key, group, interface, PROVIDER_TYPE
        )
    }

    async fn watch(&self, structure: &mut Structure, provider_path: &str) -> Result<()> {
        if structure.watched.insert(provider_path.to_string()) {
            self.client
                .subscribe_children(provider_path, self.events.clone())
                .await?;
            debug!("Watching {}", provider_path);
        }
        Ok(())
    }

    async fn children_or_empty(&self, path: &str) -> Result<Vec<String>> {
        match self.client.get_children(path).await {
            Ok(children) => Ok(children),
            Err(RpcError::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn apply_children(&self, path: &str, children: &[String]) {
        let live: HashSet<String> = children
            .iter()
            .filter_map(|leaf| ServiceDescriptor::leaf_address(leaf))
            .collect();

        for cache in [&self.providers, &self.consumers] {
            let current = cache.read().clone();
            let mut next = ServiceMap::with_capacity(current.len());
            let mut dropped = 0;

            for (interface, descriptors) in current.iter() {
                let kept: Vec<ServiceDescriptor> = descriptors
                    .iter()
                    .filter(|d| {
                        let owned = self.provider_path(&d.app_key, &d.group, &d.interface) == path;
                        !owned || live.contains(&d.address())
                    })
                    .cloned()
                    .collect();
                dropped += descriptors.len() - kept.len();
                if !kept.is_empty() {
                    next.insert(interface.clone(), kept);
                }
            }

            if dropped > 0 {
                info!("Dropped {} replicas no longer live under {}", dropped, path);
                *cache.write() = Arc::new(next);
            }
        }
    }

    /// Consumes notifications until the registry is dropped or shut down.
    ///
    /// Notifications are treated as hints: the live child list is read again
    /// under the structural lock so that a stale event cannot undo a newer
    /// registration.
    async fn run_updater(registry: Weak<Registry>, mut rx: mpsc::UnboundedReceiver<ChildChange>) {
        while let Some(change) = rx.recv().await {
            let Some(registry) = registry.upgrade() else {
                break;
            };

            let _structure = registry.structure.lock().await;
            let children = match registry.client.get_children(&change.path).await {
                Ok(children) => children,
                Err(RpcError::NoNode(_)) => Vec::new(),
                Err(e) => {
                    warn!("Failed to re-read {}: {}, using notified list", change.path, e);
                    change.children.clone()
                }
            };
            registry.apply_children(&change.path, &children);
        }
        debug!("Registry updater exiting");
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Some(handle) = self.updater.get_mut().take() {
            handle.abort();
        }
    }
}

fn parse_leaves(interface: &str, app_key: &str, leaves: &[String]) -> Vec<ServiceDescriptor> {
    leaves
        .iter()
        .filter_map(|leaf| match ServiceDescriptor::from_leaf(interface, app_key, leaf) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                warn!("Skipping provider leaf under {}: {}", interface, e);
                None
            }
        })
        .collect()
}
