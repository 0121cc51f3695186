//! Ares Registry
//!
//! Service registration and discovery on top of a hierarchical coordination
//! service.
//!
//! # Key Layout
//!
//! ```text
//! {root}/{appKey}/{group}/{serviceName}/provider/{ip}|{port}|{weight}|{concurrencyLimit}|{group}
//! {root}/{appKey}/{group}/{serviceName}/consumer/{ip}
//! ```
//!
//! Provider and consumer leaves are ephemeral: they disappear with the
//! session that created them, and subscribers of the provider path are told
//! the new child list.
//!
//! Sessions come from a [`MemoryEnsemble`] in the same process, or from a
//! [`RemoteSession`] on a [`CoordinationServer`] shared by several processes.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use ares_common::ServiceDescriptor;
//! use ares_registry::{MemoryEnsemble, Registry, RegistryConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ares_common::Result<()> {
//! let ensemble = MemoryEnsemble::new();
//! let registry = Registry::new(Arc::new(ensemble.connect()), RegistryConfig::default());
//!
//! let hello = ServiceDescriptor::new("ares.demo.HelloService", "127.0.0.1", 8081)
//!     .with_app_key("ares");
//! registry.register_provider(&[hello]).await?;
//!
//! assert_eq!(registry.get_provider_service_map().len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod coordination;
pub mod registry;
pub mod remote;

pub use coordination::{ChildChange, ChildChangeSink, CoordinationClient, MemoryEnsemble, MemorySession};
pub use registry::{Registry, RegistryConfig, ServiceMap};
pub use remote::{CoordinationServer, CoordinationServerHandle, RemoteConfig, RemoteSession};
