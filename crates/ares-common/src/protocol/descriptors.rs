//! Service and consumer descriptors.
//!
//! A [`ServiceDescriptor`] names one replica of a published service. Its
//! registry leaf encoding is a wire contract shared with existing deployments:
//!
//! ```text
//! {ip}|{port}|{weight}|{concurrencyLimit}|{group}
//! ```
//!
//! Field order is fixed and must be preserved exactly.

use serde::{Deserialize, Serialize};

use super::error::{Result, RpcError};

/// Group used when a descriptor does not name one.
pub const DEFAULT_GROUP: &str = "default";

/// Call timeout used when none is configured.
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Separator between the fields of a provider leaf.
pub const LEAF_SEPARATOR: char = '|';

/// One callable service replica.
///
/// Descriptors are plain values. They are cloned, never shared mutably, when
/// they cross task boundaries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServiceDescriptor {
    /// Fully-qualified interface name, e.g. `ares.demo.HelloService`
    pub interface: String,
    /// Host the replica is bound to
    pub host: String,
    /// Port the replica is bound to
    pub port: u16,
    /// Per-call timeout in milliseconds
    pub timeout_ms: u64,
    /// Relative weight for weighted selection, always > 0
    pub weight: u32,
    /// Maximum concurrent in-flight calls on this replica, always > 0
    pub max_concurrency: u32,
    /// Owning application key
    pub app_key: String,
    /// Group name
    pub group: String,
}

impl ServiceDescriptor {
    pub fn new(interface: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            interface: interface.into(),
            host: host.into(),
            port,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            weight: 1,
            max_concurrency: 10,
            app_key: String::new(),
            group: DEFAULT_GROUP.to_string(),
        }
    }

    pub fn with_app_key(mut self, app_key: impl Into<String>) -> Self {
        self.app_key = app_key.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Network address of the replica as `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checks the descriptor invariants.
    pub fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(RpcError::InvalidDescriptor("interface name is empty".to_string()));
        }
        if self.host.is_empty() {
            return Err(RpcError::InvalidDescriptor(format!(
                "{}: host is empty",
                self.interface
            )));
        }
        if self.weight == 0 {
            return Err(RpcError::InvalidDescriptor(format!(
                "{}: weight must be greater than zero",
                self.interface
            )));
        }
        if self.max_concurrency == 0 {
            return Err(RpcError::InvalidDescriptor(format!(
                "{}: max_concurrency must be greater than zero",
                self.interface
            )));
        }
        if self.group.contains(LEAF_SEPARATOR) || self.host.contains(LEAF_SEPARATOR) {
            return Err(RpcError::InvalidDescriptor(format!(
                "{}: host and group must not contain '{}'",
                self.interface, LEAF_SEPARATOR
            )));
        }
        Ok(())
    }

    /// Encodes the registry leaf name for this replica.
    pub fn to_leaf(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.host, self.port, self.weight, self.max_concurrency, self.group
        )
    }

    /// Parses a registry leaf back into a descriptor.
    ///
    /// The interface and app key are not part of the leaf and come from the
    /// path the leaf was found under. The timeout is not published either and
    /// is left at the descriptor default.
    pub fn from_leaf(
        interface: impl Into<String>,
        app_key: impl Into<String>,
        leaf: &str,
    ) -> Result<Self> {
        let fields: Vec<&str> = leaf.split(LEAF_SEPARATOR).collect();
        if fields.len() != 5 || fields.iter().any(|f| f.is_empty()) {
            return Err(RpcError::InvalidLeaf(leaf.to_string()));
        }

        let port = fields[1]
            .parse::<u16>()
            .map_err(|_| RpcError::InvalidLeaf(leaf.to_string()))?;
        let weight = fields[2]
            .parse::<u32>()
            .map_err(|_| RpcError::InvalidLeaf(leaf.to_string()))?;
        let max_concurrency = fields[3]
            .parse::<u32>()
            .map_err(|_| RpcError::InvalidLeaf(leaf.to_string()))?;

        let descriptor = ServiceDescriptor {
            interface: interface.into(),
            host: fields[0].to_string(),
            port,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            weight,
            max_concurrency,
            app_key: app_key.into(),
            group: fields[4].to_string(),
        };
        descriptor
            .validate()
            .map_err(|_| RpcError::InvalidLeaf(leaf.to_string()))?;
        Ok(descriptor)
    }

    /// Address encoded in a provider leaf, without parsing the other fields.
    pub fn leaf_address(leaf: &str) -> Option<String> {
        let mut fields = leaf.split(LEAF_SEPARATOR);
        let host = fields.next().filter(|h| !h.is_empty())?;
        let port = fields.next().filter(|p| !p.is_empty())?;
        Some(format!("{}:{}", host, port))
    }
}

/// A client that depends on a remote interface.
///
/// Registered for governance only; nothing on the call path reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsumerDescriptor {
    pub interface: String,
    pub remote_app_key: String,
    pub group: String,
    pub invoker_host: String,
}

impl ConsumerDescriptor {
    pub fn new(
        interface: impl Into<String>,
        remote_app_key: impl Into<String>,
        invoker_host: impl Into<String>,
    ) -> Self {
        Self {
            interface: interface.into(),
            remote_app_key: remote_app_key.into(),
            group: DEFAULT_GROUP.to_string(),
            invoker_host: invoker_host.into(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }
}
