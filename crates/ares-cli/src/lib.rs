// Copyright 2025 Ares Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Ares CLI
//!
//! Command-line interface for the Ares RPC framework.
//!
//! ## Key Commands
//!
//! - `ares registry`: Run a coordination server other processes register with
//! - `ares provider`: Serve the demo services and register them at
//!   `registry.address`
//! - `ares discover`: List the providers published under an app key and group
//! - `ares call`: Make one call to a provider at `host:port` (outputs raw JSON)
//! - `ares demo`: Start providers and a client in one process and print the
//!   registry view afterwards
//!
//! Configuration comes from an optional TOML file (`--config`) overlaid with
//! `ARES_*` environment variables.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use ares_client::{ChannelPool, InvocationEngine, PoolConfig, ResponseHolder};
use ares_common::{AresConfig, CallRequest, ServiceDescriptor};
use ares_registry::{Registry, RegistryConfig, RemoteConfig, RemoteSession, ServiceMap};

pub mod demo;

pub use demo::{hello_methods, run_demo, DemoOptions, DemoReport, HELLO_SERVICE};

/// Installs the fmt subscriber on stderr. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Loads the configuration file if given, then applies environment overrides.
pub fn load_config(path: Option<&str>) -> Result<AresConfig> {
    let config = match path {
        Some(path) => AresConfig::load(path).with_context(|| format!("Failed to load config {}", path))?,
        None => AresConfig::default(),
    };
    let config = config.apply_env()?;
    config.validate()?;
    Ok(config)
}

/// Parses call arguments: a JSON array is spread into positional
/// arguments, any other value is passed as the single argument.
pub fn parse_call_args(raw: &str) -> Result<Vec<Value>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("Invalid JSON in args: {}", e))?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}

/// Splits `host:port`.
pub fn parse_address(address: &str) -> Result<(String, u16)> {
    let Some((host, port)) = address.rsplit_once(':') else {
        bail!("Invalid address '{}': expected host:port", address);
    };
    if host.is_empty() {
        bail!("Invalid address '{}': missing host", address);
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("Invalid port in address '{}'", address))?;
    Ok((host.to_string(), port))
}

/// Opens a session on the coordination server at `registry.address`.
pub async fn connect_registry(config: &AresConfig) -> Result<Arc<Registry>> {
    let session = RemoteSession::connect(&RemoteConfig::from(&config.registry))
        .await
        .with_context(|| format!("Failed to reach registry at {}", config.registry.address))?;
    Ok(Registry::new(Arc::new(session), RegistryConfig::from(&config.registry)))
}

/// Lists the providers published under `app_key`/`group`.
pub async fn discover(config: &AresConfig, app_key: &str, group: &str) -> Result<ServiceMap> {
    let registry = connect_registry(config).await?;
    let result = registry.init_provider_map(app_key, group).await;
    let services = (*registry.get_consumer_service_map()).clone();
    registry.shutdown();
    result?;
    Ok(services)
}

/// Makes one call straight to the provider at `address`, bypassing discovery.
pub async fn call_once(
    address: &str,
    interface: &str,
    method: &str,
    args: Vec<Value>,
    timeout: Duration,
) -> Result<Value> {
    let (host, port) = parse_address(address)?;
    let timeout_ms = timeout.as_millis() as u64;

    let holder = Arc::new(ResponseHolder::new());
    let pool = Arc::new(ChannelPool::new(
        PoolConfig {
            channels_per_address: 1,
            connect_timeout_ms: timeout_ms,
        },
        holder.clone(),
    ));
    let engine = InvocationEngine::new(pool.clone(), holder);

    let service = ServiceDescriptor::new(interface, host, port).with_timeout(timeout_ms);
    let request = CallRequest::new(service, method, args).with_timeout(timeout_ms);
    let response = engine.invoke(request).await;
    pool.close();

    Ok(response?.into_result()?)
}
