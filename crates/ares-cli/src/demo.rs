//! Demo services and an in-process cluster run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use ares_client::{ClientConfig, ClusterStrategyKind, RpcClient};
use ares_common::{AresConfig, ConsumerDescriptor, ServiceDescriptor};
use ares_registry::{MemoryEnsemble, Registry, RegistryConfig};
use ares_server::{Methods, Provider, ProviderConfig};

pub const HELLO_SERVICE: &str = "ares.demo.HelloService";

/// Methods of the demo service.
///
/// - `sayHello(name)` returns `"hello, <name>"`
/// - `add(a, b, ...)` sums integer arguments
/// - `sleep(ms)` blocks for `ms` milliseconds and returns it
pub fn hello_methods() -> Methods {
    Methods::new()
        .add("sayHello", |args: &[Value]| {
            let name = args.first().and_then(Value::as_str).unwrap_or("world");
            Ok(json!(format!("hello, {}", name)))
        })
        .add("add", |args: &[Value]| {
            args.iter()
                .map(|arg| arg.as_i64().ok_or_else(|| format!("not an integer: {}", arg)))
                .sum::<Result<i64, String>>()
                .map(|total| json!(total))
        })
        .add("sleep", |args: &[Value]| {
            let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            Ok(json!(ms))
        })
}

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub providers: usize,
    pub calls: usize,
    pub strategy: ClusterStrategyKind,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            providers: 2,
            calls: 10,
            strategy: ClusterStrategyKind::default(),
        }
    }
}

/// What a demo run saw in the registry, plus the replies it got.
#[derive(Debug, Serialize)]
pub struct DemoReport {
    pub providers: Vec<ServiceDescriptor>,
    pub invokers: Vec<ConsumerDescriptor>,
    pub replies: Vec<Value>,
}

/// Starts `options.providers` providers and one client against a shared
/// in-memory registry, makes `options.calls` calls, then tears everything down.
pub async fn run_demo(config: &AresConfig, options: &DemoOptions) -> Result<DemoReport> {
    let ensemble = MemoryEnsemble::new();
    let registry = || Registry::new(Arc::new(ensemble.connect()), RegistryConfig::from(&config.registry));

    // providers publish where the client looks
    let provider_config = ProviderConfig {
        bind: "127.0.0.1:0".to_string(),
        app_key: config.client.app_key.clone(),
        group: config.client.group.clone(),
        ..ProviderConfig::from(&config.server)
    };

    let mut providers = Vec::with_capacity(options.providers);
    for _ in 0..options.providers {
        let provider = Provider::builder(registry(), provider_config.clone())
            .service(HELLO_SERVICE, hello_methods())
            .start()
            .await?;
        providers.push(provider);
    }

    let client_config = ClientConfig::from_section(&config.client)?.with_strategy(options.strategy);
    let client = RpcClient::start(registry(), client_config).await?;
    let hello = client.proxy(HELLO_SERVICE).await?;

    let mut replies = Vec::with_capacity(options.calls);
    for i in 0..options.calls {
        replies.push(hello.call("sayHello", vec![json!(format!("caller-{}", i))]).await?);
    }

    let (found, invokers) = client
        .registry()
        .query_providers_and_invokers(HELLO_SERVICE, &config.client.app_key)
        .await?;
    info!(providers = found.len(), invokers = invokers.len(), calls = replies.len(), "Demo finished");

    client.shutdown();
    for provider in &providers {
        provider.shutdown().await;
    }

    Ok(DemoReport {
        providers: found,
        invokers,
        replies,
    })
}
