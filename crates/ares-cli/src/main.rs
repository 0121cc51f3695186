//! # Ares CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Run the coordination server providers and consumers share
//! ares registry -b 127.0.0.1:2181
//!
//! # Serve the demo services on a fixed port and register them
//! ares provider -b 0.0.0.0:8081
//!
//! # List what is published under the client app key and group
//! ares discover
//!
//! # Call a provider directly (outputs raw JSON)
//! ares call 127.0.0.1:8081 ares.demo.HelloService sayHello -a '["ares"]'
//!
//! # Two providers and a client in one process
//! ares demo -p 2 -n 10 -s Polling
//! ```

use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;

use ares_cli::{
    call_once, connect_registry, discover, hello_methods, load_config, parse_call_args, DemoOptions, HELLO_SERVICE,
};
use ares_client::ClusterStrategyKind;
use ares_common::AresConfig;
use ares_registry::{CoordinationServer, MemoryEnsemble};
use ares_server::{Provider, ProviderConfig};

#[derive(FromArgs)]
/// Ares - registry backed RPC
struct Cli {
    /// path to a TOML configuration file
    #[argh(option, short = 'c')]
    config: Option<String>,

    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Registry(RegistryArgs),
    Provider(ProviderArgs),
    Discover(DiscoverArgs),
    Call(CallArgs),
    Demo(DemoArgs),
}

/// Arguments for running the coordination server.
#[derive(FromArgs)]
#[argh(subcommand, name = "registry")]
/// run a coordination server
struct RegistryArgs {
    /// address to bind to, overrides registry.address
    #[argh(option, short = 'b')]
    bind: Option<String>,
}

/// Arguments for serving the demo services.
///
/// The provider registers with the coordination server at
/// `registry.address` and unregisters on Ctrl-C.
#[derive(FromArgs)]
#[argh(subcommand, name = "provider")]
/// serve the demo services
struct ProviderArgs {
    /// address to bind to, overrides server.bind
    #[argh(option, short = 'b')]
    bind: Option<String>,

    /// host to publish in the registry instead of the bound IP
    #[argh(option, long = "advertise-host")]
    advertise_host: Option<String>,

    /// concurrent calls admitted per service, overrides server.max_concurrency
    #[argh(option, long = "max-concurrency")]
    max_concurrency: Option<u32>,
}

/// Arguments for listing published providers.
///
/// Outputs a JSON object keyed by interface name.
#[derive(FromArgs)]
#[argh(subcommand, name = "discover")]
/// list the providers published in the registry
struct DiscoverArgs {
    /// app key to look under, overrides client.app_key
    #[argh(option, short = 'k', long = "app-key")]
    app_key: Option<String>,

    /// group to look under, overrides client.group
    #[argh(option, short = 'g')]
    group: Option<String>,
}

/// Arguments for making a single call.
///
/// Outputs the raw JSON result to stdout. Errors go to stderr with a
/// non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a method on a provider
struct CallArgs {
    /// provider address as host:port
    #[argh(positional)]
    address: String,

    /// service interface name
    #[argh(positional)]
    interface: String,

    /// method name
    #[argh(positional)]
    method: String,

    /// JSON arguments; an array is spread into positional arguments
    #[argh(option, short = 'a', long = "args", default = "\"[]\".into()")]
    args: String,

    /// call timeout in milliseconds, overrides client.timeout_ms
    #[argh(option, short = 't', long = "timeout-ms")]
    timeout_ms: Option<u64>,
}

/// Arguments for the in-process demo.
#[derive(FromArgs)]
#[argh(subcommand, name = "demo")]
/// run providers and a client in one process
struct DemoArgs {
    /// number of providers to start
    #[argh(option, short = 'p', default = "2")]
    providers: usize,

    /// number of calls to make
    #[argh(option, short = 'n', default = "10")]
    calls: usize,

    /// cluster strategy, overrides client.cluster_strategy
    #[argh(option, short = 's')]
    strategy: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call and discover keep stdout and stderr clean for scripting
    if !matches!(cli.command, Commands::Call(_) | Commands::Discover(_)) {
        ares_cli::init_tracing();
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Registry(args) => run_registry(config, args).await,
        Commands::Provider(args) => run_provider(config, args).await,
        Commands::Discover(args) => run_discover(config, args).await,
        Commands::Call(args) => run_call(config, args).await,
        Commands::Demo(args) => run_demo(config, args).await,
    }
}

async fn run_registry(config: AresConfig, args: RegistryArgs) -> Result<()> {
    let bind = args.bind.unwrap_or(config.registry.address);
    let server = CoordinationServer::bind(&bind, MemoryEnsemble::new()).await?;
    tracing::info!("Coordination server listening on {}", server.local_addr()?);
    let handle = server.spawn()?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    handle.stop();
    Ok(())
}

async fn run_provider(config: AresConfig, args: ProviderArgs) -> Result<()> {
    let mut provider_config = ProviderConfig::from(&config.server);
    if let Some(bind) = args.bind {
        provider_config.bind = bind;
    }
    if let Some(max_concurrency) = args.max_concurrency {
        provider_config.max_concurrency = max_concurrency;
    }
    provider_config.advertise_host = args.advertise_host;

    let registry = connect_registry(&config).await?;

    let provider = Provider::builder(registry, provider_config)
        .service(HELLO_SERVICE, hello_methods())
        .start()
        .await?;
    tracing::info!("Serving {} on {}", HELLO_SERVICE, provider.local_addr());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    provider.shutdown().await;
    Ok(())
}

async fn run_discover(config: AresConfig, args: DiscoverArgs) -> Result<()> {
    let app_key = args.app_key.unwrap_or_else(|| config.client.app_key.clone());
    let group = args.group.unwrap_or_else(|| config.client.group.clone());

    let services = discover(&config, &app_key, &group).await?;
    let services: std::collections::BTreeMap<_, _> = services.into_iter().collect();
    println!("{}", serde_json::to_string_pretty(&services)?);
    Ok(())
}

async fn run_call(config: AresConfig, args: CallArgs) -> Result<()> {
    let call_args = parse_call_args(&args.args)?;
    let timeout = Duration::from_millis(args.timeout_ms.unwrap_or(config.client.timeout_ms));

    let value = call_once(&args.address, &args.interface, &args.method, call_args, timeout).await?;
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}

async fn run_demo(config: AresConfig, args: DemoArgs) -> Result<()> {
    let strategy = args
        .strategy
        .as_deref()
        .unwrap_or(&config.client.cluster_strategy)
        .parse::<ClusterStrategyKind>()?;
    let options = DemoOptions {
        providers: args.providers,
        calls: args.calls,
        strategy,
    };

    let report = ares_cli::run_demo(&config, &options).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_provider() {
        let args: Cli = Cli::from_args(&["ares"], &["provider", "-b", "127.0.0.1:9001"]).unwrap();
        assert!(args.config.is_none());
        match args.command {
            Commands::Provider(ProviderArgs {
                bind,
                advertise_host,
                max_concurrency,
            }) => {
                assert_eq!(bind.as_deref(), Some("127.0.0.1:9001"));
                assert!(advertise_host.is_none());
                assert!(max_concurrency.is_none());
            }
            _ => panic!("Expected Provider command"),
        }
    }

    #[test]
    fn test_cli_parse_provider_all_options() {
        let args: Cli = Cli::from_args(
            &["ares"],
            &[
                "-c",
                "ares.toml",
                "provider",
                "--advertise-host",
                "10.0.0.7",
                "--max-concurrency",
                "4",
            ],
        )
        .unwrap();
        assert_eq!(args.config.as_deref(), Some("ares.toml"));
        match args.command {
            Commands::Provider(ProviderArgs {
                bind,
                advertise_host,
                max_concurrency,
            }) => {
                assert!(bind.is_none());
                assert_eq!(advertise_host.as_deref(), Some("10.0.0.7"));
                assert_eq!(max_concurrency, Some(4));
            }
            _ => panic!("Expected Provider command"),
        }
    }

    #[test]
    fn test_cli_parse_call() {
        let args: Cli = Cli::from_args(
            &["ares"],
            &["call", "127.0.0.1:8081", "ares.demo.HelloService", "sayHello"],
        )
        .unwrap();
        match args.command {
            Commands::Call(CallArgs {
                address,
                interface,
                method,
                args,
                timeout_ms,
            }) => {
                assert_eq!(address, "127.0.0.1:8081");
                assert_eq!(interface, "ares.demo.HelloService");
                assert_eq!(method, "sayHello");
                assert_eq!(args, "[]"); // default
                assert!(timeout_ms.is_none());
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_call_with_args() {
        let args: Cli = Cli::from_args(
            &["ares"],
            &[
                "call",
                "127.0.0.1:8081",
                "ares.demo.HelloService",
                "add",
                "-a",
                "[1, 2]",
                "-t",
                "250",
            ],
        )
        .unwrap();
        match args.command {
            Commands::Call(CallArgs { args, timeout_ms, .. }) => {
                assert_eq!(args, "[1, 2]");
                assert_eq!(timeout_ms, Some(250));
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_call_missing_method() {
        let result = Cli::from_args(&["ares"], &["call", "127.0.0.1:8081", "ares.demo.HelloService"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parse_demo_defaults() {
        let args: Cli = Cli::from_args(&["ares"], &["demo"]).unwrap();
        match args.command {
            Commands::Demo(DemoArgs {
                providers,
                calls,
                strategy,
            }) => {
                assert_eq!(providers, 2);
                assert_eq!(calls, 10);
                assert!(strategy.is_none());
            }
            _ => panic!("Expected Demo command"),
        }
    }

    #[test]
    fn test_cli_parse_demo_custom() {
        let args: Cli = Cli::from_args(&["ares"], &["demo", "-p", "3", "-n", "7", "-s", "Hash"]).unwrap();
        match args.command {
            Commands::Demo(DemoArgs {
                providers,
                calls,
                strategy,
            }) => {
                assert_eq!(providers, 3);
                assert_eq!(calls, 7);
                assert_eq!(strategy.as_deref(), Some("Hash"));
            }
            _ => panic!("Expected Demo command"),
        }
    }

    #[test]
    fn test_cli_parse_registry() {
        let args: Cli = Cli::from_args(&["ares"], &["registry", "-b", "0.0.0.0:2181"]).unwrap();
        match args.command {
            Commands::Registry(RegistryArgs { bind }) => assert_eq!(bind.as_deref(), Some("0.0.0.0:2181")),
            _ => panic!("Expected Registry command"),
        }
    }

    #[test]
    fn test_cli_parse_discover() {
        let args: Cli = Cli::from_args(&["ares"], &["discover", "-k", "billing", "-g", "blue"]).unwrap();
        match args.command {
            Commands::Discover(DiscoverArgs { app_key, group }) => {
                assert_eq!(app_key.as_deref(), Some("billing"));
                assert_eq!(group.as_deref(), Some("blue"));
            }
            _ => panic!("Expected Discover command"),
        }
    }

    #[test]
    fn test_cli_parse_unknown_subcommand() {
        assert!(Cli::from_args(&["ares"], &["top", "127.0.0.1:8080"]).is_err());
    }
}
