//! Ares Server
//!
//! Provider side of Ares: the [`Dispatcher`] that resolves and admits calls,
//! the [`RpcServer`] accept loop, and the [`Provider`] bootstrap that ties
//! them to the registry.

pub mod dispatcher;
pub mod provider;
pub mod server;

pub use dispatcher::{Dispatcher, Methods, ServiceHandler};
pub use provider::{Provider, ProviderBuilder, ProviderConfig};
pub use server::{RpcServer, ServerHandle};
