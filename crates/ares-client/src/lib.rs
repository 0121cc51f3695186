//! Ares Client
//!
//! Consumer side of Ares: per-address channel pools, the invocation engine
//! that correlates responses with waiting callers, cluster strategies and the
//! per-interface [`ClusterProxy`] call surface.

pub mod channel;
pub mod client;
pub mod engine;
pub mod holder;
pub mod pool;
pub mod proxy;
pub mod strategy;

pub use channel::Channel;
pub use client::{ClientConfig, RpcClient};
pub use engine::InvocationEngine;
pub use holder::{PendingCallSlot, ResponseHolder};
pub use pool::{ChannelPool, ChannelQueue, PoolConfig};
pub use proxy::ClusterProxy;
pub use strategy::{
    ClusterStrategy, ClusterStrategyKind, HashStrategy, PollingStrategy, RandomStrategy,
    WeightPollingStrategy, WeightRandomStrategy,
};
