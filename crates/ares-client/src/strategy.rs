//! Cluster strategies: pick one replica out of the live candidates.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use ares_common::{RpcError, ServiceDescriptor};

/// Replica selection policy.
///
/// `invoker_host` identifies the calling host and is only used by
/// [`HashStrategy`].
pub trait ClusterStrategy: Send + Sync {
    fn select(&self, candidates: &[ServiceDescriptor], invoker_host: &str) -> Option<ServiceDescriptor>;
}

/// Uniform random choice.
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl ClusterStrategy for RandomStrategy {
    fn select(&self, candidates: &[ServiceDescriptor], _invoker_host: &str) -> Option<ServiceDescriptor> {
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[idx].clone())
    }
}

/// Random choice biased by replica weight.
#[derive(Debug, Default)]
pub struct WeightRandomStrategy;

impl ClusterStrategy for WeightRandomStrategy {
    fn select(&self, candidates: &[ServiceDescriptor], _invoker_host: &str) -> Option<ServiceDescriptor> {
        let total = total_weight(candidates);
        if total == 0 {
            return None;
        }
        let point = rand::thread_rng().gen_range(0..total);
        pick_by_weight(candidates, point)
    }
}

/// Round robin over the candidates.
#[derive(Debug, Default)]
pub struct PollingStrategy {
    next: AtomicUsize,
}

impl ClusterStrategy for PollingStrategy {
    fn select(&self, candidates: &[ServiceDescriptor], _invoker_host: &str) -> Option<ServiceDescriptor> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[idx].clone())
    }
}

/// Round robin where each replica gets `weight` consecutive turns.
#[derive(Debug, Default)]
pub struct WeightPollingStrategy {
    next: AtomicUsize,
}

impl ClusterStrategy for WeightPollingStrategy {
    fn select(&self, candidates: &[ServiceDescriptor], _invoker_host: &str) -> Option<ServiceDescriptor> {
        let total = total_weight(candidates);
        if total == 0 {
            return None;
        }
        let point = (self.next.fetch_add(1, Ordering::Relaxed) as u64) % total;
        pick_by_weight(candidates, point)
    }
}

/// Sticky choice keyed by the calling host.
#[derive(Debug, Default)]
pub struct HashStrategy;

impl ClusterStrategy for HashStrategy {
    fn select(&self, candidates: &[ServiceDescriptor], invoker_host: &str) -> Option<ServiceDescriptor> {
        if candidates.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        invoker_host.hash(&mut hasher);
        let idx = (hasher.finish() % candidates.len() as u64) as usize;
        Some(candidates[idx].clone())
    }
}

fn total_weight(candidates: &[ServiceDescriptor]) -> u64 {
    candidates.iter().map(|d| d.weight as u64).sum()
}

/// Maps `point` in `0..total_weight` onto the replica owning that slice.
fn pick_by_weight(candidates: &[ServiceDescriptor], mut point: u64) -> Option<ServiceDescriptor> {
    for candidate in candidates {
        let weight = candidate.weight as u64;
        if point < weight {
            return Some(candidate.clone());
        }
        point -= weight;
    }
    None
}

/// Strategy names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterStrategyKind {
    Random,
    WeightRandom,
    Polling,
    WeightPolling,
    Hash,
}

impl ClusterStrategyKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Random => "Random",
            Self::WeightRandom => "WeightRandom",
            Self::Polling => "Polling",
            Self::WeightPolling => "WeightPolling",
            Self::Hash => "Hash",
        }
    }

    pub fn build(self) -> Arc<dyn ClusterStrategy> {
        match self {
            Self::Random => Arc::new(RandomStrategy),
            Self::WeightRandom => Arc::new(WeightRandomStrategy),
            Self::Polling => Arc::new(PollingStrategy::default()),
            Self::WeightPolling => Arc::new(WeightPollingStrategy::default()),
            Self::Hash => Arc::new(HashStrategy),
        }
    }
}

impl Default for ClusterStrategyKind {
    fn default() -> Self {
        Self::WeightRandom
    }
}

impl fmt::Display for ClusterStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterStrategyKind {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Random" => Ok(Self::Random),
            "WeightRandom" => Ok(Self::WeightRandom),
            "Polling" => Ok(Self::Polling),
            "WeightPolling" => Ok(Self::WeightPolling),
            "Hash" => Ok(Self::Hash),
            other => Err(RpcError::Config(format!("unknown cluster strategy '{}'", other))),
        }
    }
}
