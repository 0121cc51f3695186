//! Coordination service client.
//!
//! The registry talks to a hierarchical coordination store through the
//! [`CoordinationClient`] trait: persistent and ephemeral nodes addressed by
//! `/`-separated paths, plus child-change subscriptions.
//!
//! [`MemoryEnsemble`] is an in-process store implementing the same contract.
//! It can be shared with other processes through
//! [`CoordinationServer`](crate::remote::CoordinationServer).
//! Each [`MemorySession`] owns the ephemeral nodes it created; closing (or
//! dropping) the session deletes them and notifies subscribers, which is how
//! a provider going away is observed by consumers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use ares_common::{Result, RpcError};

/// Full child list of `path` after a membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildChange {
    pub path: String,
    pub children: Vec<String>,
}

pub type ChildChangeSink = mpsc::UnboundedSender<ChildChange>;

#[async_trait]
pub trait CoordinationClient: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create a persistent node. With `recursive`, missing ancestors are
    /// created and an already existing node is not an error.
    async fn create_persistent(&self, path: &str, recursive: bool) -> Result<()>;

    /// Create a node that lives as long as this session.
    async fn create_ephemeral(&self, path: &str) -> Result<()>;

    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Push the full child list of `path` into `sink` after every change.
    /// The path does not need to exist yet.
    async fn subscribe_children(&self, path: &str, sink: ChildChangeSink) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Persistent,
    Ephemeral(u64),
}

#[derive(Default)]
struct EnsembleState {
    nodes: BTreeMap<String, NodeKind>,
    watches: HashMap<String, Vec<ChildChangeSink>>,
    next_session: u64,
}

impl EnsembleState {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };

        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn insert(&mut self, path: &str, kind: NodeKind) -> Result<()> {
        if self.exists(path) {
            return Err(RpcError::NodeExists(path.to_string()));
        }
        let parent = parent_of(path);
        if !self.exists(parent) {
            return Err(RpcError::NoNode(parent.to_string()));
        }
        if let Some(NodeKind::Ephemeral(_)) = self.nodes.get(parent) {
            return Err(RpcError::Coordination(format!(
                "ephemeral node {} cannot have children",
                parent
            )));
        }
        self.nodes.insert(path.to_string(), kind);
        self.notify(parent);
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        if !self.nodes.contains_key(path) {
            return Err(RpcError::NoNode(path.to_string()));
        }
        if !self.children(path).is_empty() {
            return Err(RpcError::Coordination(format!("node {} is not empty", path)));
        }
        self.nodes.remove(path);
        self.notify(parent_of(path));
        Ok(())
    }

    fn notify(&mut self, path: &str) {
        let children = if self.exists(path) {
            self.children(path)
        } else {
            Vec::new()
        };

        if let Some(sinks) = self.watches.get_mut(path) {
            sinks.retain(|sink| {
                sink.send(ChildChange {
                    path: path.to_string(),
                    children: children.clone(),
                })
                .is_ok()
            });
        }
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn check_path(path: &str) -> Result<()> {
    let valid = path == "/"
        || (path.starts_with('/') && !path.ends_with('/') && !path[1..].split('/').any(str::is_empty));
    if valid {
        Ok(())
    } else {
        Err(RpcError::Coordination(format!("invalid path '{}'", path)))
    }
}

/// In-process coordination store shared by any number of sessions.
#[derive(Clone, Default)]
pub struct MemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session against this ensemble.
    pub fn connect(&self) -> MemorySession {
        let id = {
            let mut state = self.state.lock();
            state.next_session += 1;
            state.next_session
        };
        debug!("Coordination session {} opened", id);
        MemorySession {
            ensemble: self.clone(),
            id,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of nodes currently stored, ephemeral ones included.
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }
}

/// One client session; owns the ephemeral nodes it creates.
pub struct MemorySession {
    ensemble: MemoryEnsemble,
    id: u64,
    closed: AtomicBool,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// End the session: its ephemeral nodes are deleted and watchers of their
    /// parents are notified.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut state = self.ensemble.state.lock();
        let owned: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, kind)| **kind == NodeKind::Ephemeral(self.id))
            .map(|(path, _)| path.clone())
            .collect();

        let mut parents = BTreeSet::new();
        for path in &owned {
            state.nodes.remove(path);
            parents.insert(parent_of(path).to_string());
        }
        for parent in parents {
            state.notify(&parent);
        }

        debug!("Coordination session {} closed, {} ephemeral nodes removed", self.id, owned.len());
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(RpcError::Coordination(format!("session {} is closed", self.id)))
        } else {
            Ok(())
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl CoordinationClient for MemorySession {
    async fn exists(&self, path: &str) -> Result<bool> {
        self.ensure_open()?;
        check_path(path)?;
        Ok(self.ensemble.state.lock().exists(path))
    }

    async fn create_persistent(&self, path: &str, recursive: bool) -> Result<()> {
        self.ensure_open()?;
        check_path(path)?;
        let mut state = self.ensemble.state.lock();

        if !recursive {
            return state.insert(path, NodeKind::Persistent);
        }

        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if !state.exists(&current) {
                state.insert(&current, NodeKind::Persistent)?;
            }
        }
        Ok(())
    }

    async fn create_ephemeral(&self, path: &str) -> Result<()> {
        self.ensure_open()?;
        check_path(path)?;
        self.ensemble
            .state
            .lock()
            .insert(path, NodeKind::Ephemeral(self.id))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        check_path(path)?;
        let state = self.ensemble.state.lock();
        if !state.exists(path) {
            return Err(RpcError::NoNode(path.to_string()));
        }
        Ok(state.children(path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.ensure_open()?;
        check_path(path)?;
        self.ensemble.state.lock().remove(path)
    }

    async fn subscribe_children(&self, path: &str, sink: ChildChangeSink) -> Result<()> {
        self.ensure_open()?;
        check_path(path)?;
        self.ensemble
            .state
            .lock()
            .watches
            .entry(path.to_string())
            .or_default()
            .push(sink);
        Ok(())
    }
}
