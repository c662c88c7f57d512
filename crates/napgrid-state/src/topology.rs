//! Topology cache — the current snapshot of known functions.
//!
//! Readers take an `Arc` to the whole snapshot, so a refresh is a single
//! pointer swap and nobody observes a half-updated list.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::types::{DeploymentInfo, TopologySnapshot};

#[derive(Clone, Default)]
pub struct TopologyCache {
    current: Arc<RwLock<Arc<TopologySnapshot>>>,
}

impl TopologyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: TopologySnapshot) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new snapshot wholesale. Functions absent from it disappear.
    pub fn replace(&self, snapshot: TopologySnapshot) {
        let count = snapshot.functions.len();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
        debug!(functions = count, "topology replaced");
    }

    pub fn find(&self, name: &str) -> Option<DeploymentInfo> {
        self.snapshot().find(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.snapshot().find(name).is_some()
    }

    pub fn has_ready_pod(&self, name: &str) -> bool {
        self.snapshot()
            .find(name)
            .is_some_and(DeploymentInfo::has_ready_pod)
    }

    pub fn function_names(&self) -> Vec<String> {
        self.snapshot()
            .functions
            .iter()
            .map(|f| f.name.clone())
            .collect()
    }
}
