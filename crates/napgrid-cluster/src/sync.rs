//! Topology and activity synchronization with the shared store.
//!
//! `TopologySync` keeps the local [`TopologyCache`] fresh: the leader lists
//! functions from the orchestrator and publishes the snapshot, followers
//! pull the published snapshot. `ActivitySync` merges local activity with
//! the store so the leader's autoscaler sees calls served by any node.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use napgrid_state::{ActivityTracker, KeyValueStore, TopologyCache, TopologySnapshot};

use crate::leader::LeaderHandle;
use crate::orchestrator::Orchestrator;

/// Store key of the published topology snapshot.
pub const TOPOLOGY_KEY: &str = "topology:deployments";

/// Store key of one function's last-call timestamp.
pub fn activity_key(function: &str) -> String {
    format!("activity:{function}")
}

/// What one topology refresh did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Leader: listed from the orchestrator and wrote a changed snapshot.
    Published,
    /// Leader: listed from the orchestrator, store already current.
    Unchanged,
    /// Follower: replaced the cache from the store.
    Pulled,
    /// Follower: nothing usable in the store, cache kept.
    Skipped,
}

// ── Topology ───────────────────────────────────────────────────────

pub struct TopologySync {
    namespace: String,
    orchestrator: Arc<dyn Orchestrator>,
    store: Arc<dyn KeyValueStore>,
    cache: TopologyCache,
    leadership: LeaderHandle,
}

impl TopologySync {
    pub fn new(
        namespace: impl Into<String>,
        orchestrator: Arc<dyn Orchestrator>,
        store: Arc<dyn KeyValueStore>,
        cache: TopologyCache,
        leadership: LeaderHandle,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            orchestrator,
            store,
            cache,
            leadership,
        }
    }

    pub async fn refresh(&self) -> anyhow::Result<RefreshOutcome> {
        if self.leadership.is_leader() {
            self.refresh_from_orchestrator().await
        } else {
            self.refresh_from_store().await
        }
    }

    async fn refresh_from_orchestrator(&self) -> anyhow::Result<RefreshOutcome> {
        let functions = self.orchestrator.list_functions(&self.namespace).await?;
        let snapshot = TopologySnapshot::new(functions);
        snapshot.validate()?;
        let json = snapshot.to_json()?;
        self.cache.replace(snapshot);

        let stored = self.store.get(TOPOLOGY_KEY).await?;
        if stored.as_deref() == Some(json.as_str()) {
            return Ok(RefreshOutcome::Unchanged);
        }
        self.store.set(TOPOLOGY_KEY, &json).await?;
        debug!(namespace = %self.namespace, "published topology snapshot");
        Ok(RefreshOutcome::Published)
    }

    async fn refresh_from_store(&self) -> anyhow::Result<RefreshOutcome> {
        let Some(json) = self.store.get(TOPOLOGY_KEY).await? else {
            debug!("no published topology yet");
            return Ok(RefreshOutcome::Skipped);
        };
        match TopologySnapshot::from_json(&json) {
            Ok(snapshot) => {
                self.cache.replace(snapshot);
                Ok(RefreshOutcome::Pulled)
            }
            Err(e) => {
                warn!(error = %e, "published topology unreadable, keeping last snapshot");
                Ok(RefreshOutcome::Skipped)
            }
        }
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "topology sync started");

        loop {
            // Refresh before the first sleep so the proxy has a topology early.
            if let Err(e) = self.refresh().await {
                tracing::error!(error = %e, "topology refresh failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("topology sync shutting down");
                    break;
                }
            }
        }
    }
}

// ── Activity ───────────────────────────────────────────────────────

pub struct ActivitySync {
    store: Arc<dyn KeyValueStore>,
    tracker: ActivityTracker,
    cache: TopologyCache,
}

impl ActivitySync {
    pub fn new(store: Arc<dyn KeyValueStore>, tracker: ActivityTracker, cache: TopologyCache) -> Self {
        Self {
            store,
            tracker,
            cache,
        }
    }

    /// Merge every known function's timestamp; the larger side wins.
    ///
    /// A failure on one function is logged and the rest still sync.
    pub async fn sync_once(&self) -> usize {
        let mut synced = 0;
        for function in self.cache.function_names() {
            match self.sync_function(&function).await {
                Ok(()) => synced += 1,
                Err(e) => warn!(function = %function, error = %e, "activity sync failed"),
            }
        }
        synced
    }

    async fn sync_function(&self, function: &str) -> anyhow::Result<()> {
        let key = activity_key(function);
        let remote = match self.store.get(&key).await? {
            Some(raw) => match raw.parse::<u64>() {
                Ok(ts) => Some(ts),
                Err(e) => {
                    warn!(function = %function, error = %e, "stored activity unreadable, overwriting");
                    None
                }
            },
            None => None,
        };
        let local = self.tracker.last_call(function);

        match (local, remote) {
            (Some(l), Some(r)) if r > l => {
                self.tracker.record(function, r);
            }
            (None, Some(r)) => {
                self.tracker.record(function, r);
            }
            (Some(l), Some(r)) if l > r => {
                self.store.set(&key, &l.to_string()).await?;
            }
            (Some(l), None) => {
                self.store.set(&key, &l.to_string()).await?;
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "activity sync started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let synced = self.sync_once().await;
                    debug!(functions = synced, "activity synced");
                }
                _ = shutdown.changed() => {
                    info!("activity sync shutting down");
                    break;
                }
            }
        }
    }
}
