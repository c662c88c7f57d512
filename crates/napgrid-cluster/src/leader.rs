//! Leadership selection over a shared key-value record.
//!
//! The record holds the current holder and its last renewal time. This is
//! a soft lease, not consensus: two instances may both believe they lead
//! for up to one lease window under clock skew or a racing write. Only
//! the autoscaler and topology publication are gated on it, and both are
//! safe to repeat.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use napgrid_state::{KeyValueStore, now_ms};

/// Store key of the leadership record.
pub const LEADER_KEY: &str = "napgrid:leader";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderRecord {
    pub holder_id: String,
    pub renewed_at_ms: u64,
}

/// Read-only view of the leadership flag, shared with the gated loops.
#[derive(Clone)]
pub struct LeaderHandle {
    rx: watch::Receiver<bool>,
}

impl LeaderHandle {
    /// A handle that never changes, for single-role wiring and tests.
    pub fn fixed(is_leader: bool) -> Self {
        let (_tx, rx) = watch::channel(is_leader);
        Self { rx }
    }

    pub fn is_leader(&self) -> bool {
        *self.rx.borrow()
    }
}

pub struct LeadershipSelector {
    id: String,
    store: Arc<dyn KeyValueStore>,
    lease: Duration,
    flag: watch::Sender<bool>,
}

impl LeadershipSelector {
    pub fn new(store: Arc<dyn KeyValueStore>, lease: Duration) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), store, lease)
    }

    pub fn with_id(id: impl Into<String>, store: Arc<dyn KeyValueStore>, lease: Duration) -> Self {
        let (flag, _rx) = watch::channel(false);
        Self {
            id: id.into(),
            store,
            lease,
            flag,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> LeaderHandle {
        LeaderHandle {
            rx: self.flag.subscribe(),
        }
    }

    pub fn is_leader(&self) -> bool {
        *self.flag.borrow()
    }

    /// One round of the selection protocol.
    ///
    /// An absent (or unreadable) record is claimed and the round ends;
    /// the flag follows on the next round. Otherwise the flag is set from
    /// the record as read, and the record is rewritten when renewing a
    /// live lease or taking over an expired one.
    pub async fn check(&self) -> anyhow::Result<bool> {
        let now = now_ms();
        let record = match self.store.get(LEADER_KEY).await? {
            Some(raw) => match serde_json::from_str::<LeaderRecord>(&raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "unreadable leadership record, reclaiming");
                    None
                }
            },
            None => None,
        };

        let Some(record) = record else {
            self.claim(now).await?;
            debug!(id = %self.id, "claimed vacant leadership record");
            return Ok(self.is_leader());
        };

        let holder = record.holder_id == self.id;
        let expired = now.saturating_sub(record.renewed_at_ms) > self.lease.as_millis() as u64;

        let changed = self.flag.send_if_modified(|current| {
            if *current != holder {
                *current = holder;
                true
            } else {
                false
            }
        });
        if changed {
            if holder {
                info!(id = %self.id, "acquired leadership");
            } else {
                info!(id = %self.id, leader = %record.holder_id, "lost leadership");
            }
        }

        if (holder && !expired) || (!holder && expired) {
            self.claim(now).await?;
            if !holder {
                debug!(id = %self.id, previous = %record.holder_id, "took over expired lease");
            }
        }

        Ok(holder)
    }

    /// Startup rounds: a node that finds the record vacant claims it and
    /// raises its flag before any gated loop runs, instead of one
    /// `check_interval` later.
    pub async fn bootstrap(&self) -> anyhow::Result<bool> {
        if self.check().await? {
            return Ok(true);
        }
        self.check().await
    }

    async fn claim(&self, now: u64) -> anyhow::Result<()> {
        let record = LeaderRecord {
            holder_id: self.id.clone(),
            renewed_at_ms: now,
        };
        self.store
            .set(LEADER_KEY, &serde_json::to_string(&record)?)
            .await?;
        Ok(())
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(id = %self.id, lease_ms = self.lease.as_millis() as u64, "leadership selector started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.check().await {
                        tracing::error!(error = %e, "leadership check failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("leadership selector shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use napgrid_state::StateStore;

    fn shared_store() -> Arc<dyn KeyValueStore> {
        Arc::new(StateStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn first_check_claims_then_second_leads() {
        let store = shared_store();
        let selector = LeadershipSelector::with_id("a", store.clone(), Duration::from_secs(5));

        assert!(!selector.check().await.unwrap());
        let raw = store.get(LEADER_KEY).await.unwrap().unwrap();
        let record: LeaderRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.holder_id, "a");

        assert!(selector.check().await.unwrap());
        assert!(selector.is_leader());
    }

    #[tokio::test]
    async fn bootstrap_leads_on_vacant_record() {
        let store = shared_store();
        let selector = LeadershipSelector::with_id("a", store, Duration::from_secs(5));
        let handle = selector.handle();

        assert!(selector.bootstrap().await.unwrap());
        assert!(handle.is_leader());
    }

    #[tokio::test]
    async fn bootstrap_defers_to_live_holder() {
        let store = shared_store();
        let first = LeadershipSelector::with_id("a", store.clone(), Duration::from_secs(5));
        assert!(first.bootstrap().await.unwrap());

        let second = LeadershipSelector::with_id("b", store, Duration::from_secs(5));
        assert!(!second.bootstrap().await.unwrap());
        assert!(!second.is_leader());
    }

    #[tokio::test]
    async fn exactly_one_of_many_leads() {
        let store = shared_store();
        let selectors: Vec<_> = (0..5)
            .map(|i| {
                LeadershipSelector::with_id(format!("node-{i}"), store.clone(), Duration::from_secs(5))
            })
            .collect();

        for _ in 0..4 {
            for selector in &selectors {
                selector.check().await.unwrap();
            }
            let leaders = selectors.iter().filter(|s| s.is_leader()).count();
            assert!(leaders <= 1);
        }
        assert_eq!(selectors.iter().filter(|s| s.is_leader()).count(), 1);
    }

    #[tokio::test]
    async fn renewal_moves_the_timestamp() {
        let store = shared_store();
        let selector = LeadershipSelector::with_id("a", store.clone(), Duration::from_secs(5));
        selector.check().await.unwrap();
        let first: LeaderRecord =
            serde_json::from_str(&store.get(LEADER_KEY).await.unwrap().unwrap()).unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        selector.check().await.unwrap();
        let second: LeaderRecord =
            serde_json::from_str(&store.get(LEADER_KEY).await.unwrap().unwrap()).unwrap();
        assert!(second.renewed_at_ms > first.renewed_at_ms);
    }

    #[tokio::test]
    async fn silent_holder_is_replaced_after_lease() {
        let store = shared_store();
        let lease = Duration::from_millis(100);
        let a = LeadershipSelector::with_id("a", store.clone(), lease);
        let b = LeadershipSelector::with_id("b", store.clone(), lease);

        a.check().await.unwrap();
        assert!(a.check().await.unwrap());
        assert!(!b.check().await.unwrap());

        // `a` stops renewing.
        tokio::time::sleep(lease + Duration::from_millis(50)).await;
        assert!(!b.check().await.unwrap());
        assert!(b.check().await.unwrap());

        // The old holder sees the new record and steps down.
        assert!(!a.check().await.unwrap());
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn handle_follows_flag() {
        let store = shared_store();
        let selector = LeadershipSelector::with_id("a", store, Duration::from_secs(5));
        let handle = selector.handle();
        assert!(!handle.is_leader());

        selector.check().await.unwrap();
        selector.check().await.unwrap();
        assert!(handle.is_leader());
    }

    #[tokio::test]
    async fn garbage_record_is_reclaimed() {
        let store = shared_store();
        store.set(LEADER_KEY, "not json").await.unwrap();
        let selector = LeadershipSelector::with_id("a", store.clone(), Duration::from_secs(5));

        selector.check().await.unwrap();
        assert!(selector.check().await.unwrap());
    }

    #[test]
    fn fixed_handle() {
        assert!(LeaderHandle::fixed(true).is_leader());
        assert!(!LeaderHandle::fixed(false).is_leader());
    }
}
