//! StateStore — redb-backed key-value store and function queues.
//!
//! Implements the [`KeyValueStore`] and [`FunctionQueue`] contracts over a
//! single redb database. Each operation runs in its own transaction, so a
//! dequeue removes items and advances the head cursor atomically. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing and single-node runs without a data directory).
//!
//! The async contracts run each transaction on tokio's blocking pool so
//! commits never stall a runtime worker.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::kv::KeyValueStore;
use crate::queue::FunctionQueue;
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(KEY_VALUES).map_err(map_err!(Table))?;
        txn.open_table(QUEUE_ITEMS).map_err(map_err!(Table))?;
        txn.open_table(QUEUE_CURSORS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Key/value ──────────────────────────────────────────────────

    pub fn get_value(&self, key: &str) -> StateResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KEY_VALUES).map_err(map_err!(Table))?;
        let value = table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_string());
        Ok(value)
    }

    pub fn put_value(&self, key: &str, value: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(KEY_VALUES).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Queues ─────────────────────────────────────────────────────

    pub fn push_item(&self, function: &str, payload: &[u8]) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let sequence;
        {
            let mut cursors = txn.open_table(QUEUE_CURSORS).map_err(map_err!(Table))?;
            let tail_key = tail_key(function);
            sequence = cursors
                .get(tail_key.as_str())
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);

            let mut items = txn.open_table(QUEUE_ITEMS).map_err(map_err!(Table))?;
            items
                .insert(item_key(function, sequence).as_str(), payload)
                .map_err(map_err!(Write))?;
            cursors
                .insert(tail_key.as_str(), sequence + 1)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%function, sequence, "queue item stored");
        Ok(sequence)
    }

    pub fn pop_items(&self, function: &str, max: usize) -> StateResult<Vec<Vec<u8>>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut popped = Vec::new();
        {
            let mut cursors = txn.open_table(QUEUE_CURSORS).map_err(map_err!(Table))?;
            let head_key = head_key(function);
            let head = cursors
                .get(head_key.as_str())
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);
            let tail = cursors
                .get(tail_key(function).as_str())
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);

            let end = tail.min(head.saturating_add(max as u64));
            let mut items = txn.open_table(QUEUE_ITEMS).map_err(map_err!(Table))?;
            for sequence in head..end {
                if let Some(guard) = items
                    .remove(item_key(function, sequence).as_str())
                    .map_err(map_err!(Write))?
                {
                    popped.push(guard.value().to_vec());
                }
            }
            if end > head {
                cursors
                    .insert(head_key.as_str(), end)
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(popped)
    }

    pub fn queue_len(&self, function: &str) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let cursors = txn.open_table(QUEUE_CURSORS).map_err(map_err!(Table))?;
        let head = cursors
            .get(head_key(function).as_str())
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);
        let tail = cursors
            .get(tail_key(function).as_str())
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);
        Ok(tail.saturating_sub(head))
    }
}

impl StateStore {
    /// Run a store operation on the blocking pool; redb commits are
    /// synchronous and fsync on disk.
    async fn blocking<T, F>(&self, op: F) -> StateResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&StateStore) -> StateResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(map_err!(Task))?
    }
}

#[async_trait]
impl KeyValueStore for StateStore {
    async fn get(&self, key: &str) -> StateResult<Option<String>> {
        let key = key.to_string();
        self.blocking(move |store| store.get_value(&key)).await
    }

    async fn set(&self, key: &str, value: &str) -> StateResult<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.blocking(move |store| store.put_value(&key, &value)).await
    }
}

#[async_trait]
impl FunctionQueue for StateStore {
    async fn enqueue(&self, function: &str, payload: &str) -> StateResult<()> {
        let (function, payload) = (function.to_string(), payload.to_string());
        self.blocking(move |store| store.push_item(&function, payload.as_bytes()).map(|_| ()))
            .await
    }

    async fn dequeue_up_to(&self, function: &str, max: usize) -> StateResult<Vec<String>> {
        let function = function.to_string();
        self.blocking(move |store| store.pop_items(&function, max))
            .await?
            .into_iter()
            .map(|bytes| String::from_utf8(bytes).map_err(map_err!(Deserialize)))
            .collect()
    }

    async fn count(&self, function: &str) -> StateResult<u64> {
        let function = function.to_string();
        self.blocking(move |store| store.queue_len(&function)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Key/value ──────────────────────────────────────────────────

    #[test]
    fn value_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_value("napgrid:leader", "{}").unwrap();
        assert_eq!(store.get_value("napgrid:leader").unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn value_get_missing_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_value("nope").unwrap().is_none());
    }

    #[test]
    fn value_overwrite() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_value("k", "1").unwrap();
        store.put_value("k", "2").unwrap();
        assert_eq!(store.get_value("k").unwrap().as_deref(), Some("2"));
    }

    // ── Queues ─────────────────────────────────────────────────────

    #[test]
    fn queue_is_fifo() {
        let store = StateStore::open_in_memory().unwrap();
        for payload in [b"a", b"b", b"c"] {
            store.push_item("fib", payload).unwrap();
        }

        assert_eq!(store.pop_items("fib", 2).unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(store.pop_items("fib", 5).unwrap(), vec![b"c".to_vec()]);
        assert!(store.pop_items("fib", 5).unwrap().is_empty());
    }

    #[test]
    fn queues_are_isolated_per_function() {
        let store = StateStore::open_in_memory().unwrap();
        store.push_item("a", b"1").unwrap();
        store.push_item("b", b"2").unwrap();
        store.push_item("b", b"3").unwrap();

        assert_eq!(store.queue_len("a").unwrap(), 1);
        assert_eq!(store.queue_len("b").unwrap(), 2);
        assert_eq!(store.pop_items("a", 10).unwrap(), vec![b"1".to_vec()]);
        assert_eq!(store.queue_len("b").unwrap(), 2);
    }

    #[test]
    fn queue_len_tracks_push_and_pop() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.queue_len("fib").unwrap(), 0);
        store.push_item("fib", b"x").unwrap();
        store.push_item("fib", b"y").unwrap();
        assert_eq!(store.queue_len("fib").unwrap(), 2);
        store.pop_items("fib", 1).unwrap();
        assert_eq!(store.queue_len("fib").unwrap(), 1);
    }

    #[test]
    fn pop_zero_is_a_no_op() {
        let store = StateStore::open_in_memory().unwrap();
        store.push_item("fib", b"x").unwrap();
        assert!(store.pop_items("fib", 0).unwrap().is_empty());
        assert_eq!(store.queue_len("fib").unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_enqueues_all_land() {
        let store = StateStore::open_in_memory().unwrap();
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..32 {
            let store = store.clone();
            tasks.spawn(async move { store.enqueue("fib", &format!("{i}")).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        assert_eq!(FunctionQueue::count(&store, "fib").await.unwrap(), 32);
        let mut items = store.dequeue_up_to("fib", 64).await.unwrap();
        items.sort_by_key(|s| s.parse::<u32>().unwrap());
        assert_eq!(items, (0..32).map(|i| i.to_string()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn trait_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        FunctionQueue::enqueue(&store, "fib", "{\"n\":1}").await.unwrap();
        assert_eq!(FunctionQueue::count(&store, "fib").await.unwrap(), 1);
        let items = store.dequeue_up_to("fib", 1).await.unwrap();
        assert_eq!(items, vec!["{\"n\":1}".to_string()]);

        KeyValueStore::set(&store, "k", "v").await.unwrap();
        assert_eq!(KeyValueStore::get(&store, "k").await.unwrap().as_deref(), Some("v"));
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_value("topology:deployments", "{\"functions\":[]}").unwrap();
            store.push_item("fib", b"queued").unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_value("topology:deployments").unwrap().is_some());
        assert_eq!(store.pop_items("fib", 1).unwrap(), vec![b"queued".to_vec()]);
    }
}
