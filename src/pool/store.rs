//! Shared memory pool implementation

use dashmap::DashMap;
use futures::FutureExt;
use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::models::{PoolEntry, PoolError};
use crate::metrics::METRICS;
use crate::providers::{EngineEvent, EventBus};

/// Pending notifications held for the publisher before new ones are dropped
const NOTIFY_QUEUE_CAPACITY: usize = 256;

/// Cross-agent key/value store with optimistic versioning
///
/// Writers are serialized through one async mutex. Readers never take it:
/// they clone the `Arc` of the committed entry. Change notifications are
/// queued to a background publisher; writers never wait on the bus.
pub struct SharedMemoryPool {
    entries: DashMap<String, Arc<PoolEntry>>,
    write_lock: Mutex<()>,
    sequence: AtomicU64,
    events: Option<Arc<dyn EventBus>>,
    publisher: OnceCell<mpsc::Sender<EngineEvent>>,
}

impl SharedMemoryPool {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            write_lock: Mutex::new(()),
            sequence: AtomicU64::new(0),
            events: None,
            publisher: OnceCell::new(),
        }
    }

    /// Publish change notifications to `bus` after each commit
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Write `content` under `key`
    ///
    /// With `expected_version`, the write only commits if the stored version
    /// (0 for an absent key) matches; otherwise nothing changes and a
    /// [`PoolError::VersionConflict`] is returned.
    pub async fn write(
        &self,
        key: &str,
        content: impl Into<String>,
        writer_id: &str,
        expected_version: Option<u64>,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<Arc<PoolEntry>, PoolError> {
        let entry = {
            let _guard = self.write_lock.lock().await;

            let current = self.entries.get(key).map(|e| Arc::clone(e.value()));
            let actual = current.as_ref().map_or(0, |e| e.version);
            if let Some(expected) = expected_version {
                if expected != actual {
                    METRICS.pool_conflicts.inc();
                    warn!(
                        "Pool write by {} rejected: '{}' expected v{}, found v{}",
                        writer_id, key, expected, actual
                    );
                    return Err(PoolError::VersionConflict {
                        key: key.to_string(),
                        expected,
                        actual,
                    });
                }
            }

            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let metadata = metadata.unwrap_or_default();
            let entry = Arc::new(match current {
                Some(previous) => previous.successor(content.into(), writer_id, metadata, sequence),
                None => PoolEntry::first(key, content.into(), writer_id, metadata, sequence),
            });
            self.entries.insert(key.to_string(), Arc::clone(&entry));
            entry
        };

        METRICS.pool_writes.inc();
        debug!("Pool '{}' committed v{} by {}", key, entry.version, writer_id);
        self.notify(
            "pool.write",
            json!({ "key": entry.key, "version": entry.version, "writer": writer_id }),
        );

        Ok(entry)
    }

    /// Latest committed entry for `key`
    pub fn read(&self, key: &str) -> Option<Arc<PoolEntry>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Remove `key`; returns whether it existed
    pub async fn delete(&self, key: &str) -> bool {
        let removed = {
            let _guard = self.write_lock.lock().await;
            self.entries.remove(key).is_some()
        };
        if removed {
            self.notify("pool.delete", json!({ "key": key }));
        }
        removed
    }

    /// Entries (optionally under `prefix`), most recently updated first
    pub fn list_entries(&self, prefix: Option<&str>, limit: usize) -> Vec<Arc<PoolEntry>> {
        let mut entries: Vec<Arc<PoolEntry>> = self
            .entries
            .iter()
            .filter(|e| prefix.map_or(true, |p| e.key().starts_with(p)))
            .map(|e| Arc::clone(e.value()))
            .collect();

        entries.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });
        entries.truncate(limit);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue a change notification without waiting for delivery
    ///
    /// Must be called from within a tokio runtime; the publisher task is
    /// started on first use.
    fn notify(&self, topic: &str, payload: Value) {
        let Some(bus) = &self.events else {
            return;
        };
        let sender = self
            .publisher
            .get_or_init(|| spawn_publisher(Arc::clone(bus)));

        if let Err(e) = sender.try_send(EngineEvent::new(topic, payload)) {
            warn!("Pool change notification '{}' dropped: {}", topic, e);
        }
    }
}

/// Deliver queued events in commit order until the pool is dropped
fn spawn_publisher(bus: Arc<dyn EventBus>) -> mpsc::Sender<EngineEvent> {
    let (tx, mut rx) = mpsc::channel::<EngineEvent>(NOTIFY_QUEUE_CAPACITY);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let topic = event.topic.clone();
            match AssertUnwindSafe(bus.publish(event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Pool change notification '{}' not delivered: {}", topic, e),
                Err(_) => warn!("Event bus panicked publishing '{}'", topic),
            }
        }
        debug!("Pool notification publisher stopped");
    });
    tx
}

impl Default for SharedMemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};
    use tokio_test::assert_ok;

    /// Poll `done` until it holds or a second passes
    async fn eventually(done: impl Fn() -> bool) -> bool {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    #[derive(Default)]
    struct RecordingBus {
        events: StdMutex<Vec<EngineEvent>>,
    }

    #[async_trait]
    impl EventBus for RecordingBus {
        async fn publish(&self, event: EngineEvent) -> Result<(), ProviderError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct FailingBus;

    #[async_trait]
    impl EventBus for FailingBus {
        async fn publish(&self, _event: EngineEvent) -> Result<(), ProviderError> {
            Err(ProviderError::Unavailable("bus down".to_string()))
        }
    }

    struct SlowBus;

    #[async_trait]
    impl EventBus for SlowBus {
        async fn publish(&self, _event: EngineEvent) -> Result<(), ProviderError> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(())
        }
    }

    #[derive(Default)]
    struct PanickingBus {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventBus for PanickingBus {
        async fn publish(&self, _event: EngineEvent) -> Result<(), ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("bus connection poisoned");
        }
    }

    #[tokio::test]
    async fn test_optimistic_versioning_scenario() {
        let pool = SharedMemoryPool::new();

        let first = pool.write("k", "v1", "agent-a", None, None).await.unwrap();
        assert_eq!(first.version, 1);

        let second = pool.write("k", "v2", "agent-b", Some(1), None).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.content, "v2");

        let err = pool.write("k", "v3", "agent-c", Some(99), None).await.unwrap_err();
        assert_eq!(
            err,
            PoolError::VersionConflict {
                key: "k".to_string(),
                expected: 99,
                actual: 2,
            }
        );
        let stored = pool.read("k").unwrap();
        assert_eq!(stored.content, "v2");
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_sequential_writes_reach_version_n() {
        let pool = SharedMemoryPool::new();
        for i in 0..25 {
            assert_ok!(pool.write("counter", format!("{}", i), "agent", None, None).await);
        }
        assert_eq!(pool.read("counter").unwrap().version, 25);
    }

    #[tokio::test]
    async fn test_expected_version_on_missing_key() {
        let pool = SharedMemoryPool::new();
        let err = pool.write("new", "x", "a", Some(1), None).await.unwrap_err();
        assert!(matches!(err, PoolError::VersionConflict { actual: 0, .. }));
        assert!(pool.read("new").is_none());

        assert_ok!(pool.write("new", "x", "a", Some(0), None).await);
    }

    #[tokio::test]
    async fn test_overwrite_preserves_creator_and_merges_metadata() {
        let pool = SharedMemoryPool::new();
        let mut meta = HashMap::new();
        meta.insert("topic".to_string(), json!("build"));
        pool.write("notes", "a", "agent-a", None, Some(meta)).await.unwrap();

        let mut meta = HashMap::new();
        meta.insert("reviewed".to_string(), json!(true));
        let entry = pool.write("notes", "b", "agent-b", None, Some(meta)).await.unwrap();

        assert_eq!(entry.created_by, "agent-a");
        assert_eq!(entry.updated_by, "agent-b");
        assert_eq!(entry.metadata["topic"], "build");
        assert_eq!(entry.metadata["reviewed"], true);
    }

    #[tokio::test]
    async fn test_readers_keep_old_snapshot() {
        let pool = SharedMemoryPool::new();
        pool.write("k", "old", "a", None, None).await.unwrap();
        let held = pool.read("k").unwrap();
        pool.write("k", "new", "b", None, None).await.unwrap();

        assert_eq!(held.content, "old");
        assert_eq!(pool.read("k").unwrap().content, "new");
    }

    #[tokio::test]
    async fn test_delete() {
        let pool = SharedMemoryPool::new();
        pool.write("k", "v", "a", None, None).await.unwrap();
        assert!(pool.delete("k").await);
        assert!(!pool.delete("k").await);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_list_entries_order_prefix_and_limit() {
        let pool = SharedMemoryPool::new();
        pool.write("task/1", "a", "x", None, None).await.unwrap();
        pool.write("task/2", "b", "x", None, None).await.unwrap();
        pool.write("other", "c", "x", None, None).await.unwrap();
        pool.write("task/1", "a2", "x", None, None).await.unwrap();

        let keys: Vec<_> = pool
            .list_entries(Some("task/"), 10)
            .iter()
            .map(|e| e.key.clone())
            .collect();
        assert_eq!(keys, vec!["task/1", "task/2"]);
        assert_eq!(pool.list_entries(None, 2).len(), 2);
        assert_eq!(pool.list_entries(None, 2)[0].key, "task/1");
    }

    #[tokio::test]
    async fn test_concurrent_writers_are_serialized() {
        let pool = Arc::new(SharedMemoryPool::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.write("shared", format!("writer {}", i), &format!("agent-{}", i), None, None)
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(pool.read("shared").unwrap().version, 16);
    }

    #[tokio::test]
    async fn test_events_published_after_commit() {
        let bus = Arc::new(RecordingBus::default());
        let pool = SharedMemoryPool::new().with_event_bus(bus.clone());
        pool.write("k", "v", "a", None, None).await.unwrap();
        pool.write("k", "v", "a", Some(7), None).await.unwrap_err();
        pool.delete("k").await;

        assert!(eventually(|| bus.events.lock().unwrap().len() == 2).await);
        let events = bus.events.lock().unwrap();
        let topics: Vec<_> = events.iter().map(|e| e.topic.as_str()).collect();
        assert_eq!(topics, vec!["pool.write", "pool.delete"]);
        assert_eq!(events[0].payload["version"], 1);
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_fail_write() {
        let pool = SharedMemoryPool::new().with_event_bus(Arc::new(FailingBus));
        let entry = pool.write("k", "v", "a", None, None).await.unwrap();
        assert_eq!(entry.version, 1);
    }

    #[tokio::test]
    async fn test_slow_bus_does_not_delay_writers() {
        let pool = SharedMemoryPool::new().with_event_bus(Arc::new(SlowBus));
        let started = Instant::now();
        for i in 0..3 {
            pool.write("k", format!("v{}", i), "a", None, None).await.unwrap();
        }
        assert!(pool.delete("k").await);
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "writers waited {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_panicking_bus_does_not_fail_write() {
        let bus = Arc::new(PanickingBus::default());
        let pool = SharedMemoryPool::new().with_event_bus(bus.clone());

        let first = pool.write("k", "v1", "a", None, None).await.unwrap();
        assert_eq!(first.version, 1);
        let second = pool.write("k", "v2", "a", Some(1), None).await.unwrap();
        assert_eq!(second.version, 2);

        // the publisher survives the first panic and delivers the second event
        assert!(eventually(|| bus.calls.load(Ordering::SeqCst) == 2).await);
        assert_eq!(pool.read("k").unwrap().version, 2);
    }
}
