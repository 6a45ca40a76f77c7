//! Durable queue of pending actions.
//!
//! The whole ordered collection is stored as one JSON array under a single
//! key and is always rewritten in full. There is no per-record update API:
//! every mutation is a read-modify-write of the entire list, serialized by
//! an async mutex so that only one writer touches the collection at a time.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::store::KeyValueStore;
use outbox_common::{Error, PendingAction, Result};

/// Key holding the ordered action list.
pub const PENDING_ACTIONS_KEY: &str = "outbox.pending_actions";
/// Key holding the last completed drain timestamp (RFC 3339).
pub const LAST_SYNC_KEY: &str = "outbox.last_sync";

/// In-memory view of the queue backing the durable copy.
#[derive(Default)]
struct Shadow {
    /// Set once a durable write fails; authoritative until a write succeeds.
    actions: Option<Vec<PendingAction>>,
    /// Last list read from or written to the backend.
    last_known: Vec<PendingAction>,
    last_sync: Option<DateTime<Utc>>,
}

/// Ordered, durable collection of pending actions.
///
/// Reads fail closed: an unavailable or corrupted backend yields an empty
/// queue instead of an error. Writes surface their errors, and the list
/// they tried to persist is kept in memory for the rest of the session so
/// that queued work is not lost while the backend is down.
pub struct QueueStore {
    kv: Arc<dyn KeyValueStore>,
    write_lock: tokio::sync::Mutex<()>,
    shadow: Mutex<Shadow>,
    on_len: Option<LenObserver>,
}

/// Callback receiving the queue length after every write.
pub type LenObserver = Box<dyn Fn(usize) + Send + Sync>;

impl QueueStore {
    /// Create a queue over the given key-value backend.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            write_lock: tokio::sync::Mutex::new(()),
            shadow: Mutex::new(Shadow::default()),
            on_len: None,
        }
    }

    /// Report the queue length after every write, successful or not.
    ///
    /// The observer runs while the writer lock is held, so successive
    /// calls always arrive in write order and the last one matches the
    /// queue as it stands.
    pub fn with_len_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_len = Some(Box::new(observer));
        self
    }

    /// Name of the underlying backend.
    pub fn backend(&self) -> &str {
        self.kv.name()
    }

    /// Whether a failed write has pushed the queue into memory-only mode.
    pub fn is_degraded(&self) -> bool {
        self.shadow
            .lock()
            .map(|s| s.actions.is_some())
            .unwrap_or(true)
    }

    /// Read every queued action in enqueue order.
    ///
    /// Never fails: backend errors and undecodable data are logged and
    /// treated as an empty queue.
    pub async fn list_all(&self) -> Vec<PendingAction> {
        self.load().await.unwrap_or_else(|e| {
            warn!("Queue store unavailable, treating as empty: {}", e);
            Vec::new()
        })
    }

    /// Number of queued actions.
    pub async fn len(&self) -> usize {
        self.list_all().await.len()
    }

    /// Whether the queue holds no actions.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Append an action at the tail of the queue.
    ///
    /// Returns the new queue length.
    pub async fn append(&self, action: PendingAction) -> Result<usize> {
        self.update(move |actions| {
            actions.push(action);
            actions.len()
        })
        .await
    }

    /// Replace the whole queue with `actions`.
    pub async fn replace_all(&self, actions: Vec<PendingAction>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(actions).await
    }

    /// Remove every queued action.
    pub async fn clear(&self) -> Result<()> {
        self.replace_all(Vec::new()).await
    }

    /// Read-modify-write the whole queue under the writer lock.
    ///
    /// `f` sees the current list in order and may mutate it freely; the
    /// result is persisted as one unit.
    pub async fn update<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Vec<PendingAction>) -> R,
    {
        let _guard = self.write_lock.lock().await;
        let mut actions = match self.load().await {
            Ok(actions) => actions,
            Err(e) => {
                warn!("Queue store unreadable, updating last known queue: {}", e);
                self.shadow
                    .lock()
                    .map(|s| s.last_known.clone())
                    .unwrap_or_default()
            }
        };
        let result = f(&mut actions);
        self.write(actions).await?;
        Ok(result)
    }

    /// Timestamp of the last completed drain, if any.
    ///
    /// A missing or corrupted record reads as `None`; it never affects the
    /// action list.
    pub async fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        let cached = self.shadow.lock().ok().and_then(|s| s.last_sync);
        if cached.is_some() {
            return cached;
        }

        match self.kv.get(LAST_SYNC_KEY).await {
            Ok(Some(raw)) => match DateTime::parse_from_rfc3339(raw.trim()) {
                Ok(ts) => Some(ts.with_timezone(&Utc)),
                Err(e) => {
                    warn!("Last sync timestamp is corrupted, ignoring: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Could not read last sync timestamp: {}", e);
                None
            }
        }
    }

    /// Persist the last completed drain timestamp.
    pub async fn set_last_sync_time(&self, ts: DateTime<Utc>) -> Result<()> {
        match self.kv.put(LAST_SYNC_KEY, ts.to_rfc3339()).await {
            Ok(()) => {
                if let Ok(mut shadow) = self.shadow.lock() {
                    shadow.last_sync = None;
                }
                Ok(())
            }
            Err(e) => {
                error!("Failed to persist last sync time, keeping it in memory: {}", e);
                if let Ok(mut shadow) = self.shadow.lock() {
                    shadow.last_sync = Some(ts);
                }
                Err(e)
            }
        }
    }

    fn notify_len(&self, count: usize) {
        if let Some(observer) = &self.on_len {
            observer(count);
        }
    }

    fn shadow_actions(&self) -> Option<Vec<PendingAction>> {
        self.shadow.lock().ok().and_then(|s| s.actions.clone())
    }

    /// Read the queue, preferring the in-memory shadow while degraded.
    ///
    /// Corrupted data decodes as an empty queue; only backend errors are
    /// returned.
    async fn load(&self) -> Result<Vec<PendingAction>> {
        if let Some(actions) = self.shadow_actions() {
            return Ok(actions);
        }

        let actions = match self.kv.get(PENDING_ACTIONS_KEY).await? {
            Some(json) => match serde_json::from_str::<Vec<PendingAction>>(&json) {
                Ok(actions) => actions,
                Err(e) => {
                    warn!("Pending action list is corrupted, treating as empty: {}", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if let Ok(mut shadow) = self.shadow.lock() {
            shadow.last_known = actions.clone();
        }
        Ok(actions)
    }

    /// Persist a full snapshot. Caller must hold the writer lock.
    async fn write(&self, actions: Vec<PendingAction>) -> Result<()> {
        let json = serde_json::to_string(&actions)?;
        let count = actions.len();

        match self.kv.put(PENDING_ACTIONS_KEY, json).await {
            Ok(()) => {
                let mut shadow = self
                    .shadow
                    .lock()
                    .map_err(|_| Error::Storage("queue shadow lock poisoned".to_string()))?;
                if shadow.actions.take().is_some() {
                    info!("Queue store recovered, {} actions persisted", count);
                }
                shadow.last_known = actions;
                drop(shadow);
                debug!("Persisted {} pending actions", count);
                self.notify_len(count);
                Ok(())
            }
            Err(e) => {
                error!(
                    "Failed to persist {} pending actions, queue is memory-only for this session: {}",
                    count, e
                );
                if let Ok(mut shadow) = self.shadow.lock() {
                    shadow.actions = Some(actions);
                }
                self.notify_len(count);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::FileStore;
    use crate::memory::MemoryStore;
    use outbox_common::ActionKind;
    use serde_json::json;
    use tempfile::TempDir;

    fn action(target: &str) -> PendingAction {
        PendingAction::new(ActionKind::Create, target, json!({"t": target}), "POST", 3)
    }

    fn memory_queue() -> (MemoryStore, QueueStore) {
        let kv = MemoryStore::new();
        let queue = QueueStore::new(Arc::new(kv.clone()));
        (kv, queue)
    }

    #[tokio::test]
    async fn test_append_preserves_order() {
        let (_kv, queue) = memory_queue();

        assert_eq!(queue.append(action("/a")).await.unwrap(), 1);
        assert_eq!(queue.append(action("/b")).await.unwrap(), 2);
        assert_eq!(queue.append(action("/c")).await.unwrap(), 3);

        let targets: Vec<_> = queue
            .list_all()
            .await
            .into_iter()
            .map(|a| a.target)
            .collect();
        assert_eq!(targets, vec!["/a", "/b", "/c"]);
    }

    #[tokio::test]
    async fn test_replace_all_and_clear() {
        let (_kv, queue) = memory_queue();
        queue.append(action("/a")).await.unwrap();
        queue.append(action("/b")).await.unwrap();

        let replacement = vec![action("/z")];
        queue.replace_all(replacement.clone()).await.unwrap();
        assert_eq!(queue.list_all().await, replacement);

        queue.clear().await.unwrap();
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_fails_closed_on_corruption() {
        let (kv, queue) = memory_queue();
        kv.put(PENDING_ACTIONS_KEY, "not json".to_string())
            .await
            .unwrap();

        assert!(queue.list_all().await.is_empty());
        assert!(!queue.is_degraded());
    }

    #[tokio::test]
    async fn test_list_fails_closed_when_unavailable() {
        let (kv, queue) = memory_queue();
        queue.append(action("/a")).await.unwrap();

        kv.set_available(false);
        assert!(queue.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_is_surfaced_and_kept_in_memory() {
        let (kv, queue) = memory_queue();
        queue.append(action("/a")).await.unwrap();

        kv.set_available(false);
        let err = queue.append(action("/b")).await;
        assert!(matches!(err, Err(Error::Storage(_))));
        assert!(queue.is_degraded());

        // The session keeps working from memory
        let pending = queue.list_all().await;
        assert_eq!(pending.len(), 2);

        // A later successful write flushes the shadow to the backend
        kv.set_available(true);
        queue.append(action("/c")).await.unwrap();
        assert!(!queue.is_degraded());

        let reopened = QueueStore::new(Arc::new(kv.clone()));
        assert_eq!(reopened.len().await, 3);
    }

    #[tokio::test]
    async fn test_update_returns_closure_result() {
        let (_kv, queue) = memory_queue();
        queue.append(action("/a")).await.unwrap();
        queue.append(action("/b")).await.unwrap();

        let removed = queue
            .update(|actions| {
                let before = actions.len();
                actions.retain(|a| a.target != "/a");
                before - actions.len()
            })
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert_eq!(queue.list_all().await[0].target, "/b");
    }

    #[tokio::test]
    async fn test_last_sync_time_roundtrip() {
        let (_kv, queue) = memory_queue();
        assert!(queue.last_sync_time().await.is_none());

        let now = Utc::now();
        queue.set_last_sync_time(now).await.unwrap();
        let stored = queue.last_sync_time().await.unwrap();
        assert_eq!(stored.timestamp_millis(), now.timestamp_millis());
    }

    #[tokio::test]
    async fn test_records_are_independent() {
        let (kv, queue) = memory_queue();
        queue.append(action("/a")).await.unwrap();
        kv.put(LAST_SYNC_KEY, "yesterday-ish".to_string())
            .await
            .unwrap();

        assert!(queue.last_sync_time().await.is_none());
        assert_eq!(queue.len().await, 1);

        kv.put(PENDING_ACTIONS_KEY, "{broken".to_string())
            .await
            .unwrap();
        queue.set_last_sync_time(Utc::now()).await.unwrap();
        assert!(queue.last_sync_time().await.is_some());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_queue_persists_across_restart() {
        let temp = TempDir::new().unwrap();

        let first = action("/profiles/1");
        {
            let queue = QueueStore::new(Arc::new(FileStore::new(temp.path()).unwrap()));
            queue.append(first.clone()).await.unwrap();
            queue.append(action("/profiles/2")).await.unwrap();
        }

        let queue = QueueStore::new(Arc::new(FileStore::new(temp.path()).unwrap()));
        let pending = queue.list_all().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0], first);
        assert_eq!(queue.backend(), "file");
    }

    #[tokio::test]
    async fn test_len_observer_tracks_every_write() {
        let kv = MemoryStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let queue = QueueStore::new(Arc::new(kv.clone()))
            .with_len_observer(move |len| sink.lock().unwrap().push(len));

        queue.append(action("/a")).await.unwrap();
        queue.append(action("/b")).await.unwrap();
        queue.update(|actions| actions.remove(0)).await.unwrap();

        // Failed writes report the length the session now holds in memory
        kv.set_available(false);
        assert!(queue.append(action("/c")).await.is_err());
        assert!(queue.clear().await.is_err());

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 1, 2, 0]);
        assert_eq!(queue.len().await, 0);
    }
}
