//! Shared test helpers for sync module tests.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use outbox_common::{ActionId, ActionKind, Error, PendingAction, Result};
use outbox_storage::{KeyValueStore, MemoryStore, QueueStore};

use crate::remote::RemoteExecutor;
use crate::status::StatusPublisher;

/// Remote that records every call and fails on demand.
#[derive(Default)]
pub struct ScriptedRemote {
    calls: Mutex<Vec<PendingAction>>,
    fail_all: AtomicBool,
    fail_targets: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn fail_target(&self, target: &str) {
        self.fail_targets.lock().unwrap().insert(target.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Block every call until a permit is added to the returned semaphore.
    pub fn hold_calls(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<PendingAction> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called_targets(&self) -> Vec<String> {
        self.calls().into_iter().map(|a| a.target).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedRemote {
    async fn execute(&self, action: &PendingAction) -> Result<()> {
        self.calls.lock().unwrap().push(action.clone());

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| Error::Network("gate closed".to_string()))?;
            permit.forget();
        }

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fails = self.fail_all.load(Ordering::SeqCst)
            || self.fail_targets.lock().unwrap().contains(&action.target);
        if fails {
            Err(Error::Network(format!("scripted failure for {}", action.target)))
        } else {
            Ok(())
        }
    }
}

/// Create a test action targeting `target`.
pub fn make_action(target: &str, max_attempts: u32) -> PendingAction {
    PendingAction::new(
        ActionKind::Update,
        target,
        json!({ "target": target }),
        "PATCH",
        max_attempts,
    )
}

/// Memory-backed queue plus a handle to its backend.
pub fn memory_queue() -> (MemoryStore, Arc<QueueStore>) {
    let kv = MemoryStore::new();
    let queue = Arc::new(QueueStore::new(Arc::new(kv.clone())));
    (kv, queue)
}

/// Memory-backed queue whose length feeds `status`.
pub fn observed_queue(status: &StatusPublisher) -> (MemoryStore, Arc<QueueStore>) {
    let kv = MemoryStore::new();
    let queue = QueueStore::new(Arc::new(kv.clone())).with_len_observer(status.pending_observer());
    (kv, Arc::new(queue))
}

pub fn ids(actions: &[PendingAction]) -> Vec<ActionId> {
    actions.iter().map(|a| a.id.clone()).collect()
}

/// Poll `cond` until it holds or a second has passed.
pub async fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Memory store whose writes to one key stall for a while.
pub struct StallingStore {
    inner: MemoryStore,
    key: String,
    delay: Duration,
    stalled: AtomicBool,
}

impl StallingStore {
    pub fn new(inner: MemoryStore, key: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner,
            key: key.to_string(),
            delay,
            stalled: AtomicBool::new(false),
        })
    }

    /// Whether a write to the stalling key has started.
    pub fn has_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyValueStore for StallingStore {
    fn name(&self) -> &str {
        "stalling"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        if key == self.key {
            self.stalled.store(true, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
        }
        self.inner.put(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key).await
    }
}
