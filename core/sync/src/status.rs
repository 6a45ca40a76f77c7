//! Observable sync status and drain reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use outbox_common::ActionId;

/// Aggregate view of the engine exposed to UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Current connectivity signal.
    pub online: bool,
    /// Current queue length.
    pub pending_count: usize,
    /// When the last drain pass completed, successful or not.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Whether a drain is currently executing.
    pub in_progress: bool,
}

/// Outcome of one completed drain pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Actions the remote side acknowledged; removed from the queue.
    pub succeeded: Vec<ActionId>,
    /// Actions that failed but have attempts left.
    pub retained: Vec<ActionId>,
    /// Actions that failed on their last allowed attempt and were discarded.
    pub dropped: Vec<ActionId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DrainReport {
    /// Number of actions attempted in the pass.
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.retained.len() + self.dropped.len()
    }

    /// Short human-readable summary, e.g. "3 actions synced".
    pub fn summary(&self) -> String {
        let mut parts = vec![format!(
            "{} action{} synced",
            self.succeeded.len(),
            if self.succeeded.len() == 1 { "" } else { "s" }
        )];
        if !self.retained.is_empty() {
            parts.push(format!("{} will retry", self.retained.len()));
        }
        if !self.dropped.is_empty() {
            parts.push(format!("{} dropped", self.dropped.len()));
        }
        parts.join(", ")
    }
}

/// Publishes `SyncStatus` to any number of observers.
///
/// Backed by a watch channel: observers only ever see the latest value.
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct StatusPublisher {
    status: Arc<watch::Sender<SyncStatus>>,
    reports: broadcast::Sender<DrainReport>,
}

impl StatusPublisher {
    /// Create a publisher seeded with an initial status.
    pub fn new(initial: SyncStatus) -> Self {
        let (status, _) = watch::channel(initial);
        let (reports, _) = broadcast::channel(16);
        Self {
            status: Arc::new(status),
            reports,
        }
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Subscribe to aggregate drain reports.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<DrainReport> {
        self.reports.subscribe()
    }

    /// Latest published status.
    pub fn current(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.modify(|s| s.online = online);
    }

    pub(crate) fn set_pending(&self, pending_count: usize) {
        self.modify(|s| s.pending_count = pending_count);
    }

    /// Queue length observer feeding `pending_count`.
    ///
    /// Installed on the queue store so the count is published from inside
    /// each write; nothing else sets it, so it never goes stale.
    pub(crate) fn pending_observer(&self) -> impl Fn(usize) + Send + Sync + 'static {
        let publisher = self.clone();
        move |pending_count| publisher.set_pending(pending_count)
    }

    pub(crate) fn start_drain(&self) {
        self.modify(|s| s.in_progress = true);
    }

    /// Publish the end of a drain pass.
    pub(crate) fn finish_drain(&self, last_sync_time: DateTime<Utc>, report: DrainReport) {
        self.modify(|s| {
            s.in_progress = false;
            s.last_sync_time = Some(last_sync_time);
        });
        // No subscribers is fine
        let _ = self.reports.send(report);
    }

    fn modify(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.status.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            let changed = *status != before;
            if changed {
                debug!(
                    "Status: online={} pending={} in_progress={}",
                    status.online, status.pending_count, status.in_progress
                );
            }
            changed
        });
    }
}
