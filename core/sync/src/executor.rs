//! Queue draining.
//!
//! A drain takes a snapshot of the queue, executes every action in FIFO
//! order, one at a time, and then writes the outcomes back in a single
//! read-modify-write of the whole collection.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use outbox_common::{ActionId, PendingAction, Result};
use outbox_storage::QueueStore;

use crate::network::NetworkMonitor;
use crate::remote::RemoteExecutor;
use crate::status::{DrainReport, StatusPublisher};

/// Why a drain request did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another drain holds the guard.
    InProgress,
    /// The monitor reports no connectivity.
    Offline,
    /// Nothing is queued.
    Empty,
}

/// Result of a drain request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Skipped(SkipReason),
    Completed(DrainReport),
}

impl DrainOutcome {
    /// The report, if the drain actually ran.
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Completed(report) => Some(report),
            DrainOutcome::Skipped(_) => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, DrainOutcome::Skipped(_))
    }
}

/// Per-action outcomes to fold back into the durable queue.
///
/// Applied by id against the queue as it is at write time, so actions
/// appended by anyone else since the snapshot keep their place, and ids
/// that are already gone are ignored.
#[derive(Debug, Default, Clone)]
pub struct Outcomes {
    completed: HashSet<ActionId>,
    dropped: HashSet<ActionId>,
    retained: HashMap<ActionId, u32>,
}

impl Outcomes {
    /// Outcomes consisting only of acknowledged actions.
    pub fn completed<I: IntoIterator<Item = ActionId>>(ids: I) -> Self {
        Self {
            completed: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn mark_completed(&mut self, id: ActionId) {
        self.completed.insert(id);
    }

    pub fn mark_dropped(&mut self, id: ActionId) {
        self.dropped.insert(id);
    }

    /// Record a failed action that stays queued with `attempts` used.
    pub fn mark_retained(&mut self, id: ActionId, attempts: u32) {
        self.retained.insert(id, attempts);
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.dropped.is_empty() && self.retained.is_empty()
    }

    /// Apply to a queue snapshot. Returns how many actions were removed.
    pub fn apply(&self, actions: &mut Vec<PendingAction>) -> usize {
        let before = actions.len();
        actions.retain(|a| !self.completed.contains(&a.id) && !self.dropped.contains(&a.id));
        for action in actions.iter_mut() {
            if let Some(&attempts) = self.retained.get(&action.id) {
                action.attempts = attempts.max(action.attempts).min(action.max_attempts);
            }
        }
        before - actions.len()
    }
}

/// Fold outcomes into the durable queue. Returns the resulting queue length.
///
/// This is the only path that removes executed actions from the queue,
/// whether they ran in a foreground drain or in the background agent.
pub async fn reconcile(queue: &QueueStore, outcomes: &Outcomes) -> Result<usize> {
    queue
        .update(|actions| {
            let removed = outcomes.apply(actions);
            debug!("Reconciled queue: {} removed, {} remain", removed, actions.len());
            actions.len()
        })
        .await
}

/// Releases the drain guard when a drain ends, even by panic.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drains the queue against the remote service.
pub struct SyncExecutor {
    queue: Arc<QueueStore>,
    remote: Arc<dyn RemoteExecutor>,
    network: NetworkMonitor,
    status: StatusPublisher,
    in_progress: AtomicBool,
}

impl SyncExecutor {
    /// Create a new executor.
    pub fn new(
        queue: Arc<QueueStore>,
        remote: Arc<dyn RemoteExecutor>,
        network: NetworkMonitor,
        status: StatusPublisher,
    ) -> Self {
        Self {
            queue,
            remote,
            network,
            status,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Whether a drain is currently running.
    pub fn is_draining(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Attempt every queued action once, in order.
    ///
    /// A no-op when another drain is running, when offline, or when the
    /// queue is empty. Per-action failures never escape: they are folded
    /// into the queue and the returned report.
    pub async fn drain(&self) -> DrainOutcome {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Drain already in progress, skipping");
            return DrainOutcome::Skipped(SkipReason::InProgress);
        }
        let guard = DrainGuard(&self.in_progress);

        if !self.network.is_online() {
            debug!("Offline, skipping drain");
            return DrainOutcome::Skipped(SkipReason::Offline);
        }

        let snapshot = self.queue.list_all().await;
        if snapshot.is_empty() {
            debug!("Queue empty, skipping drain");
            return DrainOutcome::Skipped(SkipReason::Empty);
        }

        let started_at = Utc::now();
        info!("Draining {} pending actions", snapshot.len());
        self.status.start_drain();

        let mut outcomes = Outcomes::default();
        let mut succeeded = Vec::new();
        let mut retained = Vec::new();
        let mut dropped = Vec::new();

        for mut action in snapshot {
            match self.remote.execute(&action).await {
                Ok(()) => {
                    debug!("Action {} acknowledged", action.id);
                    outcomes.mark_completed(action.id.clone());
                    succeeded.push(action.id);
                }
                Err(e) => {
                    if action.record_failure() {
                        debug!(
                            "Action {} failed (attempt {}/{}): {}",
                            action.id, action.attempts, action.max_attempts, e
                        );
                        outcomes.mark_retained(action.id.clone(), action.attempts);
                        retained.push(action.id);
                    } else {
                        warn!(
                            "Dropping action {} ({} {}) after {} attempts: {}",
                            action.id, action.method, action.target, action.attempts, e
                        );
                        outcomes.mark_dropped(action.id.clone());
                        dropped.push(action.id);
                    }
                }
            }
        }

        // The queue store publishes the resulting length itself
        if let Err(e) = reconcile(&self.queue, &outcomes).await {
            error!("Failed to persist drain results: {}", e);
        }

        let finished_at = Utc::now();
        if let Err(e) = self.queue.set_last_sync_time(finished_at).await {
            error!("Failed to persist last sync time: {}", e);
        }

        let report = DrainReport {
            succeeded,
            retained,
            dropped,
            started_at,
            finished_at,
        };
        info!("Drain finished: {}", report.summary());

        self.status.finish_drain(finished_at, report.clone());
        drop(guard);
        DrainOutcome::Completed(report)
    }
}
