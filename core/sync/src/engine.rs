//! Sync engine that wires the queue, monitor, executor and scheduler together.

use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use outbox_common::{ActionId, ActionKind, PendingAction, Result};
use outbox_storage::{KeyValueStore, QueueStore};

use crate::background::{self, BackgroundAgent, BackgroundCoordinator};
use crate::config::SyncConfig;
use crate::executor::{DrainOutcome, SyncExecutor};
use crate::network::{ConnectivityProbe, Listener, NetworkEvent, NetworkMonitor};
use crate::remote::RemoteExecutor;
use crate::scheduler::{SyncScheduler, SyncTrigger};
use crate::status::{DrainReport, StatusPublisher, SyncStatus};

/// Entry point for callers: enqueue actions, observe status, force drains.
pub struct SyncEngine {
    config: SyncConfig,
    queue: Arc<QueueStore>,
    network: NetworkMonitor,
    status: StatusPublisher,
    executor: Arc<SyncExecutor>,
    scheduler: SyncScheduler,
    coordinator: Arc<BackgroundCoordinator>,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listeners: Mutex<Vec<Listener>>,
}

impl SyncEngine {
    /// Open an engine over `kv`.
    ///
    /// Loads the persisted queue length and last sync time into the
    /// published status and starts the scheduler, the connectivity listener
    /// and the background coordinator. When the monitor already reports
    /// connectivity and actions are waiting, a drain is triggered.
    pub async fn open(
        config: SyncConfig,
        kv: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteExecutor>,
        network: NetworkMonitor,
    ) -> Result<Self> {
        config.validate()?;

        let queue = QueueStore::new(kv);
        let pending_count = queue.len().await;
        let last_sync_time = queue.last_sync_time().await;
        let status = StatusPublisher::new(SyncStatus {
            online: network.is_online(),
            pending_count,
            last_sync_time,
            in_progress: false,
        });
        // Every queue write publishes the new length under the writer lock
        let queue = Arc::new(queue.with_len_observer(status.pending_observer()));
        info!(
            "Opened {} queue with {} pending actions",
            queue.backend(),
            pending_count
        );

        let executor = Arc::new(SyncExecutor::new(
            queue.clone(),
            remote.clone(),
            network.clone(),
            status.clone(),
        ));

        let (scheduler, handle) = SyncScheduler::new();
        let drain_executor = executor.clone();
        let scheduler_task = tokio::spawn(handle.run(move |trigger| {
            let executor = drain_executor.clone();
            async move {
                debug!("Drain triggered by {:?}", trigger);
                executor.drain().await
            }
        }));

        let listener = {
            let status = status.clone();
            let scheduler = scheduler.clone();
            network.listen(move |event| {
                let status = status.clone();
                let scheduler = scheduler.clone();
                async move {
                    match event {
                        NetworkEvent::BecameOnline => {
                            status.set_online(true);
                            scheduler.trigger(SyncTrigger::ConnectivityRestored);
                        }
                        NetworkEvent::BecameOffline => status.set_online(false),
                    }
                }
            })
        };

        let coordinator = Arc::new(BackgroundCoordinator::new(queue.clone()));
        let (link, inbox) = background::channel();
        let coordinator_task = coordinator.spawn(inbox);
        let agent = Arc::new(BackgroundAgent::new(link, remote, network.clone()));
        let windows_task =
            agent.spawn_windows(coordinator.foreground_watch(), config.background_interval());

        if network.is_online() && pending_count > 0 {
            scheduler.trigger(SyncTrigger::ConnectivityRestored);
        }

        Ok(Self {
            config,
            queue,
            network,
            status,
            executor,
            scheduler,
            coordinator,
            scheduler_task: Mutex::new(Some(scheduler_task)),
            tasks: Mutex::new(vec![coordinator_task, windows_task]),
            listeners: Mutex::new(vec![listener]),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The connectivity monitor driving this engine.
    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Persist a new action and, when online, schedule a drain.
    ///
    /// Returns once the action is stored; never waits for delivery. If the
    /// store rejects the write the error is returned, but the action stays
    /// queued in memory for the rest of the session and will still be
    /// attempted.
    pub async fn enqueue(
        &self,
        kind: ActionKind,
        target: impl Into<String>,
        payload: Value,
        method: impl Into<String>,
    ) -> Result<ActionId> {
        let action = PendingAction::new(kind, target, payload, method, self.config.max_attempts);
        let id = action.id.clone();
        debug!(
            "Enqueueing {} {} {} ({})",
            action.kind, action.method, action.target, id
        );

        let appended = self.queue.append(action).await;
        if let Err(e) = &appended {
            warn!("Failed to persist action {}: {}", id, e);
        }

        if self.config.drain_on_enqueue && self.network.is_online() {
            self.scheduler.trigger(SyncTrigger::Enqueued);
        }

        appended.map(|_| id)
    }

    /// Drain now, unless a drain is already running.
    ///
    /// Calling this while a drain is in flight returns
    /// `DrainOutcome::Skipped(SkipReason::InProgress)` without touching the
    /// queue.
    pub async fn force_sync(&self) -> DrainOutcome {
        self.executor.drain().await
    }

    /// Queue a drain behind any scheduled one and wait for it.
    pub async fn request_sync(&self) -> Result<DrainOutcome> {
        self.scheduler.request_sync().await
    }

    /// Discard every pending action.
    pub async fn clear_pending(&self) -> Result<()> {
        let cleared = self.queue.clear().await;
        match &cleared {
            Ok(()) => info!("Cleared pending actions"),
            Err(e) => warn!("Failed to clear pending actions: {}", e),
        }
        cleared
    }

    /// Snapshot of the queue in FIFO order.
    pub async fn pending(&self) -> Vec<PendingAction> {
        self.queue.list_all().await
    }

    /// Latest published status.
    pub fn status(&self) -> SyncStatus {
        self.status.current()
    }

    /// Observe status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Observe completed drains.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<DrainReport> {
        self.status.subscribe_reports()
    }

    /// Whether the queue is only held in memory after a store failure.
    pub fn is_degraded(&self) -> bool {
        self.queue.is_degraded()
    }

    /// Feed a connectivity reading from the host.
    pub fn set_online(&self, online: bool) {
        self.status.set_online(online);
        self.network.set_online(online);
    }

    /// Poll `probe` for connectivity for as long as the engine lives.
    pub fn attach_probe(&self, probe: Arc<dyn ConnectivityProbe>) {
        info!("Probing connectivity via {}", probe.name());
        let listener = self.network.spawn_probe(probe, self.config.probe_interval());
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// The foreground session went inactive.
    pub fn suspend(&self) {
        self.coordinator.suspend();
    }

    /// The foreground session is active again.
    pub fn resume(&self) {
        self.coordinator.resume();
    }

    /// Stop all engine tasks. Persisted state is left as is.
    ///
    /// Triggers already queued are drained first; a drain in flight is
    /// allowed to finish.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        let scheduler_task = self
            .scheduler_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = scheduler_task {
            if let Err(e) = task.await {
                warn!("Scheduler task ended abnormally: {}", e);
            }
        }

        let listeners = std::mem::take(&mut *self.listeners.lock().unwrap_or_else(|e| e.into_inner()));
        for listener in listeners {
            listener.cancel();
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        info!("Sync engine stopped");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(task) = self
            .scheduler_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
