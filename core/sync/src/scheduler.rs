//! Drain scheduling.
//!
//! Every automatic drain (after an enqueue, after connectivity returns)
//! goes through one scheduler task, so triggered drains never overlap.
//! Triggers that pile up while a drain runs are coalesced into the next
//! drain.

use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use outbox_common::{Error, Result};

use crate::executor::DrainOutcome;

/// Why a drain was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// An action was enqueued while online.
    Enqueued,
    /// Explicit request that waits for the result.
    Force,
    /// The network monitor reported an online transition.
    ConnectivityRestored,
    /// Stop the scheduler.
    Shutdown,
}

type Envelope = (SyncTrigger, Option<oneshot::Sender<DrainOutcome>>);

/// Sending side of the scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    trigger_tx: mpsc::Sender<Envelope>,
}

impl SyncScheduler {
    /// Create a new scheduler and the handle that runs it.
    pub fn new() -> (Self, SyncSchedulerHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel(64);
        (Self { trigger_tx }, SyncSchedulerHandle { trigger_rx })
    }

    /// Fire a trigger without waiting.
    ///
    /// Returns false if the trigger could not be queued. A full channel
    /// already holds a trigger that will drain everything, so nothing is
    /// lost in that case.
    pub fn trigger(&self, trigger: SyncTrigger) -> bool {
        match self.trigger_tx.try_send((trigger, None)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Scheduler busy, {:?} coalesced", trigger);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a drain behind any running one and wait for its outcome.
    pub async fn request_sync(&self) -> Result<DrainOutcome> {
        let (response_tx, response_rx) = oneshot::channel();

        self.trigger_tx
            .send((SyncTrigger::Force, Some(response_tx)))
            .await
            .map_err(|_| Error::Closed("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Closed("Failed to receive drain outcome".to_string()))
    }

    /// Ask the scheduler task to stop.
    pub async fn shutdown(&self) {
        let _ = self.trigger_tx.send((SyncTrigger::Shutdown, None)).await;
    }

    /// Whether the scheduler task is still accepting triggers.
    pub fn is_running(&self) -> bool {
        !self.trigger_tx.is_closed()
    }
}

/// Receiving side of the scheduler.
pub struct SyncSchedulerHandle {
    trigger_rx: mpsc::Receiver<Envelope>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop.
    ///
    /// This should be spawned in a tokio task. `drain_fn` is called once per
    /// batch of triggers and never concurrently with itself.
    pub async fn run<F, Fut>(mut self, drain_fn: F)
    where
        F: Fn(SyncTrigger) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DrainOutcome> + Send,
    {
        info!("Sync scheduler started");

        while let Some((trigger, responder)) = self.trigger_rx.recv().await {
            if trigger == SyncTrigger::Shutdown {
                break;
            }

            let mut responders: Vec<_> = responder.into_iter().collect();
            let mut shutdown = false;
            while let Ok((next, responder)) = self.trigger_rx.try_recv() {
                if next == SyncTrigger::Shutdown {
                    shutdown = true;
                    break;
                }
                responders.extend(responder);
            }

            debug!("Processing trigger {:?}", trigger);
            let outcome = drain_fn(trigger).await;
            for responder in responders {
                let _ = responder.send(outcome.clone());
            }

            if shutdown {
                break;
            }
        }

        info!("Sync scheduler stopped");
    }
}
