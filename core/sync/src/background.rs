//! Background sync coordination.
//!
//! The background agent never touches the queue directly. It asks the
//! foreground coordinator for a copy of the pending actions, executes
//! them, and reports back which ones the remote side acknowledged. The
//! coordinator folds those reports into the queue through the same
//! reconcile path a foreground drain uses, as soon as they arrive, so a
//! later window never sees an action that was already acknowledged.
//!
//! ```text
//! ┌──────────────┐  getPending         ┌─────────────────┐
//! │  Background  │────────────────────►│   Coordinator   │──► QueueStore
//! │    Agent     │◄────────────────────│  (foreground)   │
//! └──────────────┘  pending{actions}   └─────────────────┘
//!        │                                      ▲
//!        └──────── syncComplete{completedIds} ──┘
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use outbox_common::{ActionId, Error, PendingAction, Result};
use outbox_storage::QueueStore;

use crate::executor::{reconcile, Outcomes};
use crate::network::NetworkMonitor;
use crate::remote::RemoteExecutor;

/// Messages sent by the background agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentMessage {
    /// Ask for a copy of the pending queue.
    GetPending,
    /// Report actions the remote side acknowledged.
    SyncComplete {
        #[serde(rename = "completedIds")]
        completed_ids: Vec<ActionId>,
    },
}

/// Replies sent by the foreground coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoordinatorMessage {
    Pending { actions: Vec<PendingAction> },
}

type Request = (AgentMessage, oneshot::Sender<CoordinatorMessage>);

/// Agent's end of the message channel.
#[derive(Clone)]
pub struct AgentLink {
    requests: mpsc::Sender<Request>,
    notices: mpsc::UnboundedSender<AgentMessage>,
}

/// Coordinator's end of the message channel.
pub struct CoordinatorInbox {
    requests: mpsc::Receiver<Request>,
    notices: mpsc::UnboundedReceiver<AgentMessage>,
}

/// Create a connected agent/coordinator channel pair.
pub fn channel() -> (AgentLink, CoordinatorInbox) {
    let (req_tx, req_rx) = mpsc::channel(8);
    let (note_tx, note_rx) = mpsc::unbounded_channel();
    (
        AgentLink {
            requests: req_tx,
            notices: note_tx,
        },
        CoordinatorInbox {
            requests: req_rx,
            notices: note_rx,
        },
    )
}

impl AgentLink {
    /// Request the current pending queue.
    pub async fn get_pending(&self) -> Result<Vec<PendingAction>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send((AgentMessage::GetPending, reply_tx))
            .await
            .map_err(|_| Error::Closed("Coordinator not running".to_string()))?;

        let CoordinatorMessage::Pending { actions } = reply_rx
            .await
            .map_err(|_| Error::Closed("Coordinator dropped request".to_string()))?;
        Ok(actions)
    }

    /// Report acknowledged actions.
    pub fn sync_complete(&self, completed_ids: Vec<ActionId>) -> Result<()> {
        self.notices
            .send(AgentMessage::SyncComplete { completed_ids })
            .map_err(|_| Error::Closed("Coordinator not running".to_string()))
    }
}

/// Foreground side of background sync.
pub struct BackgroundCoordinator {
    queue: Arc<QueueStore>,
    foreground: Arc<watch::Sender<bool>>,
}

impl BackgroundCoordinator {
    /// Create a coordinator for a session that starts in the foreground.
    pub fn new(queue: Arc<QueueStore>) -> Self {
        let (foreground, _) = watch::channel(true);
        Self {
            queue,
            foreground: Arc::new(foreground),
        }
    }

    /// Whether the foreground session is active.
    pub fn is_foreground(&self) -> bool {
        *self.foreground.borrow()
    }

    /// Watch foreground activity.
    pub fn foreground_watch(&self) -> watch::Receiver<bool> {
        self.foreground.subscribe()
    }

    /// The foreground session went inactive; background windows may run.
    pub fn suspend(&self) {
        if self.foreground.send_replace(false) {
            info!("Session suspended, background sync enabled");
        }
    }

    /// The foreground session is active again; background windows stop.
    pub fn resume(&self) {
        if !self.foreground.send_replace(true) {
            info!("Session resumed");
        }
    }

    /// Handle one agent message.
    ///
    /// Requests get a reply; notifications return `None`. Exposed so hosts
    /// that carry messages across a process boundary can feed decoded
    /// messages in directly.
    pub async fn handle_message(&self, message: AgentMessage) -> Result<Option<CoordinatorMessage>> {
        match message {
            AgentMessage::GetPending => {
                let actions = self.queue.list_all().await;
                debug!("Handing {} pending actions to background agent", actions.len());
                Ok(Some(CoordinatorMessage::Pending { actions }))
            }
            AgentMessage::SyncComplete { completed_ids } => {
                let count = completed_ids.len();
                let pending = reconcile(&self.queue, &Outcomes::completed(completed_ids)).await?;
                info!(
                    "Background agent completed {} actions, {} still pending",
                    count, pending
                );
                Ok(None)
            }
        }
    }

    /// Serve the agent channel until both of its senders are gone.
    ///
    /// Completion notices are applied before any queued request is
    /// answered, so a snapshot never includes acknowledged actions.
    pub fn spawn(self: &Arc<Self>, inbox: CoordinatorInbox) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let CoordinatorInbox {
            mut requests,
            mut notices,
        } = inbox;

        tokio::spawn(async move {
            let mut requests_open = true;
            let mut notices_open = true;

            while requests_open || notices_open {
                tokio::select! {
                    biased;

                    notice = notices.recv(), if notices_open => match notice {
                        Some(notice) => {
                            if let Err(e) = coordinator.handle_message(notice).await {
                                warn!("Failed to apply background sync report: {}", e);
                            }
                        }
                        None => notices_open = false,
                    },
                    request = requests.recv(), if requests_open => match request {
                        Some((message, reply)) => match coordinator.handle_message(message).await {
                            Ok(Some(response)) => {
                                let _ = reply.send(response);
                            }
                            Ok(None) => {}
                            Err(e) => warn!("Background request failed: {}", e),
                        },
                        None => requests_open = false,
                    },
                }
            }
            debug!("Background coordinator stopped");
        })
    }
}

/// Background side: executes queue snapshots outside the foreground session.
pub struct BackgroundAgent {
    link: AgentLink,
    remote: Arc<dyn RemoteExecutor>,
    network: NetworkMonitor,
}

impl BackgroundAgent {
    pub fn new(link: AgentLink, remote: Arc<dyn RemoteExecutor>, network: NetworkMonitor) -> Self {
        Self {
            link,
            remote,
            network,
        }
    }

    /// Run one background execution window.
    ///
    /// Executes the snapshot in order and reports the acknowledged ids.
    /// Failures are left for a later drain and do not consume attempts.
    pub async fn run_window(&self) -> Result<Vec<ActionId>> {
        if !self.network.is_online() {
            debug!("Offline, skipping background window");
            return Ok(Vec::new());
        }

        let actions = self.link.get_pending().await?;
        if actions.is_empty() {
            return Ok(Vec::new());
        }

        info!("Background window: executing {} actions", actions.len());
        let mut completed = Vec::new();
        for action in actions {
            match self.remote.execute(&action).await {
                Ok(()) => completed.push(action.id),
                Err(e) => debug!("Background attempt for {} failed: {}", action.id, e),
            }
        }

        if !completed.is_empty() {
            self.link.sync_complete(completed.clone())?;
        }
        Ok(completed)
    }

    /// Open a window each time the session is suspended, then every
    /// `interval` for as long as it stays suspended.
    pub fn spawn_windows(
        self: Arc<Self>,
        mut foreground: watch::Receiver<bool>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if foreground.wait_for(|active| !*active).await.map(|_| ()).is_err() {
                    break;
                }

                loop {
                    if let Err(e) = self.run_window().await {
                        warn!("Background window failed: {}", e);
                    }

                    let resumed = tokio::select! {
                        _ = tokio::time::sleep(interval) => Ok(false),
                        resumed = async {
                            foreground.wait_for(|active| *active).await.map(|_| true)
                        } => resumed,
                    };
                    match resumed {
                        Ok(false) if !*foreground.borrow() => continue,
                        Ok(_) => break,
                        Err(_) => return,
                    }
                }
            }
        })
    }
}
