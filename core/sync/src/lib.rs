//! Outbox Sync Engine
//!
//! Offline-first delivery of user mutations:
//! - Durable FIFO queue of pending actions with bounded retries
//! - Connectivity monitoring that triggers drains on reconnect
//! - Serialized drains with whole-queue reconciliation by id
//! - Observable status and drain reports
//! - Background execution windows while the session is suspended

pub mod background;
pub mod config;
pub mod engine;
pub mod executor;
pub mod network;
pub mod remote;
pub mod scheduler;
pub mod status;

#[cfg(test)]
mod test_helpers;

// Re-export main types
pub use background::{AgentLink, AgentMessage, BackgroundAgent, BackgroundCoordinator, CoordinatorMessage};
pub use config::{StoreKind, SyncConfig};
pub use engine::SyncEngine;
pub use executor::{reconcile, DrainOutcome, Outcomes, SkipReason, SyncExecutor};
pub use network::{Connectivity, ConnectivityProbe, HttpProbe, Listener, NetworkEvent, NetworkMonitor};
pub use remote::{HttpRemote, RemoteExecutor, IDEMPOTENCY_HEADER};
pub use scheduler::{SyncScheduler, SyncSchedulerHandle, SyncTrigger};
pub use status::{DrainReport, StatusPublisher, SyncStatus};
