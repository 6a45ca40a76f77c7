//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use url::Url;

use outbox_common::{Error, Result};

/// Which key-value backend holds the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Process memory; nothing survives a restart.
    Memory,
    /// One file per key under the data directory.
    File,
    /// Single SQLite database under the data directory.
    #[default]
    Sqlite,
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delivery attempts before an action is dropped.
    pub max_attempts: u32,
    /// Start a drain right after an enqueue while online.
    pub drain_on_enqueue: bool,
    /// Seconds between background execution windows while suspended.
    pub background_interval_secs: u64,
    /// Seconds between connectivity probes.
    pub probe_interval_secs: u64,
    /// Base URL action targets are resolved against.
    pub endpoint: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Queue backend.
    pub store: StoreKind,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            drain_on_enqueue: true,
            background_interval_secs: 900,
            probe_interval_secs: 30,
            endpoint: "http://localhost:8080/".to_string(),
            request_timeout_secs: 15,
            store: StoreKind::Sqlite,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults; fields absent from the file keep
    /// their default values.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config: Self = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the attempt ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the remote endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the queue backend.
    pub fn with_store(mut self, store: StoreKind) -> Self {
        self.store = store;
        self
    }

    /// Enable or disable draining on enqueue.
    pub fn with_drain_on_enqueue(mut self, drain: bool) -> Self {
        self.drain_on_enqueue = drain;
        self
    }

    /// Check the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if self.background_interval_secs == 0 {
            return Err(Error::Config(
                "background_interval_secs must be positive".to_string(),
            ));
        }
        if self.probe_interval_secs == 0 {
            return Err(Error::Config("probe_interval_secs must be positive".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request_timeout_secs must be positive".to_string()));
        }
        self.endpoint_url()?;
        Ok(())
    }

    /// Parsed endpoint.
    ///
    /// A trailing slash is added so relative targets resolve beneath the
    /// endpoint path instead of replacing its last segment.
    pub fn endpoint_url(&self) -> Result<Url> {
        let mut endpoint = self.endpoint.trim().to_string();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        Url::parse(&endpoint)
            .map_err(|e| Error::Config(format!("Invalid endpoint '{}': {}", self.endpoint, e)))
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_secs(self.background_interval_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
