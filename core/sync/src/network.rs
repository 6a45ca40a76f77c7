//! Connectivity monitoring.
//!
//! The monitor does not infer connectivity from stored state: it holds
//! whatever the host last reported and turns changes into transition
//! events. Hosts feed it either directly through `set_online` or by
//! attaching a `ConnectivityProbe` that is polled on an interval.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkEvent {
    BecameOnline,
    BecameOffline,
}

impl NetworkEvent {
    fn for_state(online: bool) -> Self {
        if online {
            NetworkEvent::BecameOnline
        } else {
            NetworkEvent::BecameOffline
        }
    }
}

/// Current connectivity and when it last changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connectivity {
    pub online: bool,
    pub since: DateTime<Utc>,
}

/// Observes connectivity and fires transition events.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct NetworkMonitor {
    state: Arc<watch::Sender<Connectivity>>,
    events: broadcast::Sender<NetworkEvent>,
}

impl NetworkMonitor {
    /// Create a monitor seeded with what the host currently reports.
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(Connectivity {
            online,
            since: Utc::now(),
        });
        let (events, _) = broadcast::channel(32);
        Self {
            state: Arc::new(state),
            events,
        }
    }

    /// Whether the host currently reports connectivity.
    pub fn is_online(&self) -> bool {
        self.state.borrow().online
    }

    /// Connectivity together with the time of the last transition.
    pub fn snapshot(&self) -> Connectivity {
        *self.state.borrow()
    }

    /// How long the current state has held.
    pub fn time_in_state(&self) -> chrono::Duration {
        Utc::now() - self.snapshot().since
    }

    /// Record a connectivity reading from the host.
    ///
    /// Only actual transitions emit events; repeated readings of the same
    /// state are ignored. Returns the emitted event, if any.
    pub fn set_online(&self, online: bool) -> Option<NetworkEvent> {
        let mut offline_for = None;
        let changed = self.state.send_if_modified(|c| {
            if c.online == online {
                return false;
            }
            let now = Utc::now();
            if online {
                offline_for = Some(now - c.since);
            }
            *c = Connectivity { online, since: now };
            true
        });

        if !changed {
            return None;
        }

        let event = NetworkEvent::for_state(online);
        match offline_for {
            Some(d) => info!("Network online after {}s offline", d.num_seconds()),
            None => info!("Network offline"),
        }
        // No subscribers is fine
        let _ = self.events.send(event);
        Some(event)
    }

    /// Subscribe to transition events.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            events: self.events.subscribe(),
            state: self.state.subscribe(),
        }
    }

    /// Run `handler` for every transition until the returned listener is
    /// cancelled or dropped.
    pub fn listen<F, Fut>(&self, handler: F) -> Listener
    where
        F: Fn(NetworkEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut subscription = self.subscribe();
        let handle = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                handler(event).await;
            }
        });
        Listener { handle }
    }

    /// Poll `probe` every `interval` and feed its readings into the monitor.
    pub fn spawn_probe(&self, probe: Arc<dyn ConnectivityProbe>, interval: Duration) -> Listener {
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = probe.check().await;
                debug!("Probe {} reports online={}", probe.name(), online);
                monitor.set_online(online);
            }
        });
        Listener { handle }
    }
}

/// Receiving end of the monitor's transition events.
pub struct Subscription {
    events: broadcast::Receiver<NetworkEvent>,
    state: watch::Receiver<Connectivity>,
}

impl Subscription {
    /// Wait for the next transition.
    ///
    /// If the subscriber fell behind, missed events are collapsed into a
    /// single event describing the current state. Returns `None` once the
    /// monitor is gone.
    pub async fn next(&mut self) -> Option<NetworkEvent> {
        match self.events.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Network subscriber lagged by {} events", missed);
                Some(NetworkEvent::for_state(self.state.borrow().online))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

/// Handle to a background listener task. Dropping it cancels the task.
pub struct Listener {
    handle: JoinHandle<()>,
}

impl Listener {
    /// Stop the listener.
    pub fn cancel(self) {
        self.handle.abort();
    }

    /// Whether the listener task has stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Source of connectivity readings provided by the host environment.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Probe name for diagnostics.
    fn name(&self) -> &str;

    /// Report whether the remote service is currently reachable.
    async fn check(&self) -> bool;
}

/// Probe that treats any HTTP answer from the endpoint as connectivity.
///
/// The status code is irrelevant: a 404 still proves the network path works.
pub struct HttpProbe {
    client: reqwest::Client,
    url: url::Url,
}

impl HttpProbe {
    /// Create a probe against `url` with the given request timeout.
    pub fn new(url: url::Url, timeout: Duration) -> outbox_common::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| outbox_common::Error::Network(format!("Failed to build client: {}", e)))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    fn name(&self) -> &str {
        "http"
    }

    async fn check(&self) -> bool {
        self.client.head(self.url.clone()).send().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[test]
    fn test_initial_state_is_host_reading() {
        assert!(NetworkMonitor::new(true).is_online());
        assert!(!NetworkMonitor::new(false).is_online());
    }

    #[tokio::test]
    async fn test_only_transitions_emit_events() {
        let monitor = NetworkMonitor::new(false);
        let mut sub = monitor.subscribe();

        assert_eq!(monitor.set_online(false), None);
        assert_eq!(monitor.set_online(true), Some(NetworkEvent::BecameOnline));
        assert_eq!(monitor.set_online(true), None);
        assert_eq!(monitor.set_online(false), Some(NetworkEvent::BecameOffline));

        assert_eq!(sub.next().await, Some(NetworkEvent::BecameOnline));
        assert_eq!(sub.next().await, Some(NetworkEvent::BecameOffline));
    }

    #[tokio::test]
    async fn test_snapshot_tracks_transition_time() {
        let monitor = NetworkMonitor::new(false);
        let before = monitor.snapshot().since;

        tokio::time::sleep(Duration::from_millis(5)).await;
        monitor.set_online(true);

        let snapshot = monitor.snapshot();
        assert!(snapshot.online);
        assert!(snapshot.since > before);
    }

    #[tokio::test]
    async fn test_listener_receives_and_cancels() {
        let monitor = NetworkMonitor::new(false);
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();

        let listener = monitor.listen(move |event| {
            let count = count_clone.clone();
            async move {
                if event == NetworkEvent::BecameOnline {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        // Give the listener task a chance to start
        tokio::task::yield_now().await;
        monitor.set_online(true);
        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);

        listener.cancel();
        monitor.set_online(false);
        monitor.set_online(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    struct FlagProbe(AtomicBool);

    #[async_trait]
    impl ConnectivityProbe for FlagProbe {
        fn name(&self) -> &str {
            "flag"
        }

        async fn check(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_probe_feeds_monitor() {
        let monitor = NetworkMonitor::new(false);
        let probe = Arc::new(FlagProbe(AtomicBool::new(true)));

        let _listener = monitor.spawn_probe(probe.clone(), Duration::from_millis(5));
        for _ in 0..50 {
            if monitor.is_online() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(monitor.is_online());

        probe.0.store(false, Ordering::SeqCst);
        for _ in 0..50 {
            if !monitor.is_online() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(!monitor.is_online());
    }
}
