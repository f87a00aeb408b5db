//! Network state monitor.
//!
//! The monitor is the single writer of the process-wide connectivity flag.
//! It never works out connectivity on its own: a platform adapter (such as
//! [`TcpProbe`]) reports what the platform signal says via
//! [`NetworkMonitor::observe`], and the monitor turns those reports into
//! transitions.

use crate::error::{Result, SyncError};
use reqwest::Url;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TRANSITION_BUFFER: usize = 64;

/// Current connectivity as last reported by the platform signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
    pub is_online: bool,
}

/// A change in connectivity. Never emitted for an unchanged state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub was_online: bool,
    pub is_online: bool,
}

impl Transition {
    pub fn came_online(&self) -> bool {
        !self.was_online && self.is_online
    }
}

/// Observes connectivity and fans out transitions to subscribers
#[derive(Clone)]
pub struct NetworkMonitor {
    state: Arc<watch::Sender<bool>>,
    transitions: broadcast::Sender<Transition>,
}

/// Live listener registration. Dropping it unsubscribes.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl NetworkMonitor {
    /// Start from the state the platform signal reports at startup
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        info!(online = initially_online, "Network monitor started");
        Self {
            state: Arc::new(state),
            transitions,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    pub fn state(&self) -> ConnectivityState {
        ConnectivityState {
            is_online: self.is_online(),
        }
    }

    /// Record what the platform signal currently says.
    ///
    /// Returns the transition if the state changed.
    pub fn observe(&self, is_online: bool) -> Option<Transition> {
        let mut was_online = is_online;
        let changed = self.state.send_if_modified(|current| {
            if *current == is_online {
                return false;
            }
            was_online = *current;
            *current = is_online;
            true
        });

        if !changed {
            return None;
        }

        let transition = Transition { was_online, is_online };
        if is_online {
            info!("Network: online");
        } else {
            warn!("Network: offline");
        }
        // No subscribers is fine
        let _ = self.transitions.send(transition);
        Some(transition)
    }

    /// Receive every future transition
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    /// Call `listener` for every future transition until the subscription is dropped.
    ///
    /// The listener runs on the current tokio runtime; without one this
    /// fails with `SyncError::NoRuntime`.
    pub fn on_change<F>(&self, listener: F) -> Result<Subscription>
    where
        F: Fn(Transition) + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime("a connectivity listener"))?;
        let mut rx = self.subscribe();
        let task = runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(transition) => listener(transition),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Connectivity listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription { task })
    }

    /// Resolve once the monitor reports online
    pub async fn wait_online(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as self, so this can't fail
        let _ = rx.wait_for(|online| *online).await;
    }
}

/// Connectivity signal for native processes: can we open a TCP connection
/// to the task server?
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    /// Probe the host and port of a server URL; the port defaults by scheme
    pub fn for_url(url: &str, timeout: Duration) -> Option<Self> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str().filter(|host| !host.is_empty())?;
        let port = parsed.port_or_known_default()?;
        Some(Self::new(format!("{}:{}", host, port), timeout))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn sample(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(self.addr.as_str())).await,
            Ok(Ok(_))
        )
    }
}

/// Feed probe samples into the monitor every `interval`, on the current runtime
pub fn spawn_probe(monitor: NetworkMonitor, probe: TcpProbe, interval: Duration) -> Result<JoinHandle<()>> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime("the connectivity probe"))?;
    Ok(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let online = probe.sample().await;
            debug!(addr = probe.addr(), online, "Connectivity probe");
            monitor.observe(online);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[test]
    fn test_observe_emits_only_on_change() {
        let monitor = NetworkMonitor::new(false);

        assert_eq!(monitor.observe(false), None);
        assert_eq!(
            monitor.observe(true),
            Some(Transition {
                was_online: false,
                is_online: true
            })
        );
        assert_eq!(monitor.observe(true), None);
        assert!(monitor.is_online());
        assert!(monitor.observe(false).is_some());
        assert!(!monitor.state().is_online);
    }

    #[tokio::test]
    async fn test_subscribers_see_each_transition_once() {
        let monitor = NetworkMonitor::new(true);
        let mut rx = monitor.subscribe();

        monitor.observe(true);
        monitor.observe(false);
        monitor.observe(false);
        monitor.observe(true);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(!first.is_online);
        assert!(second.came_online());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_on_change_stops_after_unsubscribe() {
        let monitor = NetworkMonitor::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sub = {
            let seen = Arc::clone(&seen);
            monitor.on_change(move |t| seen.lock().unwrap().push(t.is_online)).unwrap()
        };

        monitor.observe(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        sub.unsubscribe();

        monitor.observe(false);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_wait_online_resolves_on_transition() {
        let monitor = NetworkMonitor::new(false);
        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.wait_online().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        monitor.observe(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_probe_address_from_url() {
        let t = Duration::from_secs(1);
        assert_eq!(TcpProbe::for_url("https://erp.example.com/app", t).unwrap().addr(), "erp.example.com:443");
        assert_eq!(TcpProbe::for_url("http://localhost:8000", t).unwrap().addr(), "localhost:8000");
        assert_eq!(TcpProbe::for_url("http://erp.local", t).unwrap().addr(), "erp.local:80");
        assert_eq!(TcpProbe::for_url("https://user:pw@erp.example.com:8443/x", t).unwrap().addr(), "erp.example.com:8443");
        assert_eq!(TcpProbe::for_url("http://[::1]:8000", t).unwrap().addr(), "[::1]:8000");
        assert!(TcpProbe::for_url("not a url", t).is_none());
        assert!(TcpProbe::for_url("mailto:ops@example.com", t).is_none());
        // No default port for an unknown scheme
        assert!(TcpProbe::for_url("erp://erp.local", t).is_none());
    }

    #[test]
    fn test_listeners_need_a_runtime() {
        let monitor = NetworkMonitor::new(true);
        assert!(matches!(monitor.on_change(|_| {}), Err(SyncError::NoRuntime(_))));

        let probe = TcpProbe::new("127.0.0.1:9", Duration::from_millis(10));
        assert!(matches!(
            spawn_probe(monitor, probe, Duration::from_secs(1)),
            Err(SyncError::NoRuntime(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_probe_reports_reachability() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let monitor = NetworkMonitor::new(false);
        let probe = TcpProbe::new(listener.local_addr().unwrap().to_string(), Duration::from_secs(1));

        let task = spawn_probe(monitor.clone(), probe, Duration::from_millis(20)).unwrap();
        tokio::time::timeout(Duration::from_secs(2), monitor.wait_online())
            .await
            .unwrap();
        task.abort();
    }

    #[tokio::test]
    async fn test_probe_samples_reachability() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let probe = TcpProbe::new(addr.to_string(), Duration::from_secs(1));
        assert!(probe.sample().await);

        drop(listener);
        assert!(!probe.sample().await);
    }
}
