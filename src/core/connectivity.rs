use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ConnectivityState {
    #[default]
    Unknown,
    Offline,
    Online,
}

impl ConnectivityState {
    #[must_use]
    pub fn is_online(self) -> bool {
        self == ConnectivityState::Online
    }
}

/// Raw capability snapshot reported by the host for one network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkCapabilities {
    pub has_internet: bool,
    pub validated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostNotification {
    Available(NetworkCapabilities),
    Lost,
    CapabilitiesChanged(NetworkCapabilities),
}

pub type NotificationSink = Arc<dyn Fn(HostNotification) + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(ConnectivityState) + Send + Sync>;

/// The host's connectivity subsystem, seen from the monitor.
pub trait ConnectivitySource: Send + Sync {
    /// Capabilities of the currently active network, `None` when there is none.
    fn active_network(&self) -> Option<NetworkCapabilities>;

    /// Starts delivering notifications to `sink`.
    fn register(&self, sink: NotificationSink);
}

/// Both internet and validated are required to call a network online.
#[must_use]
pub fn classify(active: Option<NetworkCapabilities>) -> ConnectivityState {
    match active {
        Some(caps) if caps.has_internet && caps.validated => ConnectivityState::Online,
        _ => ConnectivityState::Offline,
    }
}

/// Normalizes host notifications into a de-duplicated `ConnectivityState`.
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    source: Arc<dyn ConnectivitySource>,
    last: Mutex<ConnectivityState>,
    callback: RwLock<Option<StateCallback>>,
}

impl ConnectivityMonitor {
    pub fn new(source: Arc<dyn ConnectivitySource>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                source,
                last: Mutex::new(ConnectivityState::Unknown),
                callback: RwLock::new(None),
            }),
        }
    }

    pub fn start<F>(&self, callback: F)
    where
        F: Fn(ConnectivityState) + Send + Sync + 'static,
    {
        let callback: StateCallback = Arc::new(callback);
        {
            // a state published before start still reaches the new callback
            let last = self.inner.last.lock();
            *self.inner.callback.write() = Some(callback.clone());
            if *last != ConnectivityState::Unknown {
                callback(*last);
            }
        }
        let weak: Weak<MonitorInner> = Arc::downgrade(&self.inner);
        self.inner.source.register(Arc::new(move |notification| {
            if let Some(inner) = weak.upgrade() {
                inner.on_notification(notification);
            }
        }));
        debug!("connectivity monitor registered with host source");
    }

    /// Freshly computed state from the host's active network.
    pub fn current_state(&self) -> ConnectivityState {
        classify(self.inner.source.active_network())
    }

    /// Last value handed to the callback.
    pub fn last_published(&self) -> ConnectivityState {
        *self.inner.last.lock()
    }

    /// Computes the current state and publishes it if it changed.
    pub fn poll(&self) -> ConnectivityState {
        let state = self.current_state();
        self.inner.publish(state);
        state
    }
}

impl MonitorInner {
    fn on_notification(&self, notification: HostNotification) {
        let state = match notification {
            HostNotification::Available(caps) | HostNotification::CapabilitiesChanged(caps) => {
                classify(Some(caps))
            }
            // another network may still be up
            HostNotification::Lost => classify(self.source.active_network()),
        };
        debug!("host connectivity notification {notification:?} -> {state:?}");
        self.publish(state);
    }

    // The callback runs under `last` so concurrent notifications cannot
    // reorder or duplicate what subscribers see.
    fn publish(&self, state: ConnectivityState) -> bool {
        let mut last = self.last.lock();
        if *last == state {
            return false;
        }
        info!("connectivity changed {:?} -> {:?}", *last, state);
        *last = state;
        if let Some(callback) = self.callback.read().as_ref() {
            callback(state);
        }
        true
    }
}

/// Push adapter for hosts that forward their own connectivity callbacks,
/// such as a mobile shell calling in through FFI.
#[derive(Default)]
pub struct HostConnectivity {
    active: RwLock<Option<NetworkCapabilities>>,
    sinks: RwLock<Vec<NotificationSink>>,
}

impl HostConnectivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active_network(&self, caps: Option<NetworkCapabilities>) {
        *self.active.write() = caps;
    }

    /// Records the notification's effect on the active network and forwards it.
    pub fn notify(&self, notification: HostNotification) {
        match notification {
            HostNotification::Available(caps) | HostNotification::CapabilitiesChanged(caps) => {
                self.set_active_network(Some(caps));
            }
            HostNotification::Lost => self.set_active_network(None),
        }
        let sinks = self.sinks.read().clone();
        for sink in sinks {
            sink(notification);
        }
    }
}

impl ConnectivitySource for HostConnectivity {
    fn active_network(&self) -> Option<NetworkCapabilities> {
        *self.active.read()
    }

    fn register(&self, sink: NotificationSink) {
        self.sinks.write().push(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALIDATED: NetworkCapabilities = NetworkCapabilities {
        has_internet: true,
        validated: true,
    };
    const CAPTIVE: NetworkCapabilities = NetworkCapabilities {
        has_internet: true,
        validated: false,
    };

    type Recorded = Arc<Mutex<Vec<ConnectivityState>>>;

    fn recording_monitor() -> (Arc<HostConnectivity>, ConnectivityMonitor, Recorded) {
        let host = Arc::new(HostConnectivity::new());
        let monitor = ConnectivityMonitor::new(host.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor.start(move |state| sink.lock().push(state));
        (host, monitor, seen)
    }

    #[test]
    fn online_requires_internet_and_validation() {
        assert_eq!(classify(Some(VALIDATED)), ConnectivityState::Online);
        assert_eq!(classify(Some(CAPTIVE)), ConnectivityState::Offline);
        assert_eq!(
            classify(Some(NetworkCapabilities {
                has_internet: false,
                validated: true,
            })),
            ConnectivityState::Offline
        );
        assert_eq!(classify(None), ConnectivityState::Offline);
    }

    #[test]
    fn never_emits_the_same_state_twice_in_a_row() {
        let (host, _monitor, seen) = recording_monitor();
        let notifications = [
            HostNotification::Available(VALIDATED),
            HostNotification::CapabilitiesChanged(VALIDATED),
            HostNotification::Available(VALIDATED),
            HostNotification::CapabilitiesChanged(CAPTIVE),
            HostNotification::Lost,
            HostNotification::Lost,
            HostNotification::Available(CAPTIVE),
            HostNotification::CapabilitiesChanged(VALIDATED),
        ];
        for notification in notifications {
            host.notify(notification);
        }

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                ConnectivityState::Online,
                ConnectivityState::Offline,
                ConnectivityState::Online,
            ]
        );
        assert!(seen.windows(2).all(|pair| pair[0] != pair[1]));
    }

    #[test]
    fn poll_publishes_only_on_change() {
        let (host, monitor, seen) = recording_monitor();
        assert_eq!(monitor.last_published(), ConnectivityState::Unknown);

        assert_eq!(monitor.poll(), ConnectivityState::Offline);
        assert_eq!(monitor.poll(), ConnectivityState::Offline);
        host.set_active_network(Some(VALIDATED));
        assert_eq!(monitor.poll(), ConnectivityState::Online);

        assert_eq!(
            *seen.lock(),
            vec![ConnectivityState::Offline, ConnectivityState::Online]
        );
    }

    #[test]
    fn start_replays_a_state_published_earlier() {
        let host = Arc::new(HostConnectivity::new());
        let monitor = ConnectivityMonitor::new(host.clone());
        assert_eq!(monitor.poll(), ConnectivityState::Offline);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor.start(move |state| sink.lock().push(state));
        host.notify(HostNotification::Lost);
        host.notify(HostNotification::Available(VALIDATED));

        assert_eq!(
            *seen.lock(),
            vec![ConnectivityState::Offline, ConnectivityState::Online]
        );
    }

    #[test]
    fn current_state_reads_the_active_network() {
        let host = Arc::new(HostConnectivity::new());
        let monitor = ConnectivityMonitor::new(host.clone());
        assert_eq!(monitor.current_state(), ConnectivityState::Offline);
        host.set_active_network(Some(VALIDATED));
        assert_eq!(monitor.current_state(), ConnectivityState::Online);
        // nothing published without start/poll
        assert_eq!(monitor.last_published(), ConnectivityState::Unknown);
    }
}
