use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use reqwest::blocking::Client;
use tracing::{debug, warn};

use super::connectivity::{
    ConnectivitySource, HostNotification, NetworkCapabilities, NotificationSink,
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Connectivity source for desktop hosts without a push API: an HTTP request
/// to `url` stands in for the OS notion of a validated network. Any response
/// means the network has internet; a 2xx response means it is validated
/// (a captive portal usually answers with a redirect instead).
pub struct HttpProbe {
    shared: Arc<ProbeShared>,
    interval: Duration,
    stop: RwLock<Option<Sender<()>>>,
}

struct ProbeShared {
    client: Client,
    url: String,
    latest: RwLock<Option<Option<NetworkCapabilities>>>,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, interval: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("create probe http client")?;
        Ok(Self {
            shared: Arc::new(ProbeShared {
                client,
                url: url.into(),
                latest: RwLock::new(None),
            }),
            interval,
            stop: RwLock::new(None),
        })
    }
}

impl ProbeShared {
    fn probe(&self) -> Option<NetworkCapabilities> {
        match self.client.head(&self.url).send() {
            Ok(response) => Some(NetworkCapabilities {
                has_internet: true,
                validated: response.status().is_success(),
            }),
            Err(err) => {
                debug!("connectivity probe to {} failed: {err}", self.url);
                None
            }
        }
    }

    /// Probes and returns the notification describing any change.
    fn refresh(&self) -> Option<HostNotification> {
        let current = self.probe();
        let previous = self.latest.write().replace(current);
        if previous == Some(current) {
            return None;
        }
        Some(match current {
            Some(caps) => HostNotification::CapabilitiesChanged(caps),
            None => HostNotification::Lost,
        })
    }
}

impl ConnectivitySource for HttpProbe {
    fn active_network(&self) -> Option<NetworkCapabilities> {
        if let Some(latest) = *self.shared.latest.read() {
            return latest;
        }
        self.shared.probe()
    }

    fn register(&self, sink: NotificationSink) {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        if let Some(previous) = self.stop.write().replace(stop_tx) {
            let _ = previous.send(());
        }
        let shared = self.shared.clone();
        let interval = self.interval;
        let spawned = thread::Builder::new()
            .name("connectivity-probe".into())
            .spawn(move || loop {
                if let Some(notification) = shared.refresh() {
                    sink(notification);
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            });
        if let Err(error) = spawned {
            warn!("failed to start connectivity probe thread: {error:?}");
        }
    }
}

impl Drop for HttpProbe {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.write().take() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_probe_reports_no_network() {
        // nothing listens on the local discard port
        let probe = HttpProbe::new("http://127.0.0.1:9/", Duration::from_secs(60)).unwrap();
        assert_eq!(probe.active_network(), None);
        assert_eq!(probe.shared.refresh(), Some(HostNotification::Lost));
        assert_eq!(probe.shared.refresh(), None);
    }
}
