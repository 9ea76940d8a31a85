use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::connectivity::{ConnectivityMonitor, ConnectivitySource, ConnectivityState};
use super::status::{Status, UnavailableReason};
use crate::llm::InferenceEngine;
use crate::models::{
    ArtifactDownloader, DownloadError, InferError, InitError, ModelLifecycle, ModelState,
};

pub const DEFAULT_STARTUP_POLL_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("local model unavailable: {0}")]
    Unavailable(UnavailableReason),
    #[error("Prompt is required.")]
    EmptyPrompt,
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(transparent)]
    Inference(InferError),
    #[error("orchestrator has shut down")]
    ShutDown,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Where the model artifact lives once downloaded.
    pub artifact_path: PathBuf,
    /// Poll the host once if no connectivity report arrives within this window.
    pub startup_poll_delay: Duration,
    /// Load an already present artifact on `start`.
    pub auto_initialize: bool,
}

impl OrchestratorConfig {
    pub fn new(artifact_path: impl Into<PathBuf>) -> Self {
        Self {
            artifact_path: artifact_path.into(),
            startup_poll_delay: DEFAULT_STARTUP_POLL_DELAY,
            auto_initialize: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn Fn(Status) + Send>;

enum Update {
    /// Arms the startup connectivity poll.
    Started,
    Connectivity(ConnectivityState),
    Model(ModelState),
    DownloadStarted,
    DownloadProgress(u8),
    DownloadFinished,
    Subscribe(SubscriptionId, Listener),
    Unsubscribe(SubscriptionId),
    Shutdown,
}

/// Combines connectivity, model and download state into one `Status` and
/// routes requests to the component that owns them.
///
/// Every source reports into a single channel drained by one worker thread,
/// so listeners see one ordered stream and each recomputation reads all
/// three inputs together.
pub struct AvailabilityOrchestrator {
    monitor: Arc<ConnectivityMonitor>,
    downloader: ArtifactDownloader,
    lifecycle: Arc<ModelLifecycle>,
    config: OrchestratorConfig,
    updates: Sender<Update>,
    status: Arc<RwLock<Status>>,
    next_subscription: AtomicU64,
    started: AtomicBool,
    shut_down: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AvailabilityOrchestrator {
    pub fn new(
        connectivity: Arc<dyn ConnectivitySource>,
        downloader: ArtifactDownloader,
        engine: Arc<dyn InferenceEngine>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let monitor = Arc::new(ConnectivityMonitor::new(connectivity));
        let lifecycle = Arc::new(ModelLifecycle::new(engine));
        let (updates, rx) = unbounded();
        let status = Arc::new(RwLock::new(Status::default()));

        let model_tx = updates.clone();
        lifecycle.observe(Box::new(move |state| {
            let _ = model_tx.send(Update::Model(state));
        }));

        let worker = {
            let status = status.clone();
            let monitor = monitor.clone();
            let poll_after = config.startup_poll_delay;
            thread::Builder::new()
                .name("availability-fold".into())
                .spawn(move || fold_updates(rx, status, monitor, poll_after))
                .context("spawn availability worker")?
        };

        Ok(Self {
            monitor,
            downloader,
            lifecycle,
            config,
            updates,
            status,
            next_subscription: AtomicU64::new(1),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Starts listening to connectivity and, when configured, loads an
    /// artifact left by a previous session on a background thread.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let tx = self.updates.clone();
        self.monitor.start(move |state| {
            let _ = tx.send(Update::Connectivity(state));
        });
        let _ = self.updates.send(Update::Started);

        if !self.config.auto_initialize || !self.artifact_present() {
            return;
        }
        let lifecycle = self.lifecycle.clone();
        let path = self.config.artifact_path.clone();
        info!("found model artifact at {}, initializing", path.display());
        let spawned = thread::Builder::new()
            .name("model-restore".into())
            .spawn(move || {
                if let Err(err) = lifecycle.initialize(&path) {
                    warn!("restoring model from {} failed: {err}", path.display());
                }
            });
        if let Err(err) = spawned {
            error!("failed to start model restore thread: {err:?}");
        }
    }

    /// Registers `listener`. It receives the current status first, then
    /// every distinct status after it, in order, from the worker thread.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(Status) + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        if self
            .updates
            .send(Update::Subscribe(id, Box::new(listener)))
            .is_err()
        {
            debug!("subscription {id:?} registered after shutdown");
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.updates.send(Update::Unsubscribe(id));
    }

    /// Latest published status.
    pub fn status(&self) -> Status {
        *self.status.read()
    }

    pub fn model_state(&self) -> ModelState {
        self.lifecycle.state()
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.monitor.last_published()
    }

    pub fn artifact_path(&self) -> &Path {
        &self.config.artifact_path
    }

    pub fn artifact_present(&self) -> bool {
        self.config.artifact_path.is_file()
    }

    pub fn request_download(&self, url: &str) -> Result<PathBuf, OrchestratorError> {
        self.request_download_with_progress(url, |_| {})
    }

    /// Downloads the model artifact to the configured path, blocking until
    /// the transfer settles. Concurrent requests share one transfer.
    pub fn request_download_with_progress<F>(
        &self,
        url: &str,
        progress: F,
    ) -> Result<PathBuf, OrchestratorError>
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let _ = self.updates.send(Update::DownloadStarted);
        let tx = self.updates.clone();
        let outcome = self
            .downloader
            .download(url, &self.config.artifact_path, move |percent| {
                let _ = tx.send(Update::DownloadProgress(percent));
                progress(percent);
            });
        let _ = self.updates.send(Update::DownloadFinished);
        Ok(outcome?)
    }

    pub fn request_initialize(&self, path: &Path) -> Result<(), OrchestratorError> {
        self.ensure_running()?;
        Ok(self.lifecycle.initialize(path)?)
    }

    pub fn request_initialize_default(&self) -> Result<(), OrchestratorError> {
        self.request_initialize(&self.config.artifact_path)
    }

    /// Runs `prompt` on the local model. Refused with a reason unless the
    /// model is `Ready`; connectivity alone never makes it available.
    pub fn request_generate(&self, prompt: &str) -> Result<String, OrchestratorError> {
        self.ensure_running()?;
        if prompt.trim().is_empty() {
            return Err(OrchestratorError::EmptyPrompt);
        }
        if let Some(reason) = self.current_inputs().unavailable_reason() {
            return Err(OrchestratorError::Unavailable(reason));
        }
        self.lifecycle.generate(prompt).map_err(|err| match err {
            // released between the check and the call
            InferError::NotReady => OrchestratorError::Unavailable(
                self.current_inputs()
                    .unavailable_reason()
                    .unwrap_or(UnavailableReason::ModelNotInitialized),
            ),
            other => OrchestratorError::Inference(other),
        })
    }

    /// Releases the model and stops the worker. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down availability orchestrator");
        self.lifecycle.release();
        let _ = self.updates.send(Update::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("availability worker panicked");
            }
        }
    }

    fn ensure_running(&self) -> Result<(), OrchestratorError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShutDown);
        }
        Ok(())
    }

    /// Status built straight from the sources rather than the published one.
    fn current_inputs(&self) -> Status {
        Status::compose(
            self.monitor.last_published(),
            self.lifecycle.state(),
            None,
        )
    }
}

impl Drop for AvailabilityOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Inputs {
    connectivity: ConnectivityState,
    model_state: ModelState,
    download_progress: Option<u8>,
    /// Download requests that have not returned yet.
    active_downloads: usize,
}

impl Inputs {
    fn status(&self) -> Status {
        Status::compose(self.connectivity, self.model_state, self.download_progress)
    }
}

fn fold_updates(
    rx: Receiver<Update>,
    status: Arc<RwLock<Status>>,
    monitor: Arc<ConnectivityMonitor>,
    poll_after: Duration,
) {
    let mut inputs = Inputs {
        connectivity: ConnectivityState::Unknown,
        model_state: ModelState::Unloaded,
        download_progress: None,
        active_downloads: 0,
    };
    let mut listeners: Vec<(SubscriptionId, Listener)> = Vec::new();
    let mut heard_connectivity = false;
    let mut poll_deadline: Option<Instant> = None;

    loop {
        let update = match poll_deadline {
            Some(deadline) => match rx.recv_deadline(deadline) {
                Ok(update) => update,
                Err(RecvTimeoutError::Timeout) => {
                    poll_deadline = None;
                    if monitor.last_published() == ConnectivityState::Unknown {
                        debug!("no connectivity report after {poll_after:?}, polling host");
                        monitor.poll();
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(update) => update,
                Err(_) => break,
            },
        };

        match update {
            Update::Started => {
                if !heard_connectivity {
                    poll_deadline = Some(Instant::now() + poll_after);
                }
                continue;
            }
            Update::Connectivity(state) => {
                heard_connectivity = true;
                poll_deadline = None;
                inputs.connectivity = state;
            }
            Update::Model(state) => inputs.model_state = state,
            Update::DownloadStarted => {
                inputs.active_downloads += 1;
                continue;
            }
            Update::DownloadProgress(percent) => inputs.download_progress = Some(percent),
            // an older request settling must not clear a newer transfer's progress
            Update::DownloadFinished => {
                inputs.active_downloads = inputs.active_downloads.saturating_sub(1);
                if inputs.active_downloads == 0 {
                    inputs.download_progress = None;
                }
            }
            Update::Subscribe(id, listener) => {
                notify(id, &listener, *status.read());
                listeners.push((id, listener));
                continue;
            }
            Update::Unsubscribe(id) => {
                listeners.retain(|(existing, _)| *existing != id);
                continue;
            }
            Update::Shutdown => break,
        }

        let next = inputs.status();
        {
            let mut current = status.write();
            if *current == next {
                continue;
            }
            *current = next;
        }
        debug!("status -> {}", next.label());
        for (id, listener) in &listeners {
            notify(*id, listener, next);
        }
    }
    debug!("availability worker stopped");
}

fn notify(id: SubscriptionId, listener: &Listener, status: Status) {
    if catch_unwind(AssertUnwindSafe(|| listener(status))).is_err() {
        warn!("status listener {id:?} panicked");
    }
}
