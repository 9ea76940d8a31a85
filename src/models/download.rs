use std::{
    collections::HashMap,
    ffi::OsString,
    fs::{self, File},
    io::{self, Read, Write},
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{
    metadata::{checksum_matches, compute_sha256},
    source::{ByteSource, RemoteStream},
};

pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;
const STAGING_SUFFIX: &str = ".part";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("remote returned status {0}")]
    RemoteFailure(u16),
    #[error("download i/o failure: {0}")]
    IoFailure(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    IntegrityFailure { expected: String, actual: String },
}

impl DownloadError {
    fn io(action: &str, err: impl std::fmt::Display) -> Self {
        DownloadError::IoFailure(format!("{action}: {err}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DownloadState {
    Idle,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSnapshot {
    pub url: String,
    pub destination: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    pub bytes_transferred: u64,
    pub state: DownloadState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub observers: usize,
}

impl DownloadSnapshot {
    #[must_use]
    pub fn percent(&self) -> Option<u8> {
        self.total_bytes
            .map(|total| percent_of(self.bytes_transferred, total))
    }
}

pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

struct DownloadTask {
    inner: Mutex<TaskInner>,
    settled: Condvar,
}

struct TaskInner {
    url: String,
    destination: PathBuf,
    total: Option<u64>,
    transferred: u64,
    state: DownloadState,
    last_error: Option<DownloadError>,
    last_percent: Option<u8>,
    observers: Vec<ProgressCallback>,
    outcome: Option<Result<PathBuf, DownloadError>>,
}

impl DownloadTask {
    fn new(url: &str, destination: &Path, observer: ProgressCallback) -> Self {
        Self {
            inner: Mutex::new(TaskInner {
                url: url.to_string(),
                destination: destination.to_path_buf(),
                total: None,
                transferred: 0,
                state: DownloadState::Idle,
                last_error: None,
                last_percent: None,
                observers: vec![observer],
                outcome: None,
            }),
            settled: Condvar::new(),
        }
    }

    // Observers run under the task lock so a late joiner never sees an older
    // percentage after a newer one.
    fn attach(&self, observer: ProgressCallback) {
        let mut inner = self.inner.lock();
        if let Some(percent) = inner.last_percent {
            notify(&observer, percent);
        }
        inner.observers.push(observer);
    }

    fn begin(&self, total: Option<u64>) {
        let mut inner = self.inner.lock();
        inner.state = DownloadState::InProgress;
        inner.total = total;
    }

    fn report(&self, transferred: u64) {
        let mut inner = self.inner.lock();
        inner.transferred = transferred;
        let Some(total) = inner.total else {
            return;
        };
        let percent = percent_of(transferred, total);
        inner.last_percent = Some(percent);
        for observer in &inner.observers {
            notify(observer, percent);
        }
    }

    fn finish(&self, outcome: Result<PathBuf, DownloadError>) {
        let mut inner = self.inner.lock();
        match &outcome {
            Ok(_) => inner.state = DownloadState::Completed,
            Err(err) => {
                inner.state = DownloadState::Failed;
                inner.last_error = Some(err.clone());
            }
        }
        inner.outcome = Some(outcome);
        self.settled.notify_all();
    }

    fn wait(&self) -> Result<PathBuf, DownloadError> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(outcome) = inner.outcome.clone() {
                return outcome;
            }
            self.settled.wait(&mut inner);
        }
    }

    fn snapshot(&self) -> DownloadSnapshot {
        let inner = self.inner.lock();
        DownloadSnapshot {
            url: inner.url.clone(),
            destination: inner.destination.clone(),
            total_bytes: inner.total,
            bytes_transferred: inner.transferred,
            state: inner.state,
            last_error: inner.last_error.as_ref().map(ToString::to_string),
            observers: inner.observers.len(),
        }
    }
}

/// Fetches model artifacts into local storage.
///
/// Downloads are single-flight per destination path: a request for a path
/// that already has a transfer in progress joins it as an observer and gets
/// the same progress stream and the same result. Bytes land in a `.part`
/// sibling first and are renamed onto the destination only once complete.
pub struct ArtifactDownloader {
    source: Arc<dyn ByteSource>,
    chunk_size: usize,
    expected_sha256: Option<String>,
    tasks: Mutex<HashMap<PathBuf, Arc<DownloadTask>>>,
    finished: Mutex<HashMap<PathBuf, DownloadSnapshot>>,
}

impl ArtifactDownloader {
    pub fn new(source: Arc<dyn ByteSource>) -> Self {
        Self {
            source,
            chunk_size: DEFAULT_CHUNK_SIZE,
            expected_sha256: None,
            tasks: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    #[must_use]
    pub fn with_expected_sha256(mut self, checksum: Option<String>) -> Self {
        self.expected_sha256 = checksum.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn download<F>(
        &self,
        url: &str,
        destination: &Path,
        progress: F,
    ) -> Result<PathBuf, DownloadError>
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let observer: ProgressCallback = Arc::new(progress);
        let mut tasks = self.tasks.lock();
        if let Some(existing) = tasks.get(destination).cloned() {
            drop(tasks);
            if existing.snapshot().url != url {
                warn!(
                    "joining download for {} started from a different url",
                    destination.display()
                );
            }
            debug!(
                "download for {} already in flight, attaching as observer",
                destination.display()
            );
            existing.attach(observer);
            return existing.wait();
        }
        let task = Arc::new(DownloadTask::new(url, destination, observer));
        tasks.insert(destination.to_path_buf(), task.clone());
        drop(tasks);

        let outcome = catch_unwind(AssertUnwindSafe(|| self.transfer(url, destination, &task)))
            .unwrap_or_else(|_| {
                discard_staging(&staging_path(destination));
                Err(DownloadError::IoFailure("download aborted by a panic".into()))
            });
        match &outcome {
            Ok(path) => info!("artifact downloaded to {}", path.display()),
            Err(err) => warn!("artifact download from {url} failed: {err}"),
        }

        // Unregister before settling so a request arriving after the result
        // is published starts a fresh task.
        {
            let mut tasks = self.tasks.lock();
            tasks.remove(destination);
            task.finish(outcome.clone());
            self.finished
                .lock()
                .insert(destination.to_path_buf(), task.snapshot());
        }
        outcome
    }

    /// Live task for `destination`, or the last finished one.
    pub fn snapshot(&self, destination: &Path) -> Option<DownloadSnapshot> {
        let live = self.tasks.lock().get(destination).cloned();
        if let Some(task) = live {
            return Some(task.snapshot());
        }
        self.finished.lock().get(destination).cloned()
    }

    pub fn is_in_flight(&self, destination: &Path) -> bool {
        self.tasks.lock().contains_key(destination)
    }

    fn transfer(
        &self,
        url: &str,
        destination: &Path,
        task: &DownloadTask,
    ) -> Result<PathBuf, DownloadError> {
        info!("downloading {url} to {}", destination.display());
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| DownloadError::io("create destination directory", err))?;
        }

        let stream = self
            .source
            .open(url)
            .map_err(|err| DownloadError::io("open remote stream", err))?;
        if !stream.is_success() {
            return Err(DownloadError::RemoteFailure(stream.status));
        }
        task.begin(stream.content_length);

        let staging = staging_path(destination);
        let result = self
            .stream_to_file(stream, &staging, task)
            .and_then(|()| self.verify(&staging))
            .and_then(|()| {
                fs::rename(&staging, destination)
                    .map_err(|err| DownloadError::io("move artifact into place", err))
            });

        if result.is_err() {
            discard_staging(&staging);
        }
        result.map(|()| destination.to_path_buf())
    }

    fn stream_to_file(
        &self,
        mut stream: RemoteStream,
        staging: &Path,
        task: &DownloadTask,
    ) -> Result<(), DownloadError> {
        let mut file =
            File::create(staging).map_err(|err| DownloadError::io("create staging file", err))?;
        let mut buffer = vec![0u8; self.chunk_size];
        let mut transferred = 0u64;
        loop {
            let read = match stream.body.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(DownloadError::io("read download chunk", err)),
            };
            file.write_all(&buffer[..read])
                .map_err(|err| DownloadError::io("write download chunk", err))?;
            transferred += read as u64;
            task.report(transferred);
        }

        if let Some(expected) = stream.content_length {
            if transferred < expected {
                return Err(DownloadError::IoFailure(format!(
                    "stream ended after {transferred} of {expected} bytes"
                )));
            }
        }

        file.sync_all()
            .map_err(|err| DownloadError::io("flush staging file", err))?;
        Ok(())
    }

    fn verify(&self, staging: &Path) -> Result<(), DownloadError> {
        let Some(expected) = &self.expected_sha256 else {
            return Ok(());
        };
        let actual =
            compute_sha256(staging).map_err(|err| DownloadError::io("hash artifact", err))?;
        if checksum_matches(expected, &actual) {
            Ok(())
        } else {
            Err(DownloadError::IntegrityFailure {
                expected: expected.clone(),
                actual,
            })
        }
    }
}

// A panicking observer must not unwind through the transfer and strand the task.
fn notify(observer: &ProgressCallback, percent: u8) {
    if catch_unwind(AssertUnwindSafe(|| observer(percent))).is_err() {
        warn!("download progress observer panicked at {percent}%");
    }
}

fn discard_staging(staging: &Path) {
    if let Err(err) = fs::remove_file(staging) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!("failed to remove staging file {}: {err}", staging.display());
        }
    }
}

#[must_use]
pub fn staging_path(destination: &Path) -> PathBuf {
    let mut name: OsString = destination
        .file_name()
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| OsString::from("artifact"));
    name.push(STAGING_SUFFIX);
    destination.with_file_name(name)
}

fn percent_of(transferred: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (transferred.saturating_mul(100) / total).min(100) as u8
}
