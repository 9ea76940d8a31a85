use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::error;

use super::events::{DownloadProgressEvent, StatusEvent};
use super::orchestrator::{AvailabilityOrchestrator, OrchestratorError, SubscriptionId};
use crate::models::{DownloadError, InferError, InitError};

/// Error shape handed to the UI. `code` is stable and machine readable;
/// unavailability reasons pass through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{message}")]
pub struct BridgeError {
    pub code: String,
    pub message: String,
}

impl BridgeError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<OrchestratorError> for BridgeError {
    fn from(err: OrchestratorError) -> Self {
        let message = err.to_string();
        let code = match &err {
            OrchestratorError::Unavailable(reason) => reason.as_str(),
            OrchestratorError::EmptyPrompt => "prompt_required",
            OrchestratorError::Download(DownloadError::RemoteFailure(_)) => {
                "download_remote_failure"
            }
            OrchestratorError::Download(DownloadError::IoFailure(_)) => "download_io_failure",
            OrchestratorError::Download(DownloadError::IntegrityFailure { .. }) => {
                "download_integrity_failure"
            }
            OrchestratorError::Init(InitError::NativeLoadFailure) => "native_load_failure",
            OrchestratorError::Init(InitError::MissingArtifact(_)) => "missing_artifact",
            OrchestratorError::Inference(InferError::NativeInferFailure) => "native_infer_failure",
            OrchestratorError::Inference(InferError::NotReady) => "model_not_initialized",
            OrchestratorError::ShutDown => "shut_down",
        };
        Self::new(code, message)
    }
}

/// Async facade for a UI layer. Blocking work runs on the tokio blocking
/// pool and status changes arrive on the channel returned by `new`.
pub struct Bridge {
    orchestrator: Arc<AvailabilityOrchestrator>,
    subscription: SubscriptionId,
}

impl Bridge {
    pub fn new(
        orchestrator: Arc<AvailabilityOrchestrator>,
    ) -> (Self, UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = unbounded_channel();
        let subscription = orchestrator.subscribe(move |status| {
            let _ = tx.send(StatusEvent::from(status));
        });
        (
            Self {
                orchestrator,
                subscription,
            },
            rx,
        )
    }

    pub fn status(&self) -> StatusEvent {
        StatusEvent::from(self.orchestrator.status())
    }

    pub async fn download_model<F>(&self, url: String, progress: F) -> Result<PathBuf, BridgeError>
    where
        F: Fn(DownloadProgressEvent) + Send + Sync + 'static,
    {
        let orchestrator = self.orchestrator.clone();
        run_blocking(move || {
            orchestrator.request_download_with_progress(&url, move |percent| {
                progress(DownloadProgressEvent { progress: percent })
            })
        })
        .await
    }

    /// Loads the artifact at `path`, or the configured artifact when `None`.
    pub async fn initialize_model(&self, path: Option<PathBuf>) -> Result<(), BridgeError> {
        let orchestrator = self.orchestrator.clone();
        run_blocking(move || match path {
            Some(path) => orchestrator.request_initialize(&path),
            None => orchestrator.request_initialize_default(),
        })
        .await
    }

    pub async fn generate_response(&self, prompt: String) -> Result<String, BridgeError> {
        let orchestrator = self.orchestrator.clone();
        run_blocking(move || orchestrator.request_generate(&prompt)).await
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.orchestrator.unsubscribe(self.subscription);
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T, BridgeError>
where
    F: FnOnce() -> Result<T, OrchestratorError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(result) => result.map_err(BridgeError::from),
        Err(err) => {
            error!("bridge task failed: {err:?}");
            Err(BridgeError::new("internal", "background task failed"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};
    use std::path::Path;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tempfile::tempdir;
    use tokio::time::timeout;

    use crate::core::connectivity::HostConnectivity;
    use crate::core::orchestrator::OrchestratorConfig;
    use crate::llm::InferenceEngine;
    use crate::models::{ArtifactDownloader, ByteSource, ModelState, RemoteStream};

    struct Upper;

    impl InferenceEngine for Upper {
        fn load(&self, _path: &Path) -> bool {
            true
        }

        fn infer(&self, prompt: &str) -> String {
            prompt.to_uppercase()
        }

        fn unload(&self) {}
    }

    struct Payload;

    impl ByteSource for Payload {
        fn open(&self, _url: &str) -> io::Result<RemoteStream> {
            Ok(RemoteStream {
                status: 200,
                content_length: Some(64),
                body: Box::new(Cursor::new(vec![1u8; 64])),
            })
        }
    }

    fn bridge(dir: &Path) -> (Bridge, UnboundedReceiver<StatusEvent>) {
        let mut config = OrchestratorConfig::new(dir.join("model.gguf"));
        config.startup_poll_delay = Duration::from_secs(60);
        let orchestrator = AvailabilityOrchestrator::new(
            Arc::new(HostConnectivity::new()),
            ArtifactDownloader::new(Arc::new(Payload)).with_chunk_size(16),
            Arc::new(Upper),
            config,
        )
        .unwrap();
        Bridge::new(Arc::new(orchestrator))
    }

    #[tokio::test]
    async fn unavailable_reason_reaches_the_caller_verbatim() {
        let dir = tempdir().unwrap();
        let (bridge, _events) = bridge(dir.path());
        let err = bridge.generate_response("hi".into()).await.unwrap_err();
        assert_eq!(err.code, "model_not_initialized");

        let err = bridge.generate_response(String::new()).await.unwrap_err();
        assert_eq!(err.code, "prompt_required");
        assert_eq!(err.message, "Prompt is required.");
    }

    #[tokio::test]
    async fn download_initialize_generate() {
        let dir = tempdir().unwrap();
        let (bridge, mut events) = bridge(dir.path());
        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = progress.clone();

        let path = bridge
            .download_model("https://host/model".into(), move |event| {
                sink.lock().push(event.progress)
            })
            .await
            .unwrap();
        assert!(path.is_file());
        assert_eq!(*progress.lock(), vec![25, 50, 75, 100]);

        bridge.initialize_model(None).await.unwrap();
        assert_eq!(bridge.generate_response("hi".into()).await.unwrap(), "HI");

        let ready = timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if event.is_model_ready {
                    return event;
                }
            }
            panic!("status channel closed");
        })
        .await
        .unwrap();
        assert_eq!(ready.model_state, ModelState::Ready);
        assert_eq!(ready.download_progress, None);
    }

    #[tokio::test]
    async fn missing_artifact_is_reported() {
        let dir = tempdir().unwrap();
        let (bridge, _events) = bridge(dir.path());
        let err = bridge.initialize_model(None).await.unwrap_err();
        assert_eq!(err.code, "missing_artifact");
    }
}
