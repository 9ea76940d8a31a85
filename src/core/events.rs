use serde::Serialize;

use crate::core::connectivity::ConnectivityState;
use crate::core::status::Status;
use crate::models::ModelState;

pub const EVENT_NETWORK_STATUS: &str = "network-status-change";
pub const EVENT_DOWNLOAD_PROGRESS: &str = "model-download-progress";

/// Status as delivered to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub is_online: bool,
    pub is_model_ready: bool,
    pub status: String,
    pub connectivity: ConnectivityState,
    pub model_state: ModelState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_progress: Option<u8>,
}

impl From<Status> for StatusEvent {
    fn from(status: Status) -> Self {
        Self {
            is_online: status.connectivity.is_online(),
            is_model_ready: status.is_model_ready(),
            status: status.label(),
            connectivity: status.connectivity,
            model_state: status.model_state,
            download_progress: status.download_progress,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadProgressEvent {
    pub progress: u8,
}

#[cfg(feature = "tauri-bridge")]
pub use self::tauri_emit::*;

#[cfg(feature = "tauri-bridge")]
mod tauri_emit {
    use tauri::{AppHandle, Emitter, Runtime};

    use super::*;
    use crate::core::orchestrator::{AvailabilityOrchestrator, SubscriptionId};

    pub fn emit_status<R: Runtime>(app: &AppHandle<R>, event: &StatusEvent) {
        let _ = app.emit(EVENT_NETWORK_STATUS, event.clone());
    }

    pub fn emit_download_progress<R: Runtime>(app: &AppHandle<R>, progress: u8) {
        let _ = app.emit(EVENT_DOWNLOAD_PROGRESS, DownloadProgressEvent { progress });
    }

    /// Mirrors every status change into the webview.
    pub fn forward_status<R: Runtime>(
        orchestrator: &AvailabilityOrchestrator,
        app: AppHandle<R>,
    ) -> SubscriptionId {
        orchestrator.subscribe(move |status| emit_status(&app, &StatusEvent::from(status)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_payload_uses_ui_field_names() {
        let status = Status::compose(ConnectivityState::Online, ModelState::Ready, None);
        let json = serde_json::to_value(StatusEvent::from(status)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "isOnline": true,
                "isModelReady": true,
                "status": "Online | Offline Ready",
                "connectivity": "online",
                "modelState": "ready",
            })
        );
    }

    #[test]
    fn unknown_connectivity_is_not_online() {
        let event = StatusEvent::from(Status::default());
        assert!(!event.is_online);
        assert!(!event.is_model_ready);
        assert_eq!(event.download_progress, None);
    }
}
