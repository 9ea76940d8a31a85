use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::connectivity::ConnectivityState;
use crate::models::ModelState;

/// Composite availability snapshot. Always rebuilt from its three inputs,
/// never edited field by field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub connectivity: ConnectivityState,
    pub model_state: ModelState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_progress: Option<u8>,
}

impl Default for Status {
    fn default() -> Self {
        Self::compose(ConnectivityState::Unknown, ModelState::Unloaded, None)
    }
}

impl Status {
    #[must_use]
    pub fn compose(
        connectivity: ConnectivityState,
        model_state: ModelState,
        download_progress: Option<u8>,
    ) -> Self {
        Self {
            connectivity,
            model_state,
            download_progress: download_progress.map(|percent| percent.min(100)),
        }
    }

    #[must_use]
    pub fn is_model_ready(&self) -> bool {
        self.model_state == ModelState::Ready
    }

    /// Why a local generation request would be refused, `None` when ready.
    #[must_use]
    pub fn unavailable_reason(&self) -> Option<UnavailableReason> {
        match (self.model_state, self.connectivity) {
            (ModelState::Ready, _) => None,
            (ModelState::Failed, _) => Some(UnavailableReason::ModelLoadFailed),
            (ModelState::Unloaded, ConnectivityState::Offline) => {
                Some(UnavailableReason::OfflineNoModel)
            }
            _ => Some(UnavailableReason::ModelNotInitialized),
        }
    }

    /// Short human readable summary for the status bar.
    #[must_use]
    pub fn label(&self) -> String {
        let base = match (self.connectivity, self.model_state) {
            (ConnectivityState::Online, ModelState::Ready) => "Online | Offline Ready",
            (ConnectivityState::Online, ModelState::Loading) => "Online | Loading Offline Model",
            (ConnectivityState::Online, ModelState::Failed) => "Online | Offline Model Failed",
            (ConnectivityState::Online, ModelState::Unloaded) => "Online | Download Available",
            (ConnectivityState::Offline, ModelState::Ready) => "Offline (Local Model)",
            (ConnectivityState::Offline, ModelState::Loading) => "Offline (Loading Model)",
            (ConnectivityState::Offline, ModelState::Failed) => "Offline (Model Failed)",
            (ConnectivityState::Offline, ModelState::Unloaded) => "Offline (Model Not Found)",
            (ConnectivityState::Unknown, ModelState::Ready) => "Offline Ready",
            (ConnectivityState::Unknown, _) => "Checking Connection",
        };
        match self.download_progress {
            Some(percent) => format!("{base} | Downloading {percent}%"),
            None => base.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum UnavailableReason {
    #[serde(rename = "offline_no_model")]
    OfflineNoModel,
    #[serde(rename = "model_not_initialized")]
    ModelNotInitialized,
    #[serde(rename = "model_load_failed")]
    ModelLoadFailed,
}

impl UnavailableReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            UnavailableReason::OfflineNoModel => "offline_no_model",
            UnavailableReason::ModelNotInitialized => "model_not_initialized",
            UnavailableReason::ModelLoadFailed => "model_load_failed",
        }
    }
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
