//! Local inference fallback: tracks connectivity, fetches a model artifact,
//! owns the native model and tells the UI whether local generation is
//! available.

pub mod core;
pub mod llm;
pub mod models;

pub use crate::core::bridge::{Bridge, BridgeError};
pub use crate::core::connectivity::{
    ConnectivityMonitor, ConnectivitySource, ConnectivityState, HostConnectivity,
    HostNotification, NetworkCapabilities,
};
pub use crate::core::events::{DownloadProgressEvent, StatusEvent};
pub use crate::core::orchestrator::{
    AvailabilityOrchestrator, OrchestratorConfig, OrchestratorError, SubscriptionId,
};
pub use crate::core::status::{Status, UnavailableReason};
pub use crate::models::{
    ArtifactDownloader, DownloadError, InferError, InitError, ModelLifecycle, ModelState,
};
