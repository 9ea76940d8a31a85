use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use super::bridge::Bridge;
use super::events::StatusEvent;
use super::orchestrator::{AvailabilityOrchestrator, OrchestratorConfig};
use super::probe::HttpProbe;
use super::settings::{Settings, SettingsManager};
use crate::llm::InferenceEngine;
use crate::models::{ArtifactDownloader, HttpSource};

/// Process-wide wiring: settings, the desktop connectivity probe, the HTTP
/// artifact source and the orchestrator built from them.
pub struct AppState {
    settings: Arc<SettingsManager>,
    orchestrator: Arc<AvailabilityOrchestrator>,
}

impl AppState {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Result<Self> {
        let settings = Arc::new(SettingsManager::new()?);
        Self::with_settings(settings, engine)
    }

    pub fn with_settings(
        settings: Arc<SettingsManager>,
        engine: Arc<dyn InferenceEngine>,
    ) -> Result<Self> {
        let current = settings.read();
        let probe = HttpProbe::new(current.probe_url.clone(), current.probe_interval())?;
        let downloader = downloader_for(&current)?;

        let mut config = OrchestratorConfig::new(settings.artifact_path());
        config.startup_poll_delay = current.startup_poll_delay();
        config.auto_initialize = current.auto_initialize;
        info!("model artifact path {}", config.artifact_path.display());

        let orchestrator =
            AvailabilityOrchestrator::new(Arc::new(probe), downloader, engine, config)
                .context("create availability orchestrator")?;
        Ok(Self {
            settings,
            orchestrator: Arc::new(orchestrator),
        })
    }

    pub fn settings_manager(&self) -> Arc<SettingsManager> {
        self.settings.clone()
    }

    pub fn orchestrator(&self) -> Arc<AvailabilityOrchestrator> {
        self.orchestrator.clone()
    }

    pub fn start(&self) {
        self.orchestrator.start();
    }

    pub fn bridge(&self) -> (Bridge, tokio::sync::mpsc::UnboundedReceiver<StatusEvent>) {
        Bridge::new(self.orchestrator.clone())
    }

    pub fn shutdown(&self) {
        self.orchestrator.shutdown();
    }
}

fn downloader_for(settings: &Settings) -> Result<ArtifactDownloader> {
    let source = HttpSource::new()?;
    Ok(ArtifactDownloader::new(Arc::new(source))
        .with_chunk_size(settings.chunk_size_bytes)
        .with_expected_sha256(settings.model_sha256.clone()))
}
